use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rocket::{catch, catchers, http::Status, response::{self, status, Responder}, serde::json::Json, Catcher, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of every error response
#[derive(Deserialize, Serialize, Debug)]
pub struct Error {
	pub code: String,
	pub explanation: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("{0}")]
	InvalidInput(String),
	#[error("{0}")]
	AlreadyExists(String),
	#[error("{0} does not exist")]
	NotFound(&'static str),
	#[error("missing or invalid authorization token")]
	Unauthorized,
	#[error("wrong username or password")]
	InvalidCredentials,
	#[error("this action requires an administrator")]
	Forbidden,
	#[error("{0}")]
	InvalidTransition(String),
	#[error("the device already has an update in progress")]
	UpdateInProgress,
	#[error("request body exceeds {0} bytes")]
	PayloadTooLarge(u64),
	#[error("database error: {0}")]
	Database(DieselError),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("{0}")]
	Internal(String),
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

impl ApiError {
	pub fn status(&self) -> Status {
		return match self {
			ApiError::InvalidInput(_) => Status::BadRequest,
			ApiError::AlreadyExists(_) | ApiError::InvalidTransition(_) | ApiError::UpdateInProgress => Status::Conflict,
			ApiError::NotFound(_) => Status::NotFound,
			ApiError::Unauthorized | ApiError::InvalidCredentials => Status::Unauthorized,
			ApiError::Forbidden => Status::Forbidden,
			ApiError::PayloadTooLarge(_) => Status::PayloadTooLarge,
			ApiError::Database(_) | ApiError::Io(_) | ApiError::Internal(_) => Status::InternalServerError,
		};
	}

	pub fn code(&self) -> &'static str {
		return match self {
			ApiError::InvalidInput(_) => "InvalidInput",
			ApiError::AlreadyExists(_) => "AlreadyExists",
			ApiError::NotFound(_) => "NotFound",
			ApiError::Unauthorized => "Unauthorized",
			ApiError::InvalidCredentials => "InvalidCredentials",
			ApiError::Forbidden => "Forbidden",
			ApiError::InvalidTransition(_) => "InvalidTransition",
			ApiError::UpdateInProgress => "UpdateInProgress",
			ApiError::PayloadTooLarge(_) => "PayloadTooLarge",
			ApiError::Database(_) | ApiError::Io(_) | ApiError::Internal(_) => "InternalError",
		};
	}
}

impl From<DieselError> for ApiError {
	fn from(err: DieselError) -> Self {
		return match err {
			DieselError::NotFound => ApiError::NotFound("Resource"),
			DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
				ApiError::AlreadyExists(String::from("One of the unique parameters already exists"))
			}
			other => ApiError::Database(other),
		};
	}
}

impl<'r> Responder<'r, 'static> for ApiError {
	fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
		let status = self.status();
		let explanation = if status == Status::InternalServerError {
			// Internal details stay in the log
			log::error!("Request to {} failed: {}", request.uri(), self);
			String::from("Internal server error")
		} else {
			self.to_string()
		};
		let body = Error { code: String::from(self.code()), explanation };
		return status::Custom(status, Json(body)).respond_to(request);
	}
}

/// Keeps failures raised outside handlers, such as rejected guards or
/// malformed bodies, in the same JSON shape
#[catch(default)]
fn default_catcher(status: Status, _request: &Request) -> status::Custom<Json<Error>> {
	let code = match status.code {
		401 => "Unauthorized",
		403 => "Forbidden",
		404 => "NotFound",
		400 | 422 => "InvalidInput",
		413 => "PayloadTooLarge",
		503 => "Unavailable",
		500..=599 => "InternalError",
		_ => "RequestFailed",
	};
	let explanation = status.reason().unwrap_or("Request failed").to_owned();
	return status::Custom(status, Json(Error { code: String::from(code), explanation }));
}

pub fn catchers() -> Vec<Catcher> {
	return catchers![default_catcher];
}

#[cfg(test)]
mod test {
	use diesel::result::Error as DieselError;
	use rocket::http::Status;

	use super::ApiError;

	#[test]
	fn diesel_not_found_maps_to_404() {
		let err = ApiError::from(DieselError::NotFound);
		assert_eq!(err.status(), Status::NotFound);
		assert_eq!(err.code(), "NotFound");
	}

	#[test]
	fn other_diesel_errors_are_internal() {
		let err = ApiError::from(DieselError::RollbackTransaction);
		assert_eq!(err.status(), Status::InternalServerError);
		assert_eq!(err.code(), "InternalError");
	}
}
