use argon2::{password_hash::{rand_core::OsRng, PasswordHash, SaltString}, Argon2, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, RunQueryDsl};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rocket::{http::Status, request::{FromRequest, Outcome}, Request};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::OtaConfig, error::ApiError, model::User, schema::users::dsl as users_dsl, MainDatabase};

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthToken {
	pub username: String,
	/// Expiration time
	pub exp: i64
}

impl AuthToken {
	pub fn new(username: String, expiry: DateTime<Utc>) -> Self {
		return Self { username, exp: expiry.timestamp() };
	}

	pub fn encode(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
		return encode(&Header::new(Algorithm::HS256), self, &EncodingKey::from_secret(secret.as_bytes()));
	}

	pub fn decode(token: &str, secret: &str) -> Result<Self, jsonwebtoken::errors::Error> {
		let validation = Validation::new(Algorithm::HS256);
		let data = decode::<AuthToken>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)?;
		return Ok(data.claims);
	}
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
	let salt = SaltString::generate(&mut OsRng);
	let hasher = Argon2::default();
	return hasher.hash_password(password.as_bytes(), &salt)
		.map(|hash| hash.to_string())
		.map_err(|err| ApiError::Internal(format!("password hashing failed: {}", err)));
}

pub fn verify_password(password: &str, stored: &str) -> bool {
	let Ok(parsed) = PasswordHash::new(stored) else {
		log::warn!("Stored password hash is not a valid PHC string");
		return false;
	};
	return Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok();
}

/// Device keys are random, so a plain digest is enough to avoid storing them
pub fn hash_device_key(key: &[u8]) -> String {
	return hex::encode(Sha256::digest(key));
}

/// A user identified by the bearer token of the request
#[derive(Debug)]
pub struct AuthenticatedUser(pub User);

/// An authenticated user with the administrator flag
#[derive(Debug)]
pub struct AdminUser(pub User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthenticatedUser {
	type Error = ApiError;

	async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
		let Some(config) = request.rocket().state::<OtaConfig>() else {
			return Outcome::Error((Status::InternalServerError, ApiError::Internal(String::from("configuration is not managed"))));
		};
		let token = request.headers().get_one("Authorization").and_then(|value| value.strip_prefix("Bearer "));
		let Some(token) = token else {
			return Outcome::Error((Status::Unauthorized, ApiError::Unauthorized));
		};
		let claims = match AuthToken::decode(token.trim(), &config.jwt_secret) {
			Ok(claims) => claims,
			Err(err) => {
				log::debug!("Rejected bearer token: {}", err);
				return Outcome::Error((Status::Unauthorized, ApiError::Unauthorized));
			}
		};
		let database = match request.guard::<MainDatabase>().await {
			Outcome::Success(database) => database,
			_ => {
				return Outcome::Error((Status::ServiceUnavailable, ApiError::Internal(String::from("no database connection available"))));
			}
		};
		let found = database.run(move |conn| {
			users_dsl::users.filter(users_dsl::username.eq(claims.username)).first::<User>(conn)
		}).await;
		return match found {
			Ok(user) => Outcome::Success(AuthenticatedUser(user)),
			Err(diesel::result::Error::NotFound) => Outcome::Error((Status::Unauthorized, ApiError::Unauthorized)),
			Err(err) => Outcome::Error((Status::InternalServerError, ApiError::from(err))),
		};
	}
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
	type Error = ApiError;

	async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
		return match request.guard::<AuthenticatedUser>().await {
			Outcome::Success(AuthenticatedUser(user)) if user.is_admin => Outcome::Success(AdminUser(user)),
			Outcome::Success(_) => Outcome::Error((Status::Forbidden, ApiError::Forbidden)),
			Outcome::Error(err) => Outcome::Error(err),
			Outcome::Forward(status) => Outcome::Forward(status),
		};
	}
}
