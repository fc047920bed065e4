use chrono::{Duration, NaiveDateTime, Utc};
use diesel::{insert_into, prelude::*};
use rocket::{get, post, routes, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
	auth::{hash_password, verify_password, AuthToken, AuthenticatedUser},
	config::OtaConfig,
	db::{format_id, new_id, now},
	error::{ApiError, ApiResult},
	model::User,
	schema::users::dsl as users_dsl,
	MainDatabase,
};

pub fn routes() -> Vec<Route> {
	return routes![
		register_user,
		login_user,
		current_user,
	];
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UserView {
	pub user_id: String,
	pub username: String,
	pub email: String,
	pub is_admin: bool,
	pub created_at: NaiveDateTime,
}

impl From<User> for UserView {
	fn from(user: User) -> Self {
		return Self {
			user_id: format_id(&user.user_id),
			username: user.username,
			email: user.email,
			is_admin: user.is_admin,
			created_at: user.created_at,
		};
	}
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RegisterUserData {
	pub username: String,
	pub password: String,
	pub email: String,
}

impl RegisterUserData {
	fn validate(&self) -> Result<(), ApiError> {
		let username_valid = (3..=32).contains(&self.username.len())
			&& self.username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
		if !username_valid {
			return Err(ApiError::InvalidInput(String::from("username must be 3 to 32 letters, digits, '_' or '-'")));
		}
		if self.password.len() < 8 || self.password.len() > 128 {
			return Err(ApiError::InvalidInput(String::from("password must be 8 to 128 characters long")));
		}
		let email_valid = match self.email.split_once('@') {
			Some((local, domain)) => !local.is_empty() && domain.contains('.') && !self.email.contains(char::is_whitespace),
			None => false,
		};
		if !email_valid || self.email.len() > 254 {
			return Err(ApiError::InvalidInput(String::from("email is not a valid address")));
		}
		return Ok(());
	}
}

#[post("/register", data = "<register_user_data>")]
async fn register_user(database: MainDatabase, register_user_data: Json<RegisterUserData>) -> ApiResult<UserView> {
	let data = register_user_data.0;
	data.validate()?;
	let hashed_password = hash_password(&data.password)?;
	let created = database.run(move |conn| {
		return conn.transaction(|conn| {
			// Whoever sets the server up first administers it
			let existing: i64 = users_dsl::users.count().get_result(conn)?;
			let user = User {
				user_id: new_id(),
				username: data.username,
				password: hashed_password,
				email: data.email,
				is_admin: existing == 0,
				created_at: now(),
			};
			insert_into(users_dsl::users).values(&user).execute(conn)?;
			return Ok::<_, diesel::result::Error>(user);
		});
	}).await?;
	log::info!("Registered user {}{}", created.username, if created.is_admin { " as administrator" } else { "" });
	return Ok(Json(UserView::from(created)));
}

#[derive(Deserialize, Serialize, Debug)]
pub struct LoginData {
	pub username: String,
	pub password: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct LoginResult {
	pub token: String,
	pub expires_at: i64,
}

#[post("/login", data = "<login_data>")]
async fn login_user(database: MainDatabase, config: &State<OtaConfig>, login_data: Json<LoginData>) -> ApiResult<LoginResult> {
	let LoginData { username, password } = login_data.0;
	let lookup = username.clone();
	let user = database.run(move |conn| {
		users_dsl::users.filter(users_dsl::username.eq(lookup)).first::<User>(conn).optional()
	}).await?;
	let Some(user) = user.filter(|user| verify_password(&password, &user.password)) else {
		log::info!("Failed login for {}", username);
		return Err(ApiError::InvalidCredentials);
	};
	let expiry = Utc::now() + Duration::minutes(config.token_lifetime_minutes);
	let claims = AuthToken::new(user.username, expiry);
	let token = claims.encode(&config.jwt_secret).map_err(|err| ApiError::Internal(format!("token encoding failed: {}", err)))?;
	return Ok(Json(LoginResult { token, expires_at: claims.exp }));
}

#[get("/me")]
async fn current_user(user: AuthenticatedUser) -> ApiResult<UserView> {
	return Ok(Json(UserView::from(user.0)));
}

#[cfg(test)]
mod test {
	use rocket::http::{Header, Status};

	use super::{LoginData, LoginResult, RegisterUserData, UserView};
	use crate::{error::Error, tests_common::{bearer, create_local_async_client, login, register}};

	#[rocket::async_test]
	async fn first_user_becomes_admin() {
		let (client, _guard) = create_local_async_client().await;
		let first = register(&client, "first_user").await;
		let second = register(&client, "second_user").await;
		assert!(first.is_admin);
		assert!(!second.is_admin);
	}

	#[rocket::async_test]
	async fn duplicate_username_conflicts() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "taken").await;
		let response = client.post("/user/register").json(&RegisterUserData {
			username: String::from("taken"),
			password: String::from("password1"),
			email: String::from("other@example.com"),
		}).dispatch().await;
		assert_eq!(response.status(), Status::Conflict);
		assert_eq!(response.into_json::<Error>().await.unwrap().code, "AlreadyExists");
	}

	#[rocket::async_test]
	async fn invalid_registration_is_rejected() {
		let (client, _guard) = create_local_async_client().await;
		let response = client.post("/user/register").json(&RegisterUserData {
			username: String::from("ok_name"),
			password: String::from("short"),
			email: String::from("user@example.com"),
		}).dispatch().await;
		assert_eq!(response.status(), Status::BadRequest);
		assert_eq!(response.into_json::<Error>().await.unwrap().code, "InvalidInput");
	}

	#[rocket::async_test]
	async fn login_and_profile() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "someone").await;
		let token = login(&client, "someone").await;

		let response = client.get("/user/me").header(bearer(&token)).dispatch().await;
		assert_eq!(response.status(), Status::Ok);
		let profile = response.into_json::<UserView>().await.unwrap();
		assert_eq!(profile.username, "someone");
		assert_eq!(profile.email, "someone@example.com");
	}

	#[rocket::async_test]
	async fn bad_credentials_and_tokens() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "someone").await;
		let response = client.post("/user/login").json(&LoginData {
			username: String::from("someone"),
			password: String::from("wrong password"),
		}).dispatch().await;
		assert_eq!(response.status(), Status::Unauthorized);
		assert_eq!(response.into_json::<Error>().await.unwrap().code, "InvalidCredentials");

		let response = client.get("/user/me").dispatch().await;
		assert_eq!(response.status(), Status::Unauthorized);
		let response = client.get("/user/me").header(Header::new("Authorization", "Bearer not-a-token")).dispatch().await;
		assert_eq!(response.status(), Status::Unauthorized);
		assert_eq!(response.into_json::<Error>().await.unwrap().code, "Unauthorized");

		let response = client.post("/user/login").json(&LoginData {
			username: String::from("someone"),
			password: String::from("password1"),
		}).dispatch().await;
		assert!(response.into_json::<LoginResult>().await.unwrap().expires_at > 0);
	}
}
