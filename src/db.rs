use chrono::{NaiveDateTime, Utc};
use diesel::{sql_query, RunQueryDsl};
#[cfg(test)]
use diesel::{Connection, SqliteConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use rocket::fairing::AdHoc;

use crate::{error::ApiError, MainDatabase};

pub const MIGRATIONS: EmbeddedMigrations = diesel_migrations::embed_migrations!("./migrations");

/// Length of every generated identifier
pub const ID_LEN: usize = 16;

pub fn migration_fairing() -> AdHoc {
	return AdHoc::try_on_ignite("Database migrations", |rocket| async {
		let Some(database) = MainDatabase::get_one(&rocket).await else {
			log::error!("No connection available for running migrations");
			return Err(rocket);
		};
		let result = database.run(|conn| {
			sql_query("PRAGMA journal_mode = WAL").execute(conn).ok();
			return conn.run_pending_migrations(MIGRATIONS).map(|applied| applied.len()).map_err(|err| err.to_string());
		}).await;
		match result {
			Ok(applied) => {
				log::info!("Applied {} pending migration(s)", applied);
				return Ok(rocket);
			}
			Err(err) => {
				log::error!("Failed to run migrations: {}", err);
				return Err(rocket);
			}
		}
	});
}

pub fn new_id() -> Vec<u8> {
	return rand::random::<[u8; ID_LEN]>().to_vec();
}

pub fn format_id(id: &[u8]) -> String {
	return hex::encode(id);
}

pub fn parse_id(text: &str) -> Result<Vec<u8>, ApiError> {
	return match hex::decode(text) {
		Ok(bytes) if bytes.len() == ID_LEN => Ok(bytes),
		_ => Err(ApiError::InvalidInput(format!("`{}` is not a valid identifier", text))),
	};
}

pub fn now() -> NaiveDateTime {
	return Utc::now().naive_utc();
}

#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
	let mut conn = SqliteConnection::establish(":memory:").unwrap();
	conn.run_pending_migrations(MIGRATIONS).unwrap();
	return conn;
}

#[cfg(test)]
mod test {
	use super::{format_id, new_id, parse_id, test_connection};

	#[test]
	fn ids_round_trip_through_hex() {
		let id = new_id();
		assert_eq!(id.len(), 16);
		assert_eq!(parse_id(&format_id(&id)).unwrap(), id);
	}

	#[test]
	fn rejects_short_or_non_hex_ids() {
		assert!(parse_id("abcd").is_err());
		assert!(parse_id("zz000000000000000000000000000000").is_err());
	}

	#[test]
	fn migrations_apply_on_empty_database() {
		test_connection();
	}
}
