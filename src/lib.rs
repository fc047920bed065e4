//! Over-the-air firmware management for a fleet of small devices: user and
//! device registration, a firmware repository with a verification pipeline,
//! staged rollouts, and the TCP bridge devices keep their session on.

use std::sync::Arc;

use device_connector::{session::SessionRegistry, DeviceBridge};
use rocket::{figment::Figment, tokio::sync::Notify, Build, Rocket};
use rocket_sync_db_pools::database;
use rollout::dispatcher::RolloutDispatcher;

pub mod agent;
pub mod auth;
pub mod config;
pub mod db;
pub mod device_connector;
pub mod device_routes;
pub mod error;
pub mod firmware;
pub mod firmware_routes;
pub mod model;
pub mod provisioning;
pub mod rollout;
pub mod rollout_routes;
pub mod schema;
pub mod user_routes;
pub mod version;

#[cfg(test)]
mod tests_common;

#[database("main")]
pub struct MainDatabase(diesel::SqliteConnection);

/// Assembles the server. The session registry and the dispatcher wake
/// handle are managed up front since both the bridge and the routes use them.
pub fn build_rocket(figment: Figment) -> Rocket<Build> {
	return rocket::custom(figment)
		.manage(SessionRegistry::default())
		.manage(Arc::new(Notify::new()))
		.mount("/user", user_routes::routes())
		.mount("/device", device_routes::routes())
		.mount("/firmware", firmware_routes::routes())
		.mount("/rollout", rollout_routes::routes())
		.register("/", error::catchers())
		.attach(MainDatabase::fairing())
		.attach(db::migration_fairing())
		.attach(config::config_fairing())
		.attach(DeviceBridge::fairing())
		.attach(RolloutDispatcher::fairing());
}
