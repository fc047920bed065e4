use std::path::PathBuf;

use rocket::{fairing::AdHoc, tokio::fs};
use serde::Deserialize;

/// Server settings, read from the `ota` table of the Rocket figment
/// (`Rocket.toml`, or `ROCKET_OTA={...}` in the environment).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
	/// HMAC secret for user tokens
	pub jwt_secret: String,
	pub token_lifetime_minutes: i64,
	/// Port of the device bridge. 0 picks a free port.
	pub device_port: u16,
	/// Address handed to devices during provisioning
	pub public_device_address: String,
	pub firmware_dir: PathBuf,
	pub max_firmware_size: u64,
	/// Largest firmware chunk served in one packet
	pub chunk_size: u16,
	pub dispatch_interval_secs: u64,
	pub update_timeout_secs: i64,
	pub max_update_attempts: i32,
	pub default_batch_size: i32,
	pub default_failure_threshold_percent: i32,
	pub verification_targets: Vec<SimulatedTarget>,
}

/// Simulated device the verification pipeline installs firmware on
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedTarget {
	pub name: String,
	pub hardware_model: String,
	pub base_version: String,
}

pub const DEVELOPMENT_SECRET: &str = "development-secret-change-me";

impl Default for OtaConfig {
	fn default() -> Self {
		return Self {
			jwt_secret: String::from(DEVELOPMENT_SECRET),
			token_lifetime_minutes: 60 * 24,
			device_port: 3333,
			public_device_address: String::from("127.0.0.1:3333"),
			firmware_dir: PathBuf::from("firmware"),
			max_firmware_size: 16 * 1024 * 1024,
			chunk_size: 1024,
			dispatch_interval_secs: 5,
			update_timeout_secs: 600,
			max_update_attempts: 3,
			default_batch_size: 10,
			default_failure_threshold_percent: 20,
			verification_targets: Vec::new(),
		};
	}
}

impl OtaConfig {
	fn validate(&self) -> Result<(), String> {
		if self.jwt_secret.is_empty() {
			return Err(String::from("jwt_secret must not be empty"));
		}
		if self.chunk_size == 0 {
			return Err(String::from("chunk_size must be positive"));
		}
		// Offers carry the image size as u32
		if self.max_firmware_size == 0 || self.max_firmware_size > u32::MAX as u64 {
			return Err(format!("max_firmware_size must be between 1 and {}", u32::MAX));
		}
		if self.max_update_attempts < 1 {
			return Err(String::from("max_update_attempts must be at least 1"));
		}
		if self.default_batch_size < 1 || !(1..=100).contains(&self.default_failure_threshold_percent) {
			return Err(String::from("default rollout settings are out of range"));
		}
		return Ok(());
	}
}

/// Extracts `OtaConfig`, prepares the firmware directory and manages the config
pub fn config_fairing() -> AdHoc {
	return AdHoc::try_on_ignite("OTA configuration", |rocket| async {
		let figment = rocket.figment();
		let extracted = if figment.contains("ota") { figment.extract_inner::<OtaConfig>("ota") } else { Ok(OtaConfig::default()) };
		let config = match extracted {
			Ok(config) => config,
			Err(err) => {
				log::error!("Invalid `ota` configuration: {}", err);
				return Err(rocket);
			}
		};
		if let Err(err) = config.validate() {
			log::error!("Invalid `ota` configuration: {}", err);
			return Err(rocket);
		}
		if config.jwt_secret == DEVELOPMENT_SECRET {
			log::warn!("Using the development JWT secret, set ota.jwt_secret before deploying");
		}
		if let Err(err) = fs::create_dir_all(&config.firmware_dir).await {
			log::error!("Can't create firmware directory {}: {}", config.firmware_dir.display(), err);
			return Err(rocket);
		}
		return Ok(rocket.manage(config));
	});
}
