use std::sync::Arc;

use chrono::NaiveDateTime;
use diesel::{delete, insert_into, prelude::*, update};
use rocket::{delete, get, patch, post, routes, serde::json::Json, tokio::sync::Notify, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
	auth::{hash_device_key, AuthenticatedUser},
	config::OtaConfig,
	db::{format_id, new_id, now, parse_id},
	device_connector::session::SessionRegistry,
	error::{ApiError, ApiResult},
	firmware,
	model::{Device, DeviceUpdate, FirmwareStatus, UpdateState},
	provisioning::server_identity,
	rollout::transaction,
	schema::{device::dsl as device_dsl, device_update::dsl as update_dsl},
	version::FirmwareVersion,
	MainDatabase,
};

pub fn routes() -> Vec<Route> {
	return routes![
		register_device,
		list_devices,
		get_device,
		rename_device,
		delete_device,
		trigger_update,
		update_history,
	];
}

pub fn parse_mac(text: &str) -> Result<Vec<u8>, ApiError> {
	let invalid = || ApiError::InvalidInput(format!("`{}` is not a MAC address of the form aa:bb:cc:dd:ee:ff", text));
	let parts: Vec<&str> = text.split(':').collect();
	if parts.len() != 6 || parts.iter().any(|part| part.len() != 2) {
		return Err(invalid());
	}
	return parts.iter().map(|part| u8::from_str_radix(part, 16).map_err(|_| invalid())).collect();
}

pub fn format_mac(mac: &[u8]) -> String {
	return mac.iter().map(|byte| format!("{:02x}", byte)).collect::<Vec<_>>().join(":");
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeviceView {
	pub device_id: String,
	pub name: String,
	pub mac_address: String,
	pub hardware_model: String,
	pub firmware_version: Option<String>,
	pub registered_at: NaiveDateTime,
	pub last_seen: Option<NaiveDateTime>,
	pub online: bool,
}

impl DeviceView {
	fn new(device: Device, sessions: &SessionRegistry) -> Self {
		return Self {
			online: sessions.is_online(&device.device_id),
			device_id: format_id(&device.device_id),
			name: device.name,
			mac_address: format_mac(&device.mac_address),
			hardware_model: device.hardware_model,
			firmware_version: device.firmware_version,
			registered_at: device.registered_at,
			last_seen: device.last_seen,
		};
	}
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UpdateView {
	pub update_id: String,
	pub rollout_id: Option<String>,
	pub firmware_id: String,
	pub previous_version: Option<String>,
	pub state: UpdateState,
	pub attempts: i32,
	pub last_error: Option<String>,
	pub created_at: NaiveDateTime,
	pub updated_at: NaiveDateTime,
}

impl From<DeviceUpdate> for UpdateView {
	fn from(row: DeviceUpdate) -> Self {
		return Self {
			state: row.state(),
			update_id: format_id(&row.update_id),
			rollout_id: row.rollout_id.as_deref().map(format_id),
			firmware_id: format_id(&row.firmware_id),
			previous_version: row.previous_version,
			attempts: row.attempts,
			last_error: row.last_error,
			created_at: row.created_at,
			updated_at: row.updated_at,
		};
	}
}

/// Devices of other users are reported as missing
fn owned_device(conn: &mut SqliteConnection, user_id: &[u8], device_id: &[u8]) -> Result<Device, ApiError> {
	return device_dsl::device
		.find(device_id)
		.filter(device_dsl::user_id.eq(user_id))
		.first::<Device>(conn)
		.optional()?
		.ok_or(ApiError::NotFound("Device"));
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RegisterDeviceData {
	pub name: String,
	pub mac_address: String,
	pub hardware_model: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RegistrationResult {
	pub device_id: String,
	/// Shown only once, the server keeps a digest
	pub auth_key: String,
	/// Server address, device id and key lines of the provisioning request
	pub provisioning: String,
}

fn validate_name(name: &str) -> Result<(), ApiError> {
	if name.trim().is_empty() || name.len() > 64 {
		return Err(ApiError::InvalidInput(String::from("name must be 1 to 64 characters long")));
	}
	return Ok(());
}

fn validate_hardware_model(model: &str) -> Result<(), ApiError> {
	let valid = (1..=32).contains(&model.len()) && model.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if !valid {
		return Err(ApiError::InvalidInput(String::from("hardware_model must be 1 to 32 letters, digits, '_' or '-'")));
	}
	return Ok(());
}

#[post("/register", data = "<register_data>")]
async fn register_device(database: MainDatabase, config: &State<OtaConfig>, user: AuthenticatedUser, register_data: Json<RegisterDeviceData>) -> ApiResult<RegistrationResult> {
	let data = register_data.0;
	validate_name(&data.name)?;
	validate_hardware_model(&data.hardware_model)?;
	let mac_address = parse_mac(&data.mac_address)?;
	let auth_key: [u8; 16] = rand::random();

	let new_device = Device {
		device_id: new_id(),
		user_id: user.0.user_id.clone(),
		name: data.name,
		mac_address,
		hardware_model: data.hardware_model,
		auth_key_hash: hash_device_key(&auth_key),
		firmware_version: None,
		registered_at: now(),
		last_seen: None,
	};
	let device_id = new_device.device_id.clone();
	database.run(move |conn| insert_into(device_dsl::device).values(&new_device).execute(conn)).await?;
	log::info!("User {} registered device {}", user.0.username, format_id(&device_id));

	return Ok(Json(RegistrationResult {
		device_id: format_id(&device_id),
		auth_key: hex::encode(auth_key),
		provisioning: server_identity(&config.public_device_address, &device_id, &auth_key),
	}));
}

#[get("/")]
async fn list_devices(database: MainDatabase, sessions: &State<SessionRegistry>, user: AuthenticatedUser) -> ApiResult<Vec<DeviceView>> {
	let user_id = user.0.user_id;
	let devices = database.run(move |conn| {
		device_dsl::device.filter(device_dsl::user_id.eq(user_id)).order(device_dsl::registered_at.asc()).load::<Device>(conn)
	}).await?;
	return Ok(Json(devices.into_iter().map(|device| DeviceView::new(device, sessions)).collect()));
}

#[get("/<device_id>")]
async fn get_device(database: MainDatabase, sessions: &State<SessionRegistry>, user: AuthenticatedUser, device_id: &str) -> ApiResult<DeviceView> {
	let device_id = parse_id(device_id)?;
	let user_id = user.0.user_id;
	let device = database.run(move |conn| owned_device(conn, &user_id, &device_id)).await?;
	return Ok(Json(DeviceView::new(device, sessions)));
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RenameDeviceData {
	pub name: String,
}

#[patch("/<device_id>", data = "<rename_data>")]
async fn rename_device(database: MainDatabase, sessions: &State<SessionRegistry>, user: AuthenticatedUser, device_id: &str, rename_data: Json<RenameDeviceData>) -> ApiResult<DeviceView> {
	let device_id = parse_id(device_id)?;
	let name = rename_data.0.name;
	validate_name(&name)?;
	let user_id = user.0.user_id;
	let device = database.run(move |conn| -> Result<Device, ApiError> {
		owned_device(conn, &user_id, &device_id)?;
		update(device_dsl::device.find(&device_id)).set(device_dsl::name.eq(name)).execute(conn)?;
		return owned_device(conn, &user_id, &device_id);
	}).await?;
	return Ok(Json(DeviceView::new(device, sessions)));
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct DeletionResult {
	pub cancelled_updates: usize,
}

#[delete("/<device_id>")]
async fn delete_device(database: MainDatabase, sessions: &State<SessionRegistry>, user: AuthenticatedUser, device_id: &str) -> ApiResult<DeletionResult> {
	let device_id = parse_id(device_id)?;
	let user_id = user.0.user_id;
	let lookup_id = device_id.clone();
	let cancelled = database.run(move |conn| {
		return conn.transaction(|conn| {
			owned_device(conn, &user_id, &lookup_id)?;
			let cancelled = transaction::cancel_open(conn, Some(lookup_id.as_slice()), None)?;
			// Update history belongs to the device and goes with it
			delete(update_dsl::device_update.filter(update_dsl::device_id.eq(&lookup_id))).execute(conn)?;
			delete(device_dsl::device.find(&lookup_id)).execute(conn)?;
			return Ok::<_, ApiError>(cancelled);
		});
	}).await?;
	sessions.disconnect(&device_id);
	log::info!("Device {} deleted, {} open update(s) cancelled", format_id(&device_id), cancelled);
	return Ok(Json(DeletionResult { cancelled_updates: cancelled }));
}

#[derive(Deserialize, Serialize, Debug)]
pub struct TriggerUpdateData {
	pub firmware_id: String,
}

#[post("/<device_id>/update", data = "<trigger_data>")]
async fn trigger_update(database: MainDatabase, wake: &State<Arc<Notify>>, user: AuthenticatedUser, device_id: &str, trigger_data: Json<TriggerUpdateData>) -> ApiResult<UpdateView> {
	let device_id = parse_id(device_id)?;
	let firmware_id = parse_id(&trigger_data.firmware_id)?;
	let user_id = user.0.user_id;
	let created = database.run(move |conn| {
		return conn.transaction(|conn| {
			let device = owned_device(conn, &user_id, &device_id)?;
			let target = firmware::find(conn, &firmware_id)?;
			if target.status() != FirmwareStatus::Approved {
				return Err(ApiError::InvalidTransition(format!("only approved firmware can be installed, this one is {}", target.status())));
			}
			if target.hardware_model != device.hardware_model {
				return Err(ApiError::InvalidInput(format!("firmware is built for {}, the device is a {}", target.hardware_model, device.hardware_model)));
			}
			let current = device.firmware_version.as_deref().and_then(|version| version.parse::<FirmwareVersion>().ok());
			if current.is_some() && current == target.version.parse::<FirmwareVersion>().ok() {
				return Err(ApiError::InvalidInput(format!("device already runs {}", target.version)));
			}
			if transaction::open_for_device(conn, &device.device_id)?.is_some() {
				return Err(ApiError::UpdateInProgress);
			}
			return Ok(transaction::insert_pending(conn, &device, &target, None)?);
		});
	}).await?;
	log::info!("User {} requested update {} for device {}", user.0.username, format_id(&created.update_id), format_id(&created.device_id));
	wake.notify_one();
	return Ok(Json(UpdateView::from(created)));
}

#[get("/<device_id>/updates")]
async fn update_history(database: MainDatabase, user: AuthenticatedUser, device_id: &str) -> ApiResult<Vec<UpdateView>> {
	let device_id = parse_id(device_id)?;
	let user_id = user.0.user_id;
	let history = database.run(move |conn| -> Result<Vec<DeviceUpdate>, ApiError> {
		owned_device(conn, &user_id, &device_id)?;
		return Ok(transaction::history_for_device(conn, &device_id)?);
	}).await?;
	return Ok(Json(history.into_iter().map(UpdateView::from).collect()));
}
