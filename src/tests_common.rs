use std::{sync::Arc, time::Duration};

use rocket::{
	http::{ContentType, Header, Status},
	local::asynchronous::Client,
	serde::json::json,
};
use tempfile::TempDir;

use crate::{
	agent::{client::AgentClient, slots::MemorySlots, AgentError, ImageSlot, TransactionState, UpdateTransaction},
	build_rocket,
	device_connector::{packets::ResultCode, DeviceBridge},
	device_routes::{DeviceView, RegisterDeviceData, RegistrationResult, TriggerUpdateData, UpdateView},
	firmware_routes::FirmwareView,
	model::UpdateState,
	rollout::dispatcher::RolloutDispatcher,
	rollout_routes::{CreateRolloutData, RolloutView},
	user_routes::{LoginData, LoginResult, RegisterUserData, UserView},
	version::FirmwareVersion,
};

/// Client backed by a fresh database and firmware directory. The directory
/// lives as long as the returned guard.
pub async fn create_local_async_client() -> (Client, TempDir) {
	let directory = tempfile::tempdir().unwrap();
	let figment = rocket::Config::figment()
		.merge(("databases.main.url", directory.path().join("db.sqlite").display().to_string()))
		.merge(("databases.main.pool_size", 8))
		.merge(("ota.firmware_dir", directory.path().join("firmware").display().to_string()))
		.merge(("ota.device_port", 0))
		.merge(("ota.dispatch_interval_secs", 3600))
		.merge(("ota.max_firmware_size", 64 * 1024))
		.merge(("ota.verification_targets", json!([
			{ "name": "esp32-bench", "hardware_model": "esp32", "base_version": "0.0.1" },
			{ "name": "stm32-bench", "hardware_model": "stm32", "base_version": "0.0.1" },
		])));
	let client = Client::tracked(build_rocket(figment)).await.unwrap();
	return (client, directory);
}

pub fn bearer(token: &str) -> Header<'static> {
	return Header::new("Authorization", format!("Bearer {}", token));
}

pub async fn register(client: &Client, name: &str) -> UserView {
	let response = client.post("/user/register").json(&RegisterUserData {
		username: name.to_owned(),
		password: String::from("password1"),
		email: format!("{}@example.com", name),
	}).dispatch().await;
	assert_eq!(response.status(), Status::Ok);
	return response.into_json::<UserView>().await.unwrap();
}

pub async fn login(client: &Client, name: &str) -> String {
	let response = client.post("/user/login").json(&LoginData {
		username: name.to_owned(),
		password: String::from("password1"),
	}).dispatch().await;
	assert_eq!(response.status(), Status::Ok);
	return response.into_json::<LoginResult>().await.unwrap().token;
}

pub async fn register_device(client: &Client, token: &str, mac_address: &str, hardware_model: &str) -> RegistrationResult {
	let response = client.post("/device/register").header(bearer(token)).json(&RegisterDeviceData {
		name: format!("{} at {}", hardware_model, mac_address),
		mac_address: mac_address.to_owned(),
		hardware_model: hardware_model.to_owned(),
	}).dispatch().await;
	assert_eq!(response.status(), Status::Ok);
	return response.into_json::<RegistrationResult>().await.unwrap();
}

pub async fn upload(client: &Client, token: &str, hardware_model: &str, version: &str, image: &[u8]) -> FirmwareView {
	let response = client.post(format!("/firmware/upload?hardware_model={}&version={}", hardware_model, version))
		.header(bearer(token))
		.header(ContentType::Binary)
		.body(image.to_vec())
		.dispatch().await;
	assert_eq!(response.status(), Status::Ok);
	return response.into_json::<FirmwareView>().await.unwrap();
}

/// Uploads, verifies and approves an image, returning the firmware id
pub async fn approved_firmware(client: &Client, token: &str, hardware_model: &str, version: &str, image: &[u8]) -> String {
	let uploaded = upload(client, token, hardware_model, version, image).await;
	let response = client.post(format!("/firmware/{}/verify", uploaded.firmware_id)).header(bearer(token)).dispatch().await;
	assert_eq!(response.status(), Status::Ok);
	let response = client.post(format!("/firmware/{}/approve", uploaded.firmware_id)).header(bearer(token)).dispatch().await;
	assert_eq!(response.status(), Status::Ok);
	return uploaded.firmware_id;
}

fn credentials(registration: &RegistrationResult) -> ([u8; 16], [u8; 16]) {
	let mut device_id = [0u8; 16];
	let mut auth_key = [0u8; 16];
	hex::decode_to_slice(&registration.device_id, &mut device_id).unwrap();
	hex::decode_to_slice(&registration.auth_key, &mut auth_key).unwrap();
	return (device_id, auth_key);
}

async fn connect_agent(client: &Client, registration: &RegistrationResult, version: FirmwareVersion) -> Result<AgentClient, AgentError> {
	let port = client.rocket().state::<DeviceBridge>().unwrap().local_addr().port();
	let (device_id, auth_key) = credentials(registration);
	return AgentClient::connect(("127.0.0.1", port), device_id, auth_key, version).await;
}

async fn history(client: &Client, token: &str, device_id: &str) -> Vec<UpdateView> {
	let response = client.get(format!("/device/{}/updates", device_id)).header(bearer(token)).dispatch().await;
	return response.into_json::<Vec<UpdateView>>().await.unwrap();
}

#[rocket::async_test]
async fn device_pulls_and_installs_manual_update() {
	let (client, _guard) = create_local_async_client().await;
	register(&client, "admin").await;
	let token = login(&client, "admin").await;
	let registration = register_device(&client, &token, "aa:bb:cc:dd:ee:ff", "esp32").await;
	let image = b"new firmware image ".repeat(200);
	let firmware_id = approved_firmware(&client, &token, "esp32", "1.2.0", &image).await;

	let mut agent = connect_agent(&client, &registration, FirmwareVersion::new(1, 0, 0)).await.unwrap();
	agent.heartbeat().await.unwrap();
	let device = client.get(format!("/device/{}", registration.device_id)).header(bearer(&token)).dispatch().await.into_json::<DeviceView>().await.unwrap();
	assert!(device.online);
	assert_eq!(device.firmware_version.as_deref(), Some("1.0.0"));
	assert_eq!(agent.check_for_update(FirmwareVersion::new(1, 0, 0)).await.unwrap(), None);

	let response = client.post(format!("/device/{}/update", registration.device_id)).header(bearer(&token)).json(&TriggerUpdateData { firmware_id }).dispatch().await;
	assert_eq!(response.status(), Status::Ok);

	let offer = agent.check_for_update(FirmwareVersion::new(1, 0, 0)).await.unwrap().unwrap();
	assert_eq!(offer.version, FirmwareVersion::new(1, 2, 0));
	assert_eq!(offer.size as usize, image.len());
	let mut slots = MemorySlots::new(FirmwareVersion::new(1, 0, 0), b"factory image".to_vec());
	let state = UpdateTransaction::new(offer, 512).run(&mut agent, &mut slots).await.unwrap();
	assert_eq!(state, TransactionState::Succeeded);
	assert_eq!(slots.read_active().await.unwrap(), image);

	let device = client.get(format!("/device/{}", registration.device_id)).header(bearer(&token)).dispatch().await.into_json::<DeviceView>().await.unwrap();
	assert_eq!(device.firmware_version.as_deref(), Some("1.2.0"));
	let updates = history(&client, &token, &registration.device_id).await;
	assert_eq!(updates.len(), 1);
	assert_eq!(updates[0].state, UpdateState::Succeeded);
	assert_eq!(updates[0].previous_version.as_deref(), Some("1.0.0"));
}

#[rocket::async_test]
async fn rollout_is_pushed_to_connected_device() {
	let (client, _guard) = create_local_async_client().await;
	register(&client, "admin").await;
	let token = login(&client, "admin").await;
	let registration = register_device(&client, &token, "aa:bb:cc:dd:ee:fe", "esp32").await;
	let image = b"rolled out".to_vec();
	let firmware_id = approved_firmware(&client, &token, "esp32", "2.0.0", &image).await;
	let mut agent = connect_agent(&client, &registration, FirmwareVersion::new(1, 0, 0)).await.unwrap();

	let response = client.post("/rollout").header(bearer(&token)).json(&CreateRolloutData {
		firmware_id,
		batch_size: Some(5),
		failure_threshold_percent: Some(50),
	}).dispatch().await;
	let rollout = response.into_json::<RolloutView>().await.unwrap();
	assert_eq!(rollout.counts.total, 1);

	// The background pass may already have announced it, either way the device hears once
	let dispatcher = client.rocket().state::<Arc<RolloutDispatcher>>().unwrap();
	dispatcher.tick().await.unwrap();
	let offer = agent.next_pushed_offer(Duration::from_secs(5)).await.unwrap().unwrap();
	assert_eq!(offer.version, FirmwareVersion::new(2, 0, 0));

	let mut slots = MemorySlots::new(FirmwareVersion::new(1, 0, 0), b"factory image".to_vec());
	let state = UpdateTransaction::new(offer, 4).run(&mut agent, &mut slots).await.unwrap();
	assert_eq!(state, TransactionState::Succeeded);

	dispatcher.tick().await.unwrap();
	let finished = client.get(format!("/rollout/{}", rollout.rollout_id)).header(bearer(&token)).dispatch().await.into_json::<RolloutView>().await.unwrap();
	assert_eq!(finished.counts.succeeded, 1);
	assert_eq!(finished.status, crate::model::RolloutStatus::Completed);
}

#[rocket::async_test]
async fn bridge_rejects_wrong_key_and_forgets_unregistered_device() {
	let (client, _guard) = create_local_async_client().await;
	register(&client, "admin").await;
	let token = login(&client, "admin").await;
	let registration = register_device(&client, &token, "aa:bb:cc:dd:ee:fd", "esp32").await;

	let port = client.rocket().state::<DeviceBridge>().unwrap().local_addr().port();
	let (device_id, _) = credentials(&registration);
	let refused = AgentClient::connect(("127.0.0.1", port), device_id, [0; 16], FirmwareVersion::new(1, 0, 0)).await;
	assert!(matches!(refused, Err(AgentError::Rejected(ResultCode::BadCredentials))));

	let agent = connect_agent(&client, &registration, FirmwareVersion::new(1, 0, 0)).await.unwrap();
	agent.unregister().await.unwrap();
	let response = client.get(format!("/device/{}", registration.device_id)).header(bearer(&token)).dispatch().await;
	assert_eq!(response.status(), Status::NotFound);
}
