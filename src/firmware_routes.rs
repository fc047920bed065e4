use chrono::NaiveDateTime;
use diesel::Connection;
use rocket::{data::ToByteUnit, fs::NamedFile, get, post, routes, serde::json::Json, Data, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
	auth::{AdminUser, AuthenticatedUser},
	config::OtaConfig,
	db::{format_id, new_id, parse_id},
	error::{ApiError, ApiResult},
	firmware::{self, verification, NewFirmware},
	model::{Firmware, FirmwareStatus, VerificationResult},
	rollout,
	version::FirmwareVersion,
	MainDatabase,
};

pub fn routes() -> Vec<Route> {
	return routes![
		upload_firmware,
		list_firmware,
		get_firmware,
		download_artifact,
		verify_firmware,
		record_verification,
		approve_firmware,
		reject_firmware,
		retire_firmware,
	];
}

/// Target name of review decisions stored among the verification results
const REVIEW_TARGET: &str = "review";

#[derive(Serialize, Deserialize, Debug)]
pub struct FirmwareView {
	pub firmware_id: String,
	pub hardware_model: String,
	pub version: String,
	pub description: String,
	pub size: i64,
	pub sha256: String,
	pub status: FirmwareStatus,
	pub uploaded_by: String,
	pub reviewed_by: Option<String>,
	pub created_at: NaiveDateTime,
	pub status_changed_at: NaiveDateTime,
}

impl From<Firmware> for FirmwareView {
	fn from(firmware: Firmware) -> Self {
		return Self {
			status: firmware.status(),
			firmware_id: format_id(&firmware.firmware_id),
			hardware_model: firmware.hardware_model,
			version: firmware.version,
			description: firmware.description,
			size: firmware.size,
			sha256: firmware.sha256,
			uploaded_by: format_id(&firmware.uploaded_by),
			reviewed_by: firmware.reviewed_by.as_deref().map(format_id),
			created_at: firmware.created_at,
			status_changed_at: firmware.status_changed_at,
		};
	}
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ResultView {
	pub target: String,
	pub automated: bool,
	pub passed: bool,
	pub detail: String,
	pub recorded_at: NaiveDateTime,
}

impl From<VerificationResult> for ResultView {
	fn from(result: VerificationResult) -> Self {
		return Self {
			target: result.target,
			automated: result.automated,
			passed: result.passed,
			detail: result.detail,
			recorded_at: result.recorded_at,
		};
	}
}

#[derive(Serialize, Deserialize, Debug)]
pub struct FirmwareReport {
	pub firmware: FirmwareView,
	pub results: Vec<ResultView>,
}

impl FirmwareReport {
	fn new(firmware: Firmware, results: Vec<VerificationResult>) -> Self {
		return Self { firmware: FirmwareView::from(firmware), results: results.into_iter().map(ResultView::from).collect() };
	}
}

#[post("/upload?<hardware_model>&<version>&<description>", data = "<artifact>")]
async fn upload_firmware(
	database: MainDatabase,
	config: &State<OtaConfig>,
	admin: AdminUser,
	hardware_model: &str,
	version: &str,
	description: Option<&str>,
	artifact: Data<'_>,
) -> ApiResult<FirmwareView> {
	let version: FirmwareVersion = version.parse().map_err(|err| ApiError::InvalidInput(format!("{}", err)))?;
	let valid_model = (1..=32).contains(&hardware_model.len()) && hardware_model.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if !valid_model {
		return Err(ApiError::InvalidInput(String::from("hardware_model must be 1 to 32 letters, digits, '_' or '-'")));
	}
	let hardware_model = hardware_model.to_owned();
	let lookup_model = hardware_model.clone();
	if database.run(move |conn| firmware::version_exists(conn, &lookup_model, version)).await? {
		return Err(ApiError::AlreadyExists(format!("{} {} was already uploaded", hardware_model, version)));
	}

	let bytes = artifact.open(config.max_firmware_size.bytes()).into_bytes().await?;
	if !bytes.is_complete() {
		return Err(ApiError::PayloadTooLarge(config.max_firmware_size));
	}
	let bytes = bytes.into_inner();
	if bytes.is_empty() {
		return Err(ApiError::InvalidInput(String::from("firmware image is empty")));
	}

	let firmware_id = new_id();
	let stored = firmware::store_artifact(&config.firmware_dir, &firmware_id, &bytes).await?;
	let new = NewFirmware {
		firmware_id,
		hardware_model,
		version,
		description: description.unwrap_or_default().to_owned(),
		artifact: stored.clone(),
		uploaded_by: admin.0.user_id,
	};
	let inserted = database.run(move |conn| firmware::insert(conn, new)).await;
	let inserted = match inserted {
		Ok(inserted) => inserted,
		Err(err) => {
			// Lost a race on (model, version), the artifact has no owner now
			rocket::tokio::fs::remove_file(&stored.path).await.ok();
			return Err(ApiError::from(err));
		}
	};
	log::info!("Uploaded firmware {} {} ({} bytes, sha256 {})", inserted.hardware_model, inserted.version, inserted.size, inserted.sha256);
	return Ok(Json(FirmwareView::from(inserted)));
}

#[get("/?<status>")]
async fn list_firmware(database: MainDatabase, user: AuthenticatedUser, status: Option<&str>) -> ApiResult<Vec<FirmwareView>> {
	let requested = match status {
		Some(text) => Some(text.parse::<FirmwareStatus>().map_err(|err| ApiError::InvalidInput(err.to_string()))?),
		None => None,
	};
	let status = if user.0.is_admin {
		requested
	} else {
		match requested {
			None | Some(FirmwareStatus::Approved) => Some(FirmwareStatus::Approved),
			Some(_) => return Ok(Json(Vec::new())),
		}
	};
	let listed = database.run(move |conn| firmware::list(conn, status)).await?;
	return Ok(Json(listed.into_iter().map(FirmwareView::from).collect()));
}

#[get("/<firmware_id>")]
async fn get_firmware(database: MainDatabase, user: AuthenticatedUser, firmware_id: &str) -> ApiResult<FirmwareReport> {
	let firmware_id = parse_id(firmware_id)?;
	let (found, results) = database.run(move |conn| -> Result<(Firmware, Vec<VerificationResult>), ApiError> {
		let found = firmware::find(conn, &firmware_id)?;
		let results = firmware::results_for(conn, &firmware_id)?;
		return Ok((found, results));
	}).await?;
	if !user.0.is_admin && found.status() != FirmwareStatus::Approved {
		return Err(ApiError::NotFound("Firmware"));
	}
	return Ok(Json(FirmwareReport::new(found, results)));
}

#[get("/<firmware_id>/artifact")]
async fn download_artifact(database: MainDatabase, _admin: AdminUser, firmware_id: &str) -> Result<NamedFile, ApiError> {
	let firmware_id = parse_id(firmware_id)?;
	let found = database.run(move |conn| firmware::find(conn, &firmware_id)).await?;
	return Ok(NamedFile::open(&found.artifact_path).await?);
}

#[post("/<firmware_id>/verify")]
async fn verify_firmware(database: MainDatabase, config: &State<OtaConfig>, _admin: AdminUser, firmware_id: &str) -> ApiResult<FirmwareReport> {
	let firmware_id = parse_id(firmware_id)?;
	let (verified, results) = verification::run_pipeline(&database, config, firmware_id).await?;
	log::info!("Verification of {} {} finished as {}", verified.hardware_model, verified.version, verified.status());
	return Ok(Json(FirmwareReport::new(verified, results)));
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ManualResultData {
	pub target: String,
	pub passed: bool,
	#[serde(default)]
	pub detail: String,
}

#[post("/<firmware_id>/verification", data = "<result_data>")]
async fn record_verification(database: MainDatabase, _admin: AdminUser, firmware_id: &str, result_data: Json<ManualResultData>) -> ApiResult<FirmwareReport> {
	let firmware_id = parse_id(firmware_id)?;
	let ManualResultData { target, passed, detail } = result_data.0;
	if target.trim().is_empty() || target.len() > 64 || target == REVIEW_TARGET {
		return Err(ApiError::InvalidInput(String::from("target must be a 1 to 64 character device name")));
	}
	let (found, results) = database.run(move |conn| verification::record_manual(conn, &firmware_id, &target, passed, &detail)).await?;
	return Ok(Json(FirmwareReport::new(found, results)));
}

#[post("/<firmware_id>/approve")]
async fn approve_firmware(database: MainDatabase, admin: AdminUser, firmware_id: &str) -> ApiResult<FirmwareView> {
	let firmware_id = parse_id(firmware_id)?;
	let reviewer = admin.0.user_id;
	let approved = database.run(move |conn| firmware::transition(conn, &firmware_id, FirmwareStatus::Approved, Some(reviewer.as_slice()))).await?;
	return Ok(Json(FirmwareView::from(approved)));
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RejectData {
	pub reason: String,
}

#[post("/<firmware_id>/reject", data = "<reject_data>")]
async fn reject_firmware(database: MainDatabase, admin: AdminUser, firmware_id: &str, reject_data: Json<RejectData>) -> ApiResult<FirmwareReport> {
	let firmware_id = parse_id(firmware_id)?;
	let reason = reject_data.0.reason;
	if reason.trim().is_empty() {
		return Err(ApiError::InvalidInput(String::from("a rejection needs a reason")));
	}
	let reviewer = admin.0.user_id;
	let (rejected, results) = database.run(move |conn| {
		return conn.transaction(|conn| {
			let rejected = firmware::transition(conn, &firmware_id, FirmwareStatus::Rejected, Some(reviewer.as_slice()))?;
			firmware::record_result(conn, &firmware_id, REVIEW_TARGET, false, false, &reason)?;
			let results = firmware::results_for(conn, &firmware_id)?;
			return Ok::<_, ApiError>((rejected, results));
		});
	}).await?;
	return Ok(Json(FirmwareReport::new(rejected, results)));
}

#[post("/<firmware_id>/retire")]
async fn retire_firmware(database: MainDatabase, admin: AdminUser, firmware_id: &str) -> ApiResult<FirmwareView> {
	let firmware_id = parse_id(firmware_id)?;
	let reviewer = admin.0.user_id;
	let (retired, stopped) = database.run(move |conn| {
		return conn.transaction(|conn| {
			let retired = firmware::transition(conn, &firmware_id, FirmwareStatus::Retired, Some(reviewer.as_slice()))?;
			let stopped = rollout::abort_for_firmware(conn, &firmware_id)?;
			return Ok::<_, ApiError>((retired, stopped));
		});
	}).await?;
	if stopped > 0 {
		log::info!("Retiring {} {} stopped {} rollout(s) and update(s)", retired.hardware_model, retired.version, stopped);
	}
	return Ok(Json(FirmwareView::from(retired)));
}

#[cfg(test)]
mod test {
	use rocket::http::{ContentType, Status};

	use super::{FirmwareReport, FirmwareView, ManualResultData, RejectData};
	use crate::{
		error::Error,
		model::FirmwareStatus,
		tests_common::{approved_firmware, bearer, create_local_async_client, login, register, upload},
	};

	#[rocket::async_test]
	async fn upload_verify_approve() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "admin").await;
		let token = login(&client, "admin").await;
		let uploaded = upload(&client, &token, "esp32", "1.0.0", b"image bytes").await;
		assert_eq!(uploaded.status, FirmwareStatus::Staged);
		assert_eq!(uploaded.size, 11);

		let response = client.post(format!("/firmware/{}/verify", uploaded.firmware_id)).header(bearer(&token)).dispatch().await;
		assert_eq!(response.status(), Status::Ok);
		let report = response.into_json::<FirmwareReport>().await.unwrap();
		assert_eq!(report.firmware.status, FirmwareStatus::Verified);
		assert!(report.results.iter().all(|result| result.passed && result.automated));
		assert!(report.results.iter().any(|result| result.target == "simulated:esp32-bench"));

		let response = client.post(format!("/firmware/{}/approve", uploaded.firmware_id)).header(bearer(&token)).dispatch().await;
		assert_eq!(response.into_json::<FirmwareView>().await.unwrap().status, FirmwareStatus::Approved);

		let response = client.get(format!("/firmware/{}/artifact", uploaded.firmware_id)).header(bearer(&token)).dispatch().await;
		assert_eq!(response.into_bytes().await.unwrap(), b"image bytes".to_vec());
	}

	#[rocket::async_test]
	async fn upload_rejects_bad_input() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "admin").await;
		let token = login(&client, "admin").await;
		upload(&client, &token, "esp32", "1.0.0", b"image").await;

		let response = client.post("/firmware/upload?hardware_model=esp32&version=1.0.0").header(bearer(&token)).header(ContentType::Binary).body(b"again".to_vec()).dispatch().await;
		assert_eq!(response.status(), Status::Conflict);
		let response = client.post("/firmware/upload?hardware_model=esp32&version=1.x").header(bearer(&token)).header(ContentType::Binary).body(b"image".to_vec()).dispatch().await;
		assert_eq!(response.status(), Status::BadRequest);
		let response = client.post("/firmware/upload?hardware_model=esp32&version=1.0.1").header(bearer(&token)).header(ContentType::Binary).body(Vec::new()).dispatch().await;
		assert_eq!(response.status(), Status::BadRequest);
		let oversized = vec![0u8; 64 * 1024 + 1];
		let response = client.post("/firmware/upload?hardware_model=esp32&version=1.0.2").header(bearer(&token)).header(ContentType::Binary).body(oversized).dispatch().await;
		assert_eq!(response.status(), Status::PayloadTooLarge);
	}

	#[rocket::async_test]
	async fn downgrade_and_unknown_model_fail_verification() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "admin").await;
		let token = login(&client, "admin").await;
		approved_firmware(&client, &token, "esp32", "2.0.0", b"current").await;

		let older = upload(&client, &token, "esp32", "1.5.0", b"older").await;
		let report = client.post(format!("/firmware/{}/verify", older.firmware_id)).header(bearer(&token)).dispatch().await.into_json::<FirmwareReport>().await.unwrap();
		assert_eq!(report.firmware.status, FirmwareStatus::Rejected);
		assert!(report.results.iter().any(|result| result.target == "version" && !result.passed));

		let unknown = upload(&client, &token, "nrf52", "1.0.0", b"nordic").await;
		let report = client.post(format!("/firmware/{}/verify", unknown.firmware_id)).header(bearer(&token)).dispatch().await.into_json::<FirmwareReport>().await.unwrap();
		assert_eq!(report.firmware.status, FirmwareStatus::Rejected);
		assert!(report.results.iter().any(|result| result.detail.contains("no simulated target")));

		let response = client.post(format!("/firmware/{}/approve", unknown.firmware_id)).header(bearer(&token)).dispatch().await;
		assert_eq!(response.status(), Status::Conflict);
		assert_eq!(response.into_json::<Error>().await.unwrap().code, "InvalidTransition");
	}

	#[rocket::async_test]
	async fn manual_results_and_rejection() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "admin").await;
		let token = login(&client, "admin").await;
		let staged = upload(&client, &token, "esp32", "1.0.0", b"image").await;

		let response = client.post(format!("/firmware/{}/verification", staged.firmware_id)).header(bearer(&token)).json(&ManualResultData {
			target: String::from("lab board 7"),
			passed: true,
			detail: String::from("boots, wifi ok"),
		}).dispatch().await;
		let report = response.into_json::<FirmwareReport>().await.unwrap();
		assert_eq!(report.results.len(), 1);
		assert!(!report.results[0].automated);

		let response = client.post(format!("/firmware/{}/reject", staged.firmware_id)).header(bearer(&token)).json(&RejectData { reason: String::from("bricks rev A boards") }).dispatch().await;
		let report = response.into_json::<FirmwareReport>().await.unwrap();
		assert_eq!(report.firmware.status, FirmwareStatus::Rejected);
		assert!(report.results.iter().any(|result| result.target == "review" && result.detail == "bricks rev A boards"));
	}

	#[rocket::async_test]
	async fn non_admins_see_only_approved_firmware() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "admin").await;
		register(&client, "viewer").await;
		let admin = login(&client, "admin").await;
		let viewer = login(&client, "viewer").await;
		let approved = approved_firmware(&client, &admin, "esp32", "1.0.0", b"image").await;
		let staged = upload(&client, &admin, "esp32", "1.1.0", b"newer").await;

		let listed = client.get("/firmware").header(bearer(&viewer)).dispatch().await.into_json::<Vec<FirmwareView>>().await.unwrap();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].firmware_id, approved);
		let all = client.get("/firmware").header(bearer(&admin)).dispatch().await.into_json::<Vec<FirmwareView>>().await.unwrap();
		assert_eq!(all.len(), 2);

		let response = client.get(format!("/firmware/{}", staged.firmware_id)).header(bearer(&viewer)).dispatch().await;
		assert_eq!(response.status(), Status::NotFound);
		let response = client.post(format!("/firmware/{}/approve", staged.firmware_id)).header(bearer(&viewer)).dispatch().await;
		assert_eq!(response.status(), Status::Forbidden);
		let response = client.get(format!("/firmware/{}/artifact", approved)).header(bearer(&viewer)).dispatch().await;
		assert_eq!(response.status(), Status::Forbidden);
	}

	#[rocket::async_test]
	async fn retire_ends_the_lifecycle() {
		let (client, _guard) = create_local_async_client().await;
		register(&client, "admin").await;
		let token = login(&client, "admin").await;
		let approved = approved_firmware(&client, &token, "esp32", "1.0.0", b"image").await;

		let response = client.post(format!("/firmware/{}/retire", approved)).header(bearer(&token)).dispatch().await;
		assert_eq!(response.into_json::<FirmwareView>().await.unwrap().status, FirmwareStatus::Retired);
		let response = client.post(format!("/firmware/{}/retire", approved)).header(bearer(&token)).dispatch().await;
		assert_eq!(response.status(), Status::Conflict);
	}
}
