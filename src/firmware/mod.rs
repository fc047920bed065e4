//! Firmware repository: artifact storage on disk and firmware metadata in
//! the database.

use std::{io::SeekFrom, path::{Path, PathBuf}};

use diesel::{insert_into, prelude::*, update, SqliteConnection};
use rocket::tokio::{fs, io::{AsyncReadExt, AsyncSeekExt}};
use sha2::{Digest, Sha256};

use crate::{
	db::{format_id, new_id, now},
	error::ApiError,
	model::{Firmware, FirmwareStatus, VerificationResult},
	schema::{firmware::dsl as firmware_dsl, verification_result::dsl as result_dsl},
	version::FirmwareVersion,
};

pub mod verification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
	pub path: PathBuf,
	pub size: u64,
	pub sha256: String,
}

pub fn artifact_path(directory: &Path, firmware_id: &[u8]) -> PathBuf {
	return directory.join(format!("{}.bin", format_id(firmware_id)));
}

/// Writes the artifact next to its final location first, so a crash never
/// leaves a partial file under a firmware id.
pub async fn store_artifact(directory: &Path, firmware_id: &[u8], bytes: &[u8]) -> std::io::Result<StoredArtifact> {
	fs::create_dir_all(directory).await?;
	let path = artifact_path(directory, firmware_id);
	let temp_path = path.with_extension("part");
	fs::write(&temp_path, bytes).await?;
	fs::rename(&temp_path, &path).await?;
	return Ok(StoredArtifact {
		path,
		size: bytes.len() as u64,
		sha256: hex::encode(Sha256::digest(bytes)),
	});
}

/// Streams the file through sha256, returning its size and hex digest
pub async fn checksum_file(path: &Path) -> std::io::Result<(u64, String)> {
	let mut file = fs::File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buffer = [0u8; 8192];
	let mut size = 0u64;
	loop {
		let read = file.read(&mut buffer).await?;
		if read == 0 {
			break;
		}
		size += read as u64;
		hasher.update(&buffer[..read]);
	}
	return Ok((size, hex::encode(hasher.finalize())));
}

/// Reads up to `length` bytes at `offset`. Shorter only at the end of the file.
pub async fn read_chunk(path: &Path, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
	let mut file = fs::File::open(path).await?;
	file.seek(SeekFrom::Start(offset)).await?;
	let mut chunk = Vec::with_capacity(length);
	file.take(length as u64).read_to_end(&mut chunk).await?;
	return Ok(chunk);
}

pub struct NewFirmware {
	pub firmware_id: Vec<u8>,
	pub hardware_model: String,
	pub version: FirmwareVersion,
	pub description: String,
	pub artifact: StoredArtifact,
	pub uploaded_by: Vec<u8>,
}

pub fn insert(conn: &mut SqliteConnection, new: NewFirmware) -> QueryResult<Firmware> {
	let timestamp = now();
	let row = Firmware {
		firmware_id: new.firmware_id,
		hardware_model: new.hardware_model,
		version: new.version.to_string(),
		description: new.description,
		artifact_path: new.artifact.path.to_string_lossy().into_owned(),
		size: new.artifact.size as i64,
		sha256: new.artifact.sha256,
		status: FirmwareStatus::Staged.as_str().to_owned(),
		uploaded_by: new.uploaded_by,
		reviewed_by: None,
		created_at: timestamp,
		status_changed_at: timestamp,
	};
	insert_into(firmware_dsl::firmware).values(&row).execute(conn)?;
	return Ok(row);
}

pub fn version_exists(conn: &mut SqliteConnection, hardware_model: &str, version: FirmwareVersion) -> QueryResult<bool> {
	let count: i64 = firmware_dsl::firmware
		.filter(firmware_dsl::hardware_model.eq(hardware_model))
		.filter(firmware_dsl::version.eq(version.to_string()))
		.count()
		.get_result(conn)?;
	return Ok(count > 0);
}

pub fn find(conn: &mut SqliteConnection, firmware_id: &[u8]) -> Result<Firmware, ApiError> {
	return firmware_dsl::firmware.find(firmware_id).first::<Firmware>(conn).optional()?.ok_or(ApiError::NotFound("Firmware"));
}

pub fn list(conn: &mut SqliteConnection, status: Option<FirmwareStatus>) -> QueryResult<Vec<Firmware>> {
	let mut query = firmware_dsl::firmware.order(firmware_dsl::created_at.desc()).into_boxed();
	if let Some(status) = status {
		query = query.filter(firmware_dsl::status.eq(status.as_str()));
	}
	return query.load::<Firmware>(conn);
}

/// Highest version of the model that was ever released to devices
pub fn latest_released_version(conn: &mut SqliteConnection, hardware_model: &str) -> QueryResult<Option<FirmwareVersion>> {
	let released = [FirmwareStatus::Approved.as_str(), FirmwareStatus::Retired.as_str()];
	let versions: Vec<String> = firmware_dsl::firmware
		.filter(firmware_dsl::hardware_model.eq(hardware_model))
		.filter(firmware_dsl::status.eq_any(released))
		.select(firmware_dsl::version)
		.load(conn)?;
	return Ok(versions.iter().filter_map(|version| version.parse::<FirmwareVersion>().ok()).max());
}

/// Moves firmware to `next`, enforcing the lifecycle
pub fn transition(conn: &mut SqliteConnection, firmware_id: &[u8], next: FirmwareStatus, reviewer: Option<&[u8]>) -> Result<Firmware, ApiError> {
	return conn.transaction(|conn| {
		let current = find(conn, firmware_id)?;
		if !current.status().can_transition_to(next) {
			return Err(ApiError::InvalidTransition(format!("firmware is {} and cannot become {}", current.status(), next)));
		}
		let timestamp = now();
		update(firmware_dsl::firmware.find(firmware_id))
			.set((
				firmware_dsl::status.eq(next.as_str()),
				firmware_dsl::status_changed_at.eq(timestamp),
			))
			.execute(conn)?;
		if let Some(reviewer) = reviewer {
			update(firmware_dsl::firmware.find(firmware_id)).set(firmware_dsl::reviewed_by.eq(Some(reviewer.to_vec()))).execute(conn)?;
		}
		log::info!("Firmware {} {} moved from {} to {}", current.hardware_model, current.version, current.status(), next);
		return find(conn, firmware_id);
	});
}

pub fn record_result(conn: &mut SqliteConnection, firmware_id: &[u8], target: &str, automated: bool, passed: bool, detail: &str) -> QueryResult<VerificationResult> {
	let row = VerificationResult {
		result_id: new_id(),
		firmware_id: firmware_id.to_vec(),
		target: target.to_owned(),
		automated,
		passed,
		detail: detail.to_owned(),
		recorded_at: now(),
	};
	insert_into(result_dsl::verification_result).values(&row).execute(conn)?;
	return Ok(row);
}

pub fn results_for(conn: &mut SqliteConnection, firmware_id: &[u8]) -> QueryResult<Vec<VerificationResult>> {
	return result_dsl::verification_result
		.filter(result_dsl::firmware_id.eq(firmware_id))
		.order(result_dsl::recorded_at.asc())
		.load(conn);
}
