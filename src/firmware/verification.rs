//! Verification pipeline. Staged firmware must pass every automated check
//! before it can be approved for rollout.

use std::path::PathBuf;

use diesel::{Connection, SqliteConnection};

use super::{checksum_file, find, latest_released_version, read_chunk, record_result, results_for, transition};
use crate::{
	agent::{slots::MemorySlots, AgentError, TransactionState, FirmwareSource, UpdateOffer, UpdateTransaction},
	config::{OtaConfig, SimulatedTarget},
	device_connector::packets::{FailureDetail, ReportedState},
	error::ApiError,
	model::{Firmware, FirmwareStatus, VerificationResult},
	version::FirmwareVersion,
	MainDatabase,
};

pub const INTEGRITY_CHECK: &str = "integrity";
pub const VERSION_CHECK: &str = "version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
	pub target: String,
	pub passed: bool,
	pub detail: String,
}

impl CheckOutcome {
	fn pass(target: &str, detail: impl Into<String>) -> Self {
		return Self { target: target.to_owned(), passed: true, detail: detail.into() };
	}

	fn fail(target: &str, detail: impl Into<String>) -> Self {
		return Self { target: target.to_owned(), passed: false, detail: detail.into() };
	}
}

pub async fn check_integrity(firmware: &Firmware) -> CheckOutcome {
	return match checksum_file(&PathBuf::from(&firmware.artifact_path)).await {
		Ok((size, _)) if size != firmware.size as u64 => {
			CheckOutcome::fail(INTEGRITY_CHECK, format!("artifact is {} bytes, expected {}", size, firmware.size))
		}
		Ok((_, digest)) if digest != firmware.sha256 => CheckOutcome::fail(INTEGRITY_CHECK, "artifact checksum does not match"),
		Ok(_) => CheckOutcome::pass(INTEGRITY_CHECK, "artifact checksum matches"),
		Err(err) => CheckOutcome::fail(INTEGRITY_CHECK, format!("artifact unreadable: {}", err)),
	};
}

pub fn check_version(firmware: &Firmware, latest_released: Option<FirmwareVersion>) -> CheckOutcome {
	let Ok(version) = firmware.version.parse::<FirmwareVersion>() else {
		return CheckOutcome::fail(VERSION_CHECK, format!("`{}` is not a valid version", firmware.version));
	};
	return match latest_released {
		Some(latest) if version <= latest => {
			CheckOutcome::fail(VERSION_CHECK, format!("{} is not newer than released {}", version, latest))
		}
		Some(latest) => CheckOutcome::pass(VERSION_CHECK, format!("{} supersedes {}", version, latest)),
		None => CheckOutcome::pass(VERSION_CHECK, format!("{} is the first release", version)),
	};
}

/// Serves the artifact from disk to a simulated device
struct ArtifactChannel {
	path: PathBuf,
	reports: Vec<(ReportedState, FailureDetail)>,
}

#[rocket::async_trait]
impl FirmwareSource for ArtifactChannel {
	async fn fetch_chunk(&mut self, _update_id: [u8; 16], offset: u32, length: u16) -> Result<Vec<u8>, AgentError> {
		return Ok(read_chunk(&self.path, offset as u64, length as usize).await?);
	}

	async fn report(&mut self, _update_id: [u8; 16], state: ReportedState, detail: FailureDetail) -> Result<(), AgentError> {
		self.reports.push((state, detail));
		return Ok(());
	}
}

pub async fn simulate_install(target: &SimulatedTarget, firmware: &Firmware, chunk_size: u16) -> CheckOutcome {
	let name = format!("simulated:{}", target.name);
	let (Ok(base), Ok(version)) = (target.base_version.parse::<FirmwareVersion>(), firmware.version.parse::<FirmwareVersion>()) else {
		return CheckOutcome::fail(&name, "invalid version in target or firmware");
	};
	let Ok(sha256) = hex::decode(&firmware.sha256).map_err(|_| ()).and_then(|bytes| <[u8; 32]>::try_from(bytes).map_err(|_| ())) else {
		return CheckOutcome::fail(&name, "stored checksum is malformed");
	};
	let offer = UpdateOffer { update_id: [0; 16], version, size: firmware.size as u32, sha256 };
	let mut channel = ArtifactChannel { path: PathBuf::from(&firmware.artifact_path), reports: Vec::new() };
	let mut slots = MemorySlots::new(base, b"simulated base image".to_vec());
	let mut transaction = UpdateTransaction::new(offer, chunk_size).forbid_downgrade();

	let result = transaction.run(&mut channel, &mut slots).await;
	let reported: Vec<String> = channel.reports.iter().map(|(state, _)| format!("{:?}", state)).collect();
	return match result {
		Ok(TransactionState::Succeeded) => CheckOutcome::pass(&name, format!("installed over {} and booted ({})", base, reported.join(" > "))),
		Ok(state) => CheckOutcome::fail(&name, format!("install ended in {:?} ({})", state, reported.join(" > "))),
		Err(err) => CheckOutcome::fail(&name, format!("install aborted: {}", err)),
	};
}

pub async fn simulate_installs(targets: &[SimulatedTarget], firmware: &Firmware, chunk_size: u16) -> Vec<CheckOutcome> {
	let matching: Vec<&SimulatedTarget> = targets.iter().filter(|target| target.hardware_model == firmware.hardware_model).collect();
	if matching.is_empty() {
		return vec![CheckOutcome::fail("simulated", format!("no simulated target for hardware model {}", firmware.hardware_model))];
	}
	let mut outcomes = Vec::with_capacity(matching.len());
	for target in matching {
		outcomes.push(simulate_install(target, firmware, chunk_size).await);
	}
	return outcomes;
}

/// Stores the outcomes and moves the firmware to `Verified` when all of them passed
fn conclude(conn: &mut SqliteConnection, firmware_id: &[u8], outcomes: &[CheckOutcome]) -> Result<(Firmware, Vec<VerificationResult>), ApiError> {
	return conn.transaction(|conn| {
		for outcome in outcomes {
			record_result(conn, firmware_id, &outcome.target, true, outcome.passed, &outcome.detail)?;
		}
		let next = if outcomes.iter().all(|outcome| outcome.passed) {
			FirmwareStatus::Verified
		} else {
			FirmwareStatus::Rejected
		};
		let firmware = transition(conn, firmware_id, next, None)?;
		let results = results_for(conn, firmware_id)?;
		return Ok((firmware, results));
	});
}

pub async fn run_pipeline(database: &MainDatabase, config: &OtaConfig, firmware_id: Vec<u8>) -> Result<(Firmware, Vec<VerificationResult>), ApiError> {
	let lookup_id = firmware_id.clone();
	let (firmware, latest) = database.run(move |conn| {
		let firmware = find(conn, &lookup_id)?;
		let latest = latest_released_version(conn, &firmware.hardware_model)?;
		return Ok::<_, ApiError>((firmware, latest));
	}).await?;
	if firmware.status() != FirmwareStatus::Staged {
		return Err(ApiError::InvalidTransition(format!("only staged firmware can be verified, this one is {}", firmware.status())));
	}
	log::info!("Verifying firmware {} {}", firmware.hardware_model, firmware.version);

	let mut outcomes = vec![check_integrity(&firmware).await, check_version(&firmware, latest)];
	// Installing a corrupt artifact tells nothing new
	if outcomes[0].passed {
		outcomes.extend(simulate_installs(&config.verification_targets, &firmware, config.chunk_size).await);
	}
	for outcome in outcomes.iter().filter(|outcome| !outcome.passed) {
		log::warn!("Firmware {} failed check {}: {}", firmware.version, outcome.target, outcome.detail);
	}

	return database.run(move |conn| conclude(conn, &firmware_id, &outcomes)).await;
}

/// Result reported by a person testing on physical hardware
pub fn record_manual(conn: &mut SqliteConnection, firmware_id: &[u8], target: &str, passed: bool, detail: &str) -> Result<(Firmware, Vec<VerificationResult>), ApiError> {
	return conn.transaction(|conn| {
		let firmware = find(conn, firmware_id)?;
		let status = firmware.status();
		if !matches!(status, FirmwareStatus::Staged | FirmwareStatus::Verified) {
			return Err(ApiError::InvalidTransition(format!("results cannot be recorded for {} firmware", status)));
		}
		record_result(conn, firmware_id, target, false, passed, detail)?;
		let firmware = if !passed && status == FirmwareStatus::Verified {
			transition(conn, firmware_id, FirmwareStatus::Rejected, None)?
		} else {
			firmware
		};
		let results = results_for(conn, firmware_id)?;
		return Ok((firmware, results));
	});
}
