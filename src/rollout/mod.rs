//! Rollouts push one approved firmware to every device of its hardware
//! model, in batches, and halt when too many devices fail.

use diesel::{dsl::count_star, insert_into, prelude::*, update, SqliteConnection};
use serde::{Deserialize, Serialize};

use crate::{
	db::{new_id, now},
	error::ApiError,
	firmware,
	model::{Device, FirmwareStatus, Rollout, RolloutStatus, UpdateState},
	schema::{device::dsl as device_dsl, device_update::dsl as update_dsl, rollout::dsl as rollout_dsl},
	version::FirmwareVersion,
};

pub mod dispatcher;
pub mod transaction;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutCounts {
	pub total: i64,
	pub pending: i64,
	pub in_flight: i64,
	pub succeeded: i64,
	pub failed: i64,
	pub rolled_back: i64,
	pub cancelled: i64,
}

impl RolloutCounts {
	pub fn open(&self) -> i64 {
		return self.pending + self.in_flight;
	}

	/// Whether failures reached `threshold_percent` of all targeted devices
	pub fn exceeds_failure_threshold(&self, threshold_percent: i32) -> bool {
		let failures = self.failed + self.rolled_back;
		if failures == 0 || self.total == 0 {
			return false;
		}
		return failures * 100 / self.total >= threshold_percent as i64;
	}
}

pub fn counts(conn: &mut SqliteConnection, rollout_id: &[u8]) -> QueryResult<RolloutCounts> {
	let grouped: Vec<(String, i64)> = update_dsl::device_update
		.filter(update_dsl::rollout_id.eq(rollout_id.to_vec()))
		.group_by(update_dsl::state)
		.select((update_dsl::state, count_star()))
		.load(conn)?;
	let mut counts = RolloutCounts::default();
	for (state, count) in grouped {
		counts.total += count;
		match state.parse::<UpdateState>() {
			Ok(UpdateState::Pending) => counts.pending += count,
			Ok(UpdateState::Notified | UpdateState::Downloading | UpdateState::Installing) => counts.in_flight += count,
			Ok(UpdateState::Succeeded) => counts.succeeded += count,
			Ok(UpdateState::Failed) => counts.failed += count,
			Ok(UpdateState::RolledBack) => counts.rolled_back += count,
			Ok(UpdateState::Cancelled) => counts.cancelled += count,
			Err(err) => log::warn!("Ignoring update row with {}", err),
		}
	}
	return Ok(counts);
}

pub fn find(conn: &mut SqliteConnection, rollout_id: &[u8]) -> Result<Rollout, ApiError> {
	return rollout_dsl::rollout.find(rollout_id).first::<Rollout>(conn).optional()?.ok_or(ApiError::NotFound("Rollout"));
}

pub fn list(conn: &mut SqliteConnection) -> QueryResult<Vec<Rollout>> {
	return rollout_dsl::rollout.order(rollout_dsl::created_at.desc()).load(conn);
}

pub fn with_status(conn: &mut SqliteConnection, status: RolloutStatus) -> QueryResult<Vec<Rollout>> {
	return rollout_dsl::rollout
		.filter(rollout_dsl::status.eq(status.as_str()))
		.order(rollout_dsl::created_at.asc())
		.load(conn);
}

/// Whether a device should receive `target` in a rollout
fn needs_update(device: &Device, target: FirmwareVersion) -> bool {
	return match device.firmware_version.as_deref().map(str::parse::<FirmwareVersion>) {
		Some(Ok(current)) => current < target,
		// Devices that never connected, or report garbage, get the update
		_ => true,
	};
}

pub struct NewRollout {
	pub firmware_id: Vec<u8>,
	pub created_by: Vec<u8>,
	pub batch_size: i32,
	pub failure_threshold_percent: i32,
}

pub fn create(conn: &mut SqliteConnection, new: NewRollout) -> Result<(Rollout, RolloutCounts), ApiError> {
	if new.batch_size < 1 {
		return Err(ApiError::InvalidInput(String::from("batch_size must be at least 1")));
	}
	if !(1..=100).contains(&new.failure_threshold_percent) {
		return Err(ApiError::InvalidInput(String::from("failure_threshold_percent must be between 1 and 100")));
	}
	return conn.transaction(|conn| {
		let target = firmware::find(conn, &new.firmware_id)?;
		if target.status() != FirmwareStatus::Approved {
			return Err(ApiError::InvalidTransition(format!("only approved firmware can be rolled out, this one is {}", target.status())));
		}
		let version: FirmwareVersion = target.version.parse().map_err(|err| ApiError::Internal(format!("stored version invalid: {}", err)))?;

		let row = Rollout {
			rollout_id: new_id(),
			firmware_id: new.firmware_id.clone(),
			status: RolloutStatus::Active.as_str().to_owned(),
			batch_size: new.batch_size,
			failure_threshold_percent: new.failure_threshold_percent,
			created_by: new.created_by.clone(),
			created_at: now(),
		};
		insert_into(rollout_dsl::rollout).values(&row).execute(conn)?;

		let devices: Vec<Device> = device_dsl::device
			.filter(device_dsl::hardware_model.eq(&target.hardware_model))
			.load(conn)?;
		let mut targeted = 0;
		for device in devices {
			if !needs_update(&device, version) {
				continue;
			}
			if transaction::open_for_device(conn, &device.device_id)?.is_some() {
				log::debug!("Skipping device {} with an update in progress", hex::encode(&device.device_id));
				continue;
			}
			transaction::insert_pending(conn, &device, &target, Some(row.rollout_id.clone()))?;
			targeted += 1;
		}
		log::info!("Created rollout {} of {} {} to {} device(s)", hex::encode(&row.rollout_id), target.hardware_model, version, targeted);
		let counts = counts(conn, &row.rollout_id)?;
		return Ok((row, counts));
	});
}

pub fn set_status(conn: &mut SqliteConnection, rollout_id: &[u8], next: RolloutStatus) -> Result<Rollout, ApiError> {
	return conn.transaction(|conn| {
		let current = find(conn, rollout_id)?;
		let allowed = matches!(
			(current.status(), next),
			(RolloutStatus::Active, RolloutStatus::Paused)
				| (RolloutStatus::Paused, RolloutStatus::Active)
				| (RolloutStatus::Active, RolloutStatus::Completed)
				| (RolloutStatus::Active | RolloutStatus::Paused, RolloutStatus::Aborted)
		);
		if !allowed {
			return Err(ApiError::InvalidTransition(format!("rollout is {} and cannot become {}", current.status(), next)));
		}
		update(rollout_dsl::rollout.find(rollout_id)).set(rollout_dsl::status.eq(next.as_str())).execute(conn)?;
		if next == RolloutStatus::Aborted {
			let cancelled = transaction::cancel_open(conn, None, Some(rollout_id))?;
			log::info!("Aborted rollout {}, cancelled {} update(s)", hex::encode(rollout_id), cancelled);
		}
		return find(conn, rollout_id);
	});
}

/// Stops everything still delivering `firmware_id`, used when it is retired
pub fn abort_for_firmware(conn: &mut SqliteConnection, firmware_id: &[u8]) -> Result<usize, ApiError> {
	let running: Vec<Rollout> = rollout_dsl::rollout
		.filter(rollout_dsl::firmware_id.eq(firmware_id))
		.filter(rollout_dsl::status.eq_any([RolloutStatus::Active.as_str(), RolloutStatus::Paused.as_str()]))
		.load(conn)?;
	for rollout in &running {
		set_status(conn, &rollout.rollout_id, RolloutStatus::Aborted)?;
	}
	let manual = update(update_dsl::device_update)
		.filter(update_dsl::firmware_id.eq(firmware_id))
		.filter(update_dsl::state.eq_any(UpdateState::open_strs()))
		.set((update_dsl::state.eq(UpdateState::Cancelled.as_str()), update_dsl::updated_at.eq(now())))
		.execute(conn)?;
	return Ok(running.len() + manual);
}

#[cfg(test)]
mod test {
	use diesel::SqliteConnection;

	use super::*;
	use crate::{
		db::test_connection,
		firmware::test::{insert_admin, insert_firmware},
		model::{Firmware, User},
		rollout::transaction::test::insert_device,
	};

	fn new_rollout(firmware: &Firmware, admin: &User) -> NewRollout {
		return NewRollout { firmware_id: firmware.firmware_id.clone(), created_by: admin.user_id.clone(), batch_size: 2, failure_threshold_percent: 50 };
	}

	fn setup(conn: &mut SqliteConnection) -> (User, Firmware) {
		let admin = insert_admin(conn);
		let firmware = insert_firmware(conn, &admin, "esp32", "1.1.0", FirmwareStatus::Approved);
		return (admin, firmware);
	}

	#[test]
	fn targets_only_outdated_devices_of_the_model() {
		let mut conn = test_connection();
		let (admin, firmware) = setup(&mut conn);
		insert_device(&mut conn, &admin, "esp32", Some("1.0.0"));
		insert_device(&mut conn, &admin, "esp32", None);
		insert_device(&mut conn, &admin, "esp32", Some("1.1.0"));
		insert_device(&mut conn, &admin, "esp32", Some("2.0.0"));
		insert_device(&mut conn, &admin, "stm32", Some("0.1.0"));

		let (rollout, counts) = create(&mut conn, new_rollout(&firmware, &admin)).unwrap();
		assert_eq!(rollout.status(), RolloutStatus::Active);
		assert_eq!(counts.total, 2);
		assert_eq!(counts.pending, 2);
	}

	#[test]
	fn devices_with_open_updates_are_skipped() {
		let mut conn = test_connection();
		let (admin, firmware) = setup(&mut conn);
		let busy = insert_device(&mut conn, &admin, "esp32", Some("1.0.0"));
		transaction::insert_pending(&mut conn, &busy, &firmware, None).unwrap();

		let (_, counts) = create(&mut conn, new_rollout(&firmware, &admin)).unwrap();
		assert_eq!(counts.total, 0);
	}

	#[test]
	fn unapproved_firmware_cannot_roll_out() {
		let mut conn = test_connection();
		let admin = insert_admin(&mut conn);
		let staged = insert_firmware(&mut conn, &admin, "esp32", "1.1.0", FirmwareStatus::Staged);
		let err = create(&mut conn, new_rollout(&staged, &admin)).unwrap_err();
		assert!(matches!(err, ApiError::InvalidTransition(_)));

		let mut bad_batch = new_rollout(&staged, &admin);
		bad_batch.batch_size = 0;
		assert!(matches!(create(&mut conn, bad_batch).unwrap_err(), ApiError::InvalidInput(_)));
	}

	#[test]
	fn abort_cancels_open_updates() {
		let mut conn = test_connection();
		let (admin, firmware) = setup(&mut conn);
		insert_device(&mut conn, &admin, "esp32", Some("1.0.0"));
		let (rollout, _) = create(&mut conn, new_rollout(&firmware, &admin)).unwrap();

		set_status(&mut conn, &rollout.rollout_id, RolloutStatus::Paused).unwrap();
		set_status(&mut conn, &rollout.rollout_id, RolloutStatus::Aborted).unwrap();
		let counts = counts(&mut conn, &rollout.rollout_id).unwrap();
		assert_eq!(counts.cancelled, 1);
		assert_eq!(counts.open(), 0);

		let err = set_status(&mut conn, &rollout.rollout_id, RolloutStatus::Active).unwrap_err();
		assert!(matches!(err, ApiError::InvalidTransition(_)));
	}

	#[test]
	fn retiring_firmware_aborts_its_rollouts() {
		let mut conn = test_connection();
		let (admin, firmware) = setup(&mut conn);
		let device = insert_device(&mut conn, &admin, "esp32", Some("1.0.0"));
		let (rollout, _) = create(&mut conn, new_rollout(&firmware, &admin)).unwrap();

		assert_eq!(abort_for_firmware(&mut conn, &firmware.firmware_id).unwrap(), 1);
		assert_eq!(find(&mut conn, &rollout.rollout_id).unwrap().status(), RolloutStatus::Aborted);
		assert!(transaction::open_for_device(&mut conn, &device.device_id).unwrap().is_none());
	}

	#[test]
	fn failure_threshold() {
		let counts = RolloutCounts { total: 10, failed: 1, rolled_back: 1, ..Default::default() };
		assert!(counts.exceeds_failure_threshold(20));
		assert!(!counts.exceeds_failure_threshold(21));
		assert!(!RolloutCounts::default().exceeds_failure_threshold(1));
	}
}
