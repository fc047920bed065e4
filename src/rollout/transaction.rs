//! Database side of a single device's update transaction

use chrono::{Duration, NaiveDateTime};
use diesel::{insert_into, prelude::*, update, SqliteConnection};

use crate::{
	db::{new_id, now},
	device_connector::packets::{FailureDetail, ReportedState, UpdateAvailablePacket, WireVersion},
	model::{Device, DeviceUpdate, Firmware, UpdateState},
	schema::{device::dsl as device_dsl, device_update::dsl as update_dsl, firmware::dsl as firmware_dsl},
	version::FirmwareVersion,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub max_attempts: i32,
	pub timeout: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReportOutcome {
	/// The transaction moved to the contained state
	Applied(UpdateState),
	/// The update does not exist, belongs to another device or already ended
	Unknown,
}

pub fn insert_pending(conn: &mut SqliteConnection, device: &Device, firmware: &Firmware, rollout_id: Option<Vec<u8>>) -> QueryResult<DeviceUpdate> {
	let timestamp = now();
	let row = DeviceUpdate {
		update_id: new_id(),
		rollout_id,
		device_id: device.device_id.clone(),
		firmware_id: firmware.firmware_id.clone(),
		previous_version: device.firmware_version.clone(),
		state: UpdateState::Pending.as_str().to_owned(),
		attempts: 0,
		last_error: None,
		created_at: timestamp,
		updated_at: timestamp,
	};
	insert_into(update_dsl::device_update).values(&row).execute(conn)?;
	return Ok(row);
}

pub fn open_for_device(conn: &mut SqliteConnection, device_id: &[u8]) -> QueryResult<Option<DeviceUpdate>> {
	return update_dsl::device_update
		.filter(update_dsl::device_id.eq(device_id))
		.filter(update_dsl::state.eq_any(UpdateState::open_strs()))
		.order(update_dsl::created_at.desc())
		.first(conn)
		.optional();
}

pub fn history_for_device(conn: &mut SqliteConnection, device_id: &[u8]) -> QueryResult<Vec<DeviceUpdate>> {
	return update_dsl::device_update
		.filter(update_dsl::device_id.eq(device_id))
		.order(update_dsl::created_at.desc())
		.load(conn);
}

fn set_state(conn: &mut SqliteConnection, update_id: &[u8], state: UpdateState, error: Option<String>) -> QueryResult<usize> {
	return update(update_dsl::device_update.find(update_id))
		.set((
			update_dsl::state.eq(state.as_str()),
			update_dsl::last_error.eq(error),
			update_dsl::updated_at.eq(now()),
		))
		.execute(conn);
}

/// Builds the announcement sent to the device
pub fn offer_packet(update: &DeviceUpdate, firmware: &Firmware) -> Option<UpdateAvailablePacket> {
	let version: FirmwareVersion = firmware.version.parse().ok()?;
	let mut sha256 = [0u8; 32];
	hex::decode_to_slice(&firmware.sha256, &mut sha256).ok()?;
	return Some(UpdateAvailablePacket {
		update_id: update.update_id.clone().try_into().ok()?,
		version: WireVersion::from(version),
		size: u32::try_from(firmware.size).ok()?,
		sha256,
	});
}

/// Marks a pending update as announced. The attempt counter counts announcements.
pub fn mark_notified(conn: &mut SqliteConnection, update_id: &[u8]) -> QueryResult<usize> {
	return update(update_dsl::device_update.find(update_id).filter(update_dsl::state.eq(UpdateState::Pending.as_str())))
		.set((
			update_dsl::state.eq(UpdateState::Notified.as_str()),
			update_dsl::attempts.eq(update_dsl::attempts + 1),
			update_dsl::updated_at.eq(now()),
		))
		.execute(conn);
}

/// Undoes `mark_notified` when the announcement could not be delivered
pub fn unmark_notified(conn: &mut SqliteConnection, update_id: &[u8]) -> QueryResult<usize> {
	return update(update_dsl::device_update.find(update_id).filter(update_dsl::state.eq(UpdateState::Notified.as_str())))
		.set((
			update_dsl::state.eq(UpdateState::Pending.as_str()),
			update_dsl::attempts.eq(update_dsl::attempts - 1),
		))
		.execute(conn);
}

/// Update the device may act on right now, with the firmware it installs.
/// Pending updates of rollouts wait for the dispatcher to admit them.
pub fn actionable_for_device(conn: &mut SqliteConnection, device_id: &[u8]) -> QueryResult<Option<(DeviceUpdate, Firmware)>> {
	let Some(open) = open_for_device(conn, device_id)? else {
		return Ok(None);
	};
	let state = open.state();
	if state == UpdateState::Pending && open.rollout_id.is_some() {
		return Ok(None);
	}
	if state == UpdateState::Pending {
		mark_notified(conn, &open.update_id)?;
	}
	let firmware = firmware_dsl::firmware.find(&open.firmware_id).first::<Firmware>(conn)?;
	let refreshed = update_dsl::device_update.find(&open.update_id).first::<DeviceUpdate>(conn)?;
	return Ok(Some((refreshed, firmware)));
}

/// Looks up an open update owned by `device_id` for serving firmware chunks
/// and moves it to `Downloading`.
pub fn begin_download(conn: &mut SqliteConnection, update_id: &[u8], device_id: &[u8]) -> QueryResult<Option<Firmware>> {
	let found = update_dsl::device_update
		.find(update_id)
		.filter(update_dsl::device_id.eq(device_id))
		.first::<DeviceUpdate>(conn)
		.optional()?;
	let Some(found) = found else {
		return Ok(None);
	};
	match found.state() {
		UpdateState::Notified => {
			set_state(conn, update_id, UpdateState::Downloading, None)?;
		}
		UpdateState::Downloading | UpdateState::Installing => {
			// Served chunks keep the update alive for expire_stale
			update(update_dsl::device_update.find(update_id))
				.set(update_dsl::updated_at.eq(now()))
				.execute(conn)?;
		}
		_ => return Ok(None),
	}
	return firmware_dsl::firmware.find(&found.firmware_id).first::<Firmware>(conn).optional();
}

fn retry_or_fail(conn: &mut SqliteConnection, update: &DeviceUpdate, policy: &RetryPolicy, error: String) -> QueryResult<UpdateState> {
	let next = if update.attempts < policy.max_attempts { UpdateState::Pending } else { UpdateState::Failed };
	log::info!("Update {} failed ({}), attempt {} of {}, now {}", hex::encode(&update.update_id), error, update.attempts, policy.max_attempts, next);
	set_state(conn, &update.update_id, next, Some(error))?;
	return Ok(next);
}

/// Applies a status report sent by a device
pub fn apply_report(conn: &mut SqliteConnection, update_id: &[u8], device_id: &[u8], reported: ReportedState, detail: FailureDetail, policy: &RetryPolicy) -> QueryResult<ReportOutcome> {
	return conn.transaction(|conn| {
		let found = update_dsl::device_update
			.find(update_id)
			.filter(update_dsl::device_id.eq(device_id))
			.first::<DeviceUpdate>(conn)
			.optional()?;
		let Some(found) = found else {
			return Ok(ReportOutcome::Unknown);
		};
		// Pending means the device was never told about it, or already gave up on it
		if !found.state().is_in_flight() {
			return Ok(ReportOutcome::Unknown);
		}
		let next = match reported {
			ReportedState::Downloading | ReportedState::Verifying => UpdateState::Downloading,
			ReportedState::Installing => UpdateState::Installing,
			ReportedState::Succeeded => {
				let firmware = firmware_dsl::firmware.find(&found.firmware_id).first::<Firmware>(conn)?;
				update(device_dsl::device.find(device_id))
					.set(device_dsl::firmware_version.eq(Some(firmware.version.clone())))
					.execute(conn)?;
				log::info!("Device {} now runs {}", hex::encode(device_id), firmware.version);
				UpdateState::Succeeded
			}
			ReportedState::Failed => {
				return retry_or_fail(conn, &found, policy, format!("device reported {:?}", detail)).map(ReportOutcome::Applied);
			}
			ReportedState::RolledBack => {
				log::warn!("Device {} rolled back update {}: {:?}", hex::encode(device_id), hex::encode(update_id), detail);
				set_state(conn, update_id, UpdateState::RolledBack, Some(format!("rolled back after {:?}", detail)))?;
				return Ok(ReportOutcome::Applied(UpdateState::RolledBack));
			}
		};
		set_state(conn, update_id, next, None)?;
		return Ok(ReportOutcome::Applied(next));
	});
}

/// Retries or fails in-flight updates that made no progress for too long
pub fn expire_stale(conn: &mut SqliteConnection, policy: &RetryPolicy, current: NaiveDateTime) -> QueryResult<usize> {
	let deadline = current - policy.timeout;
	let stale: Vec<DeviceUpdate> = update_dsl::device_update
		.filter(update_dsl::state.eq_any(UpdateState::in_flight_strs()))
		.filter(update_dsl::updated_at.lt(deadline))
		.load(conn)?;
	for update in &stale {
		retry_or_fail(conn, update, policy, String::from("timed out waiting for the device"))?;
	}
	return Ok(stale.len());
}

pub fn cancel_open(conn: &mut SqliteConnection, filter_device: Option<&[u8]>, filter_rollout: Option<&[u8]>) -> QueryResult<usize> {
	let mut query = update(update_dsl::device_update)
		.filter(update_dsl::state.eq_any(UpdateState::open_strs()))
		.into_boxed();
	if let Some(device_id) = filter_device {
		query = query.filter(update_dsl::device_id.eq(device_id.to_vec()));
	}
	if let Some(rollout_id) = filter_rollout {
		query = query.filter(update_dsl::rollout_id.eq(rollout_id.to_vec()));
	}
	return query
		.set((
			update_dsl::state.eq(UpdateState::Cancelled.as_str()),
			update_dsl::updated_at.eq(now()),
		))
		.execute(conn);
}
