use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::*;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable)]
#[diesel(table_name = users)]
#[diesel(primary_key(user_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
	pub user_id: Vec<u8>,
	pub username: String,
	pub password: String,
	pub email: String,
	pub is_admin: bool,
	pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable, Associations)]
#[diesel(table_name = device)]
#[diesel(primary_key(device_id))]
#[diesel(belongs_to(User))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Device {
	pub device_id: Vec<u8>,
	pub user_id: Vec<u8>,
	pub name: String,
	pub mac_address: Vec<u8>,
	pub hardware_model: String,
	/// Hex encoded sha256 of the key the device authenticates with
	pub auth_key_hash: String,
	/// Unknown until the device connects for the first time
	pub firmware_version: Option<String>,
	pub registered_at: NaiveDateTime,
	pub last_seen: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable)]
#[diesel(table_name = firmware)]
#[diesel(primary_key(firmware_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Firmware {
	pub firmware_id: Vec<u8>,
	pub hardware_model: String,
	pub version: String,
	pub description: String,
	pub artifact_path: String,
	pub size: i64,
	pub sha256: String,
	pub status: String,
	pub uploaded_by: Vec<u8>,
	pub reviewed_by: Option<Vec<u8>>,
	pub created_at: NaiveDateTime,
	pub status_changed_at: NaiveDateTime,
}

impl Firmware {
	pub fn status(&self) -> FirmwareStatus {
		// Rows are only ever written through `FirmwareStatus::as_str`
		return self.status.parse().unwrap_or(FirmwareStatus::Rejected);
	}
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable, Associations)]
#[diesel(table_name = verification_result)]
#[diesel(primary_key(result_id))]
#[diesel(belongs_to(Firmware))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VerificationResult {
	pub result_id: Vec<u8>,
	pub firmware_id: Vec<u8>,
	pub target: String,
	pub automated: bool,
	pub passed: bool,
	pub detail: String,
	pub recorded_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable, Associations)]
#[diesel(table_name = rollout)]
#[diesel(primary_key(rollout_id))]
#[diesel(belongs_to(Firmware))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Rollout {
	pub rollout_id: Vec<u8>,
	pub firmware_id: Vec<u8>,
	pub status: String,
	pub batch_size: i32,
	pub failure_threshold_percent: i32,
	pub created_by: Vec<u8>,
	pub created_at: NaiveDateTime,
}

impl Rollout {
	pub fn status(&self) -> RolloutStatus {
		return self.status.parse().unwrap_or(RolloutStatus::Aborted);
	}
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable, Associations)]
#[diesel(table_name = device_update)]
#[diesel(primary_key(update_id))]
#[diesel(belongs_to(Device))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeviceUpdate {
	pub update_id: Vec<u8>,
	/// `None` for updates triggered by hand on a single device
	pub rollout_id: Option<Vec<u8>>,
	pub device_id: Vec<u8>,
	pub firmware_id: Vec<u8>,
	pub previous_version: Option<String>,
	pub state: String,
	pub attempts: i32,
	pub last_error: Option<String>,
	pub created_at: NaiveDateTime,
	pub updated_at: NaiveDateTime,
}

impl DeviceUpdate {
	pub fn state(&self) -> UpdateState {
		return self.state.parse().unwrap_or(UpdateState::Failed);
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		return write!(f, "unknown variant `{}`", self.0);
	}
}

/// Declares a status enum stored as text, with the string form used both in
/// the database and in JSON.
macro_rules! text_enum {
	($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
		pub enum $name {
			$(#[serde(rename = $text)] $variant),+
		}

		impl $name {
			pub const ALL: &'static [$name] = &[$($name::$variant),+];

			pub fn as_str(self) -> &'static str {
				return match self {
					$($name::$variant => $text),+
				};
			}
		}

		impl FromStr for $name {
			type Err = UnknownVariant;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				return match s {
					$($text => Ok($name::$variant),)+
					other => Err(UnknownVariant(other.to_owned())),
				};
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				return f.write_str(self.as_str());
			}
		}
	};
}

text_enum! {
	/// Lifecycle of an uploaded firmware build
	FirmwareStatus {
		Staged => "staged",
		Verified => "verified",
		Approved => "approved",
		Rejected => "rejected",
		Retired => "retired",
	}
}

impl FirmwareStatus {
	pub fn can_transition_to(self, next: FirmwareStatus) -> bool {
		use FirmwareStatus::*;
		return matches!(
			(self, next),
			(Staged, Verified) | (Staged, Rejected) | (Verified, Approved) | (Verified, Rejected) | (Approved, Retired)
		);
	}
}

text_enum! {
	RolloutStatus {
		Active => "active",
		Paused => "paused",
		Completed => "completed",
		Aborted => "aborted",
	}
}

text_enum! {
	/// State of a single device's update transaction
	UpdateState {
		Pending => "pending",
		Notified => "notified",
		Downloading => "downloading",
		Installing => "installing",
		Succeeded => "succeeded",
		Failed => "failed",
		RolledBack => "rolled_back",
		Cancelled => "cancelled",
	}
}

impl UpdateState {
	pub const OPEN: &'static [UpdateState] = &[UpdateState::Pending, UpdateState::Notified, UpdateState::Downloading, UpdateState::Installing];
	pub const IN_FLIGHT: &'static [UpdateState] = &[UpdateState::Notified, UpdateState::Downloading, UpdateState::Installing];

	pub fn is_terminal(self) -> bool {
		return !UpdateState::OPEN.contains(&self);
	}

	pub fn is_in_flight(self) -> bool {
		return UpdateState::IN_FLIGHT.contains(&self);
	}

	pub fn open_strs() -> Vec<&'static str> {
		return UpdateState::OPEN.iter().map(|state| state.as_str()).collect();
	}

	pub fn in_flight_strs() -> Vec<&'static str> {
		return UpdateState::IN_FLIGHT.iter().map(|state| state.as_str()).collect();
	}
}

#[cfg(test)]
mod test {
	use super::{FirmwareStatus, UpdateState};

	#[test]
	fn firmware_transitions() {
		assert!(FirmwareStatus::Staged.can_transition_to(FirmwareStatus::Verified));
		assert!(FirmwareStatus::Verified.can_transition_to(FirmwareStatus::Approved));
		assert!(FirmwareStatus::Approved.can_transition_to(FirmwareStatus::Retired));
		assert!(!FirmwareStatus::Staged.can_transition_to(FirmwareStatus::Approved));
		assert!(!FirmwareStatus::Approved.can_transition_to(FirmwareStatus::Rejected));
		assert!(!FirmwareStatus::Retired.can_transition_to(FirmwareStatus::Approved));
	}

	#[test]
	fn status_text() {
		for state in UpdateState::ALL {
			assert_eq!(state.as_str().parse::<UpdateState>().unwrap(), *state);
		}
		assert!("bogus".parse::<FirmwareStatus>().is_err());
		assert_eq!(UpdateState::RolledBack.to_string(), "rolled_back");
	}

	#[test]
	fn terminal_states() {
		assert!(!UpdateState::Pending.is_terminal());
		assert!(UpdateState::Notified.is_in_flight());
		assert!(!UpdateState::Pending.is_in_flight());
		assert!(UpdateState::Succeeded.is_terminal());
		assert!(UpdateState::Cancelled.is_terminal());
	}
}
