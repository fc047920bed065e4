use std::{io::ErrorKind, path::PathBuf};

use rocket::{serde::json::serde_json, tokio::fs};
use serde::{Deserialize, Serialize};

use super::{AgentError, ImageSlot};
use crate::version::FirmwareVersion;

#[derive(Debug, Clone)]
struct Image {
	version: FirmwareVersion,
	bytes: Vec<u8>,
}

/// Slots kept in memory, used by simulated devices
#[derive(Debug, Clone)]
pub struct MemorySlots {
	active: Image,
	inactive: Option<Image>,
}

impl MemorySlots {
	pub fn new(version: FirmwareVersion, image: Vec<u8>) -> Self {
		return Self { active: Image { version, bytes: image }, inactive: None };
	}
}

#[rocket::async_trait]
impl ImageSlot for MemorySlots {
	fn active_version(&self) -> FirmwareVersion {
		return self.active.version;
	}

	async fn write_inactive(&mut self, version: FirmwareVersion, image: &[u8]) -> Result<(), AgentError> {
		self.inactive = Some(Image { version, bytes: image.to_vec() });
		return Ok(());
	}

	async fn activate_inactive(&mut self) -> Result<(), AgentError> {
		let Some(inactive) = self.inactive.take() else {
			return Err(AgentError::Slot(String::from("inactive slot is empty")));
		};
		self.inactive = Some(std::mem::replace(&mut self.active, inactive));
		return Ok(());
	}

	async fn revert(&mut self) -> Result<(), AgentError> {
		return self.activate_inactive().await;
	}

	async fn read_active(&self) -> Result<Vec<u8>, AgentError> {
		return Ok(self.active.bytes.clone());
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum SlotName {
	A,
	B,
}

impl SlotName {
	fn other(self) -> Self {
		return match self {
			SlotName::A => SlotName::B,
			SlotName::B => SlotName::A,
		};
	}

	fn file_name(self) -> &'static str {
		return match self {
			SlotName::A => "slot_a.bin",
			SlotName::B => "slot_b.bin",
		};
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotState {
	active: SlotName,
	versions: [Option<String>; 2],
}

impl SlotState {
	fn index(slot: SlotName) -> usize {
		return match slot {
			SlotName::A => 0,
			SlotName::B => 1,
		};
	}

	fn version_of(&self, slot: SlotName) -> Option<FirmwareVersion> {
		return self.versions[Self::index(slot)].as_deref().and_then(|text| text.parse().ok());
	}
}

/// Slots stored as two files plus a small JSON state file in a directory
pub struct DirectorySlots {
	directory: PathBuf,
	state: SlotState,
}

impl DirectorySlots {
	const STATE_FILE: &'static str = "slots.json";

	/// Opens the directory, creating it with `initial_version` in slot A
	/// when it holds no state yet
	pub async fn open(directory: PathBuf, initial_version: FirmwareVersion) -> Result<Self, AgentError> {
		fs::create_dir_all(&directory).await.map_err(|err| AgentError::Slot(err.to_string()))?;
		let state_path = directory.join(Self::STATE_FILE);
		let state = match fs::read_to_string(&state_path).await {
			Ok(content) => serde_json::from_str(&content).map_err(|err| AgentError::Slot(err.to_string()))?,
			Err(err) if err.kind() == ErrorKind::NotFound => {
				SlotState { active: SlotName::A, versions: [Some(initial_version.to_string()), None] }
			}
			Err(err) => return Err(AgentError::Slot(err.to_string())),
		};
		let mut slots = Self { directory, state };
		slots.save().await?;
		return Ok(slots);
	}

	async fn save(&mut self) -> Result<(), AgentError> {
		let content = serde_json::to_string_pretty(&self.state).map_err(|err| AgentError::Slot(err.to_string()))?;
		let temp_path = self.directory.join("slots.json.tmp");
		fs::write(&temp_path, content).await.map_err(|err| AgentError::Slot(err.to_string()))?;
		fs::rename(&temp_path, self.directory.join(Self::STATE_FILE)).await.map_err(|err| AgentError::Slot(err.to_string()))?;
		return Ok(());
	}
}

#[rocket::async_trait]
impl ImageSlot for DirectorySlots {
	fn active_version(&self) -> FirmwareVersion {
		return self.state.version_of(self.state.active).unwrap_or_default();
	}

	async fn write_inactive(&mut self, version: FirmwareVersion, image: &[u8]) -> Result<(), AgentError> {
		let target = self.state.active.other();
		fs::write(self.directory.join(target.file_name()), image).await.map_err(|err| AgentError::Slot(err.to_string()))?;
		self.state.versions[SlotState::index(target)] = Some(version.to_string());
		return self.save().await;
	}

	async fn activate_inactive(&mut self) -> Result<(), AgentError> {
		let target = self.state.active.other();
		if self.state.version_of(target).is_none() {
			return Err(AgentError::Slot(String::from("inactive slot is empty")));
		}
		self.state.active = target;
		return self.save().await;
	}

	async fn revert(&mut self) -> Result<(), AgentError> {
		return self.activate_inactive().await;
	}

	async fn read_active(&self) -> Result<Vec<u8>, AgentError> {
		let path = self.directory.join(self.state.active.file_name());
		return match fs::read(path).await {
			Ok(bytes) => Ok(bytes),
			// A freshly opened slot A has a version but no image on disk
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
			Err(err) => Err(AgentError::Slot(err.to_string())),
		};
	}
}
