use std::{fmt, str::FromStr};

use thiserror::Error;

/// Firmware version in `MAJOR.MINOR.PATCH` form.
///
/// Components are limited to `u16` so every version fits the device wire
/// format. Ordering is lexicographic over the three components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FirmwareVersion {
	pub major: u16,
	pub minor: u16,
	pub patch: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
	#[error("version must have exactly three dot separated components")]
	WrongComponentCount,
	#[error("version component `{0}` is not a number between 0 and 65535")]
	InvalidComponent(String),
}

impl FirmwareVersion {
	pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
		return Self { major, minor, patch };
	}
}

impl FromStr for FirmwareVersion {
	type Err = VersionParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let parts: Vec<&str> = s.trim().split('.').collect();
		if parts.len() != 3 {
			return Err(VersionParseError::WrongComponentCount);
		}
		let mut components = [0u16; 3];
		for (slot, part) in components.iter_mut().zip(parts) {
			// u16::from_str accepts a leading `+`, which is not a valid version
			if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
				return Err(VersionParseError::InvalidComponent(part.to_owned()));
			}
			*slot = part.parse().map_err(|_| VersionParseError::InvalidComponent(part.to_owned()))?;
		}
		return Ok(Self::new(components[0], components[1], components[2]));
	}
}

impl fmt::Display for FirmwareVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		return write!(f, "{}.{}.{}", self.major, self.minor, self.patch);
	}
}
