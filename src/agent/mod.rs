//! Device side of the update protocol.
//!
//! `UpdateTransaction` applies one offered update: it downloads the image in
//! chunks, verifies it, installs it into the inactive slot and boots it. The
//! same transaction runs on real devices (through `client::AgentClient`) and
//! on the simulated targets of the verification pipeline.

use rocket::tokio::io;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{device_connector::packets::{FailureDetail, ReportedState, ResultCode, UpdateAvailablePacket}, version::FirmwareVersion};

pub mod client;
pub mod slots;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("connection failed: {0}")]
	Io(#[from] io::Error),
	#[error("server answered with {0:?}")]
	Rejected(ResultCode),
	#[error("unexpected reply from server: {0}")]
	Protocol(String),
	#[error("image slot error: {0}")]
	Slot(String),
}

/// An update announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOffer {
	pub update_id: [u8; 16],
	pub version: FirmwareVersion,
	pub size: u32,
	pub sha256: [u8; 32],
}

impl From<UpdateAvailablePacket> for UpdateOffer {
	fn from(packet: UpdateAvailablePacket) -> Self {
		return Self {
			update_id: packet.update_id,
			version: packet.version.into(),
			size: packet.size,
			sha256: packet.sha256,
		};
	}
}

/// Where firmware bytes come from and where progress goes to
#[rocket::async_trait]
pub trait FirmwareSource: Send {
	async fn fetch_chunk(&mut self, update_id: [u8; 16], offset: u32, length: u16) -> Result<Vec<u8>, AgentError>;
	async fn report(&mut self, update_id: [u8; 16], state: ReportedState, detail: FailureDetail) -> Result<(), AgentError>;
}

/// A/B image storage. New images are written to the inactive slot, which is
/// then activated for a trial boot.
#[rocket::async_trait]
pub trait ImageSlot: Send + Sync {
	fn active_version(&self) -> FirmwareVersion;
	async fn write_inactive(&mut self, version: FirmwareVersion, image: &[u8]) -> Result<(), AgentError>;
	async fn activate_inactive(&mut self) -> Result<(), AgentError>;
	/// Returns to the image that was active before the last activation
	async fn revert(&mut self) -> Result<(), AgentError>;
	async fn read_active(&self) -> Result<Vec<u8>, AgentError>;
}

/// Upper bound on the buffer reserved up front for a download. The offered
/// size comes from the wire.
const INITIAL_RESERVE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
	Idle,
	Downloading { received: u32 },
	Verifying,
	Installing,
	Succeeded,
	Failed(FailureDetail),
	RolledBack(FailureDetail),
}

/// Trial boot check run after activation
pub fn boot_check(previous: FirmwareVersion, offered: FirmwareVersion, image: &[u8], allow_downgrade: bool) -> Result<(), FailureDetail> {
	if image.is_empty() {
		return Err(FailureDetail::BootCheckFailed);
	}
	if !allow_downgrade && offered <= previous {
		return Err(FailureDetail::BootCheckFailed);
	}
	return Ok(());
}

pub struct UpdateTransaction {
	offer: UpdateOffer,
	chunk_size: u16,
	allow_downgrade: bool,
	state: TransactionState,
}

impl UpdateTransaction {
	pub fn new(offer: UpdateOffer, chunk_size: u16) -> Self {
		return Self { offer, chunk_size: chunk_size.max(1), allow_downgrade: true, state: TransactionState::Idle };
	}

	/// Refuse images that are not newer than the running one
	pub fn forbid_downgrade(mut self) -> Self {
		self.allow_downgrade = false;
		return self;
	}

	pub fn state(&self) -> TransactionState {
		return self.state;
	}

	async fn enter<C: FirmwareSource + ?Sized>(&mut self, channel: &mut C, state: TransactionState) -> Result<(), AgentError> {
		self.state = state;
		let (reported, detail) = match state {
			TransactionState::Idle => return Ok(()),
			// Per-chunk progress is not reported
			TransactionState::Downloading { received } if received > 0 => return Ok(()),
			TransactionState::Downloading { .. } => (ReportedState::Downloading, FailureDetail::None),
			TransactionState::Verifying => (ReportedState::Verifying, FailureDetail::None),
			TransactionState::Installing => (ReportedState::Installing, FailureDetail::None),
			TransactionState::Succeeded => (ReportedState::Succeeded, FailureDetail::None),
			TransactionState::Failed(detail) => (ReportedState::Failed, detail),
			TransactionState::RolledBack(detail) => (ReportedState::RolledBack, detail),
		};
		log::debug!("Update {} entering {:?}", hex::encode(self.offer.update_id), state);
		return channel.report(self.offer.update_id, reported, detail).await;
	}

	async fn download<C: FirmwareSource + ?Sized>(&mut self, channel: &mut C) -> Result<Result<Vec<u8>, FailureDetail>, AgentError> {
		let mut image = Vec::with_capacity((self.offer.size as usize).min(INITIAL_RESERVE));
		self.enter(channel, TransactionState::Downloading { received: 0 }).await?;
		while (image.len() as u32) < self.offer.size {
			let offset = image.len() as u32;
			let wanted = (self.offer.size - offset).min(self.chunk_size as u32) as u16;
			let chunk = match channel.fetch_chunk(self.offer.update_id, offset, wanted).await {
				Ok(chunk) => chunk,
				Err(AgentError::Rejected(code)) => {
					log::warn!("Server refused chunk at offset {}: {:?}", offset, code);
					return Ok(Err(FailureDetail::TransferError));
				}
				Err(err) => return Err(err),
			};
			if chunk.is_empty() || chunk.len() > wanted as usize {
				log::warn!("Got chunk of {} bytes for a request of {}", chunk.len(), wanted);
				return Ok(Err(FailureDetail::SizeMismatch));
			}
			image.extend_from_slice(&chunk);
			self.state = TransactionState::Downloading { received: image.len() as u32 };
		}
		return Ok(Ok(image));
	}

	/// Runs the transaction to a terminal state. `Err` means the channel
	/// broke and the server was not told the outcome.
	pub async fn run<C, S>(&mut self, channel: &mut C, slots: &mut S) -> Result<TransactionState, AgentError>
	where
		C: FirmwareSource + ?Sized,
		S: ImageSlot + ?Sized,
	{
		let image = match self.download(channel).await? {
			Ok(image) => image,
			Err(detail) => {
				self.enter(channel, TransactionState::Failed(detail)).await?;
				return Ok(self.state);
			}
		};

		self.enter(channel, TransactionState::Verifying).await?;
		if image.len() as u32 != self.offer.size {
			self.enter(channel, TransactionState::Failed(FailureDetail::SizeMismatch)).await?;
			return Ok(self.state);
		}
		let digest: [u8; 32] = Sha256::digest(&image).into();
		if digest != self.offer.sha256 {
			log::warn!("Checksum mismatch for update {}", hex::encode(self.offer.update_id));
			self.enter(channel, TransactionState::Failed(FailureDetail::ChecksumMismatch)).await?;
			return Ok(self.state);
		}

		self.enter(channel, TransactionState::Installing).await?;
		let previous = slots.active_version();
		let installed = match slots.write_inactive(self.offer.version, &image).await {
			Ok(()) => slots.activate_inactive().await,
			Err(err) => Err(err),
		};
		if let Err(err) = installed {
			log::error!("Installing update failed: {}", err);
			self.enter(channel, TransactionState::Failed(FailureDetail::InstallError)).await?;
			return Ok(self.state);
		}

		let booted = slots.read_active().await.map_err(|_| FailureDetail::BootCheckFailed)
			.and_then(|active| boot_check(previous, self.offer.version, &active, self.allow_downgrade));
		if let Err(detail) = booted {
			log::warn!("Trial boot of {} failed, reverting to {}", self.offer.version, previous);
			if let Err(err) = slots.revert().await {
				log::error!("Reverting image slot failed: {}", err);
			}
			self.enter(channel, TransactionState::RolledBack(detail)).await?;
			return Ok(self.state);
		}

		self.enter(channel, TransactionState::Succeeded).await?;
		return Ok(self.state);
	}
}

#[cfg(test)]
pub(crate) mod test {
	use sha2::{Digest, Sha256};

	use super::{slots::MemorySlots, AgentError, ImageSlot, TransactionState, FirmwareSource, UpdateOffer, UpdateTransaction};
	use crate::{device_connector::packets::{FailureDetail, ReportedState}, version::FirmwareVersion};

	/// Serves chunks from memory and records every report
	pub struct MemoryChannel {
		pub image: Vec<u8>,
		pub reports: Vec<(ReportedState, FailureDetail)>,
		pub requests: usize,
	}

	impl MemoryChannel {
		pub fn new(image: Vec<u8>) -> Self {
			return Self { image, reports: Vec::new(), requests: 0 };
		}
	}

	#[rocket::async_trait]
	impl FirmwareSource for MemoryChannel {
		async fn fetch_chunk(&mut self, _update_id: [u8; 16], offset: u32, length: u16) -> Result<Vec<u8>, AgentError> {
			self.requests += 1;
			let start = (offset as usize).min(self.image.len());
			let end = (start + length as usize).min(self.image.len());
			return Ok(self.image[start..end].to_vec());
		}

		async fn report(&mut self, _update_id: [u8; 16], state: ReportedState, detail: FailureDetail) -> Result<(), AgentError> {
			self.reports.push((state, detail));
			return Ok(());
		}
	}

	fn offer_for(image: &[u8], version: FirmwareVersion) -> UpdateOffer {
		return UpdateOffer { update_id: [1; 16], version, size: image.len() as u32, sha256: Sha256::digest(image).into() };
	}

	#[rocket::async_test]
	async fn successful_update_switches_slot() {
		let image = vec![0x5A; 2500];
		let mut channel = MemoryChannel::new(image.clone());
		let mut slots = MemorySlots::new(FirmwareVersion::new(1, 0, 0), vec![1, 2, 3]);
		let mut transaction = UpdateTransaction::new(offer_for(&image, FirmwareVersion::new(1, 1, 0)), 1024);

		let state = transaction.run(&mut channel, &mut slots).await.unwrap();
		assert_eq!(state, TransactionState::Succeeded);
		assert_eq!(channel.requests, 3);
		assert_eq!(slots.active_version(), FirmwareVersion::new(1, 1, 0));
		assert_eq!(slots.read_active().await.unwrap(), image);
		let states: Vec<ReportedState> = channel.reports.iter().map(|(state, _)| *state).collect();
		assert_eq!(states, vec![ReportedState::Downloading, ReportedState::Verifying, ReportedState::Installing, ReportedState::Succeeded]);
	}

	#[rocket::async_test]
	async fn checksum_mismatch_fails_without_install() {
		let image = vec![0x5A; 100];
		let mut offer = offer_for(&image, FirmwareVersion::new(1, 1, 0));
		offer.sha256 = [0; 32];
		let mut channel = MemoryChannel::new(image);
		let mut slots = MemorySlots::new(FirmwareVersion::new(1, 0, 0), vec![1]);

		let state = UpdateTransaction::new(offer, 64).run(&mut channel, &mut slots).await.unwrap();
		assert_eq!(state, TransactionState::Failed(FailureDetail::ChecksumMismatch));
		assert_eq!(slots.active_version(), FirmwareVersion::new(1, 0, 0));
		assert_eq!(channel.reports.last(), Some(&(ReportedState::Failed, FailureDetail::ChecksumMismatch)));
	}

	#[rocket::async_test]
	async fn short_source_is_a_size_mismatch() {
		let image = vec![7; 10];
		let mut offer = offer_for(&image, FirmwareVersion::new(1, 1, 0));
		offer.size = 20;
		let mut channel = MemoryChannel::new(image);
		let mut slots = MemorySlots::new(FirmwareVersion::new(1, 0, 0), vec![1]);

		let state = UpdateTransaction::new(offer, 8).run(&mut channel, &mut slots).await.unwrap();
		assert_eq!(state, TransactionState::Failed(FailureDetail::SizeMismatch));
	}

	#[rocket::async_test]
	async fn oversized_offer_does_not_reserve_its_claimed_size() {
		let image = vec![3; 10];
		let mut offer = offer_for(&image, FirmwareVersion::new(1, 1, 0));
		offer.size = u32::MAX;
		let mut channel = MemoryChannel::new(image);
		let mut slots = MemorySlots::new(FirmwareVersion::new(1, 0, 0), vec![1]);

		let mut transaction = UpdateTransaction::new(offer, 8);
		let state = transaction.run(&mut channel, &mut slots).await.unwrap();
		assert_eq!(state, TransactionState::Failed(FailureDetail::SizeMismatch));
		assert_eq!(channel.requests, 3);
		assert_eq!(slots.active_version(), FirmwareVersion::new(1, 0, 0));
	}

	#[rocket::async_test]
	async fn failed_boot_rolls_back() {
		let image = vec![9; 16];
		let mut channel = MemoryChannel::new(image.clone());
		let mut slots = MemorySlots::new(FirmwareVersion::new(2, 0, 0), vec![1, 1]);
		let mut transaction = UpdateTransaction::new(offer_for(&image, FirmwareVersion::new(1, 0, 0)), 8).forbid_downgrade();

		let state = transaction.run(&mut channel, &mut slots).await.unwrap();
		assert_eq!(state, TransactionState::RolledBack(FailureDetail::BootCheckFailed));
		assert_eq!(slots.active_version(), FirmwareVersion::new(2, 0, 0));
		assert_eq!(slots.read_active().await.unwrap(), vec![1, 1]);
	}

	#[test]
	fn boot_check_rules() {
		let old = FirmwareVersion::new(1, 0, 0);
		let new = FirmwareVersion::new(1, 0, 1);
		assert!(super::boot_check(old, new, &[1], false).is_ok());
		assert!(super::boot_check(old, new, &[], true).is_err());
		assert!(super::boot_check(new, old, &[1], false).is_err());
		assert!(super::boot_check(new, old, &[1], true).is_ok());
	}
}
