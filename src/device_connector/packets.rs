use std::borrow::Cow;

use deku::prelude::*;
use rocket::tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::version::FirmwareVersion;

/// Size of the encoded `PacketHeader`, including the message id
pub const HEADER_SIZE: usize = 21;
/// Bodies above this size are refused before anything is allocated
pub const MAX_BODY_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct ApplicationPacket {
	pub header: PacketHeader,
	pub message: Message,
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct PacketHeader {
	pub session_id: [u8; 16],
	/// Length of the message body following the header
	#[deku(endian = "little")]
	pub buffer_size: u32,
	#[deku(bits = "1")]
	pub is_response: bool,
}

#[derive(Debug, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(id_type = "u8", bits = 7)]
#[non_exhaustive]
pub enum Message {
	#[deku(id = "0x00")]
	NoOperation(EmptyPacket),
	#[deku(id = "0x01")]
	InitiateConnection(InitiateConnectionPacket),
	#[deku(id = "0x02")]
	Acknowledge(AcknowledgePacket),
	#[deku(id = "0x03")]
	UnregisterDevice(EmptyPacket),
	#[deku(id = "0x04")]
	CheckForUpdate(CheckForUpdatePacket),
	#[deku(id = "0x05")]
	UpdateAvailable(UpdateAvailablePacket),
	#[deku(id = "0x06")]
	NoUpdate(EmptyPacket),
	#[deku(id = "0x07")]
	FirmwareChunkRequest(FirmwareChunkRequestPacket),
	#[deku(id = "0x08")]
	FirmwareChunk(FirmwareChunkPacket),
	#[deku(id = "0x09")]
	UpdateStatus(UpdateStatusPacket),
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct EmptyPacket {}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct WireVersion {
	#[deku(endian = "little")]
	pub major: u16,
	#[deku(endian = "little")]
	pub minor: u16,
	#[deku(endian = "little")]
	pub patch: u16,
}

impl From<FirmwareVersion> for WireVersion {
	fn from(version: FirmwareVersion) -> Self {
		return Self { major: version.major, minor: version.minor, patch: version.patch };
	}
}

impl From<WireVersion> for FirmwareVersion {
	fn from(version: WireVersion) -> Self {
		return FirmwareVersion::new(version.major, version.minor, version.patch);
	}
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct InitiateConnectionPacket {
	pub device_id: [u8; 16],
	pub auth_key: [u8; 16],
	pub firmware_version: WireVersion,
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(id_type = "u8")]
pub enum ResultCode {
	Ok = 0x00,
	BadCredentials = 0x01,
	NotConnected = 0x02,
	UnknownUpdate = 0x03,
	InvalidRequest = 0x04,
	InternalError = 0x05,
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct AcknowledgePacket {
	pub result: ResultCode,
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct CheckForUpdatePacket {
	pub current_version: WireVersion,
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct UpdateAvailablePacket {
	pub update_id: [u8; 16],
	pub version: WireVersion,
	#[deku(endian = "little")]
	pub size: u32,
	pub sha256: [u8; 32],
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct FirmwareChunkRequestPacket {
	pub update_id: [u8; 16],
	#[deku(endian = "little")]
	pub offset: u32,
	#[deku(endian = "little")]
	pub length: u16,
}

#[derive(Debug, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct FirmwareChunkPacket {
	pub update_id: [u8; 16],
	#[deku(endian = "little")]
	pub offset: u32,
	#[deku(endian = "little")]
	pub length: u16,
	#[deku(count = "length")]
	pub data: Vec<u8>,
}

impl FirmwareChunkPacket {
	/// `data` must not exceed `u16::MAX` bytes
	pub fn new(update_id: [u8; 16], offset: u32, data: Vec<u8>) -> Self {
		return Self { update_id, offset, length: data.len() as u16, data };
	}
}

/// Progress reported by a device for one update transaction
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(id_type = "u8")]
pub enum ReportedState {
	Downloading = 0x00,
	Verifying = 0x01,
	Installing = 0x02,
	Succeeded = 0x03,
	Failed = 0x04,
	RolledBack = 0x05,
}

/// Why a device gave up on an update. Sent alongside failure states.
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(id_type = "u8")]
pub enum FailureDetail {
	None = 0x00,
	ChecksumMismatch = 0x01,
	SizeMismatch = 0x02,
	TransferError = 0x03,
	InstallError = 0x04,
	BootCheckFailed = 0x05,
}

#[derive(Debug, Clone, Copy, DekuRead, DekuWrite, PartialEq, Eq)]
pub struct UpdateStatusPacket {
	pub update_id: [u8; 16],
	pub state: ReportedState,
	pub detail: FailureDetail,
}

impl ApplicationPacket {
	pub fn new(session_id: [u8; 16], is_response: bool, message: Message) -> Self {
		return Self {
			header: PacketHeader { session_id, buffer_size: 0, is_response },
			message,
		};
	}

	/// Encodes the packet with `buffer_size` set to the actual body length
	pub fn encode(&self) -> Result<Vec<u8>, DekuError> {
		let mut encoded = self.to_bytes()?;
		let body_size = (encoded.len() - HEADER_SIZE) as u32;
		encoded[16..20].copy_from_slice(&body_size.to_le_bytes());
		return Ok(encoded);
	}
}

/// Enum representing possible errors that can happen when reading a packet from a socket
#[derive(Debug, Clone)]
pub enum PacketReadError {
	/// Can't fully read a packet from the socket, probably because it was closed on the other end
	CantRead,
	/// Failed to parse header. Contains information about why it failed
	HeaderParseError(Cow<'static, str>),
	/// Failed to parse full packet. Contains information about why it failed
	PacketParseError(Cow<'static, str>),
	/// Header announced a body larger than `MAX_BODY_SIZE`
	TooLarge(u32),
}

// deku does not support async readers, so the header is read first to learn the body size
pub async fn read_packet_async<R: AsyncRead + Unpin>(socket: &mut R) -> Result<ApplicationPacket, PacketReadError> {
	let mut header_buffer = [0; HEADER_SIZE];
	if let Err(err) = socket.read_exact(&mut header_buffer).await {
		log::debug!("Failed to read packet header: {}", err);
		return Err(PacketReadError::CantRead);
	}
	let header = match PacketHeader::from_bytes((&header_buffer, 0)) {
		Ok((_, head)) => head,
		Err(err) => {
			return Err(PacketReadError::HeaderParseError(Cow::Owned(err.to_string())));
		}
	};
	if header.buffer_size > MAX_BODY_SIZE {
		return Err(PacketReadError::TooLarge(header.buffer_size));
	}
	let mut packet_buffer = vec![0; HEADER_SIZE + header.buffer_size as usize];
	if let Err(err) = socket.read_exact(&mut packet_buffer[HEADER_SIZE..]).await {
		log::debug!("Failed to read packet body: {}", err);
		return Err(PacketReadError::CantRead);
	}
	packet_buffer[0..HEADER_SIZE].copy_from_slice(&header_buffer);

	return match ApplicationPacket::from_bytes((&packet_buffer, 0)) {
		Ok((_, packet)) => Ok(packet),
		Err(err) => Err(PacketReadError::PacketParseError(Cow::Owned(err.to_string()))),
	};
}

pub async fn write_packet_async<W: AsyncWrite + Unpin>(socket: &mut W, packet: &ApplicationPacket) -> std::io::Result<()> {
	let encoded = packet.encode().map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
	socket.write_all(&encoded).await?;
	return socket.flush().await;
}
