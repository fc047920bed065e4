//! One-time provisioning exchange that hands a device its Wi-Fi credentials
//! and its server identity.
//!
//! The exchange runs over any byte stream, normally a Bluetooth serial
//! profile. The provisioning client sends five newline terminated lines:
//! SSID, passphrase, server address, device id and device key. The device
//! answers with a single `OK` or `ERR <CODE>` line.

use std::time::Duration;

use rocket::tokio::{io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt}, time::timeout};
use thiserror::Error;

pub const MAX_LINE_LEN: usize = 256;
pub const MAX_SSID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
	pub ssid: String,
	/// Empty for open networks
	pub passphrase: String,
	/// `host:port` of the device bridge
	pub server_address: String,
	pub device_id: [u8; 16],
	pub auth_key: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningError {
	#[error("SSID must be between 1 and 32 bytes")]
	Ssid,
	#[error("passphrase must be empty, 8 to 63 printable characters or 64 hex digits")]
	Passphrase,
	#[error("server address must have the form host:port")]
	Server,
	#[error("device id must be 32 hex digits")]
	DeviceId,
	#[error("device key must be 32 hex digits")]
	AuthKey,
	#[error("line exceeds {} bytes", MAX_LINE_LEN)]
	TooLong,
	#[error("stream ended before the request was complete")]
	Truncated,
	#[error("line is not valid UTF-8")]
	Encoding,
	#[error("provisioning timed out")]
	Timeout,
	#[error("device refused provisioning with {0}")]
	Refused(String),
	#[error("provisioning stream failed: {0}")]
	Io(String),
}

impl ProvisioningError {
	/// Code sent back to the provisioning client in an `ERR` line
	pub fn code(&self) -> &str {
		return match self {
			ProvisioningError::Ssid => "SSID",
			ProvisioningError::Passphrase => "PASSPHRASE",
			ProvisioningError::Server => "SERVER",
			ProvisioningError::DeviceId => "DEVICE_ID",
			ProvisioningError::AuthKey => "AUTH_KEY",
			ProvisioningError::TooLong => "TOO_LONG",
			ProvisioningError::Truncated => "TRUNCATED",
			ProvisioningError::Encoding => "ENCODING",
			ProvisioningError::Timeout => "TIMEOUT",
			ProvisioningError::Refused(code) => code.as_str(),
			ProvisioningError::Io(_) => "IO",
		};
	}
}

impl From<std::io::Error> for ProvisioningError {
	fn from(err: std::io::Error) -> Self {
		return ProvisioningError::Io(err.to_string());
	}
}

fn validate_ssid(ssid: &str) -> Result<(), ProvisioningError> {
	if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
		return Err(ProvisioningError::Ssid);
	}
	return Ok(());
}

fn validate_passphrase(passphrase: &str) -> Result<(), ProvisioningError> {
	let valid = match passphrase.len() {
		0 => true,
		8..=63 => passphrase.bytes().all(|byte| (0x20..=0x7E).contains(&byte)),
		64 => passphrase.bytes().all(|byte| byte.is_ascii_hexdigit()),
		_ => false,
	};
	if !valid {
		return Err(ProvisioningError::Passphrase);
	}
	return Ok(());
}

fn validate_server(address: &str) -> Result<(), ProvisioningError> {
	let Some((host, port)) = address.rsplit_once(':') else {
		return Err(ProvisioningError::Server);
	};
	if host.is_empty() || host.contains(char::is_whitespace) {
		return Err(ProvisioningError::Server);
	}
	match port.parse::<u16>() {
		Ok(port) if port != 0 => return Ok(()),
		_ => return Err(ProvisioningError::Server),
	}
}

fn decode_key(text: &str, err: ProvisioningError) -> Result<[u8; 16], ProvisioningError> {
	let mut bytes = [0u8; 16];
	hex::decode_to_slice(text, &mut bytes).map_err(|_| err)?;
	return Ok(bytes);
}

impl ProvisioningRequest {
	pub fn from_lines(lines: &[String]) -> Result<Self, ProvisioningError> {
		let [ssid, passphrase, server_address, device_id, auth_key] = lines else {
			return Err(ProvisioningError::Truncated);
		};
		validate_ssid(ssid)?;
		validate_passphrase(passphrase)?;
		validate_server(server_address)?;
		return Ok(Self {
			ssid: ssid.clone(),
			passphrase: passphrase.clone(),
			server_address: server_address.clone(),
			device_id: decode_key(device_id, ProvisioningError::DeviceId)?,
			auth_key: decode_key(auth_key, ProvisioningError::AuthKey)?,
		});
	}

	pub fn encode(&self) -> String {
		return format!("{}\n{}\n{}", self.ssid, self.passphrase, server_identity(&self.server_address, &self.device_id, &self.auth_key));
	}
}

/// Lines three to five of a request. Handed to the user at device
/// registration, the provisioning app prepends the Wi-Fi credentials.
pub fn server_identity(server_address: &str, device_id: &[u8], auth_key: &[u8]) -> String {
	return format!("{}\n{}\n{}\n", server_address, hex::encode(device_id), hex::encode(auth_key));
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ProvisioningError> {
	let mut buffer = Vec::new();
	// One extra byte on top of the line and its terminator detects overlong lines
	let limit = (MAX_LINE_LEN + 3) as u64;
	(&mut *reader).take(limit).read_until(b'\n', &mut buffer).await?;
	if buffer.last() != Some(&b'\n') {
		if buffer.len() as u64 >= limit {
			return Err(ProvisioningError::TooLong);
		}
		return Err(ProvisioningError::Truncated);
	}
	buffer.pop();
	if buffer.last() == Some(&b'\r') {
		buffer.pop();
	}
	if buffer.len() > MAX_LINE_LEN {
		return Err(ProvisioningError::TooLong);
	}
	return String::from_utf8(buffer).map_err(|_| ProvisioningError::Encoding);
}

async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ProvisioningRequest, ProvisioningError> {
	let mut lines = Vec::with_capacity(5);
	for _ in 0..5 {
		lines.push(read_line(reader).await?);
	}
	return ProvisioningRequest::from_lines(&lines);
}

/// Device side. Reads a request, validates it and acknowledges it.
pub async fn accept<R, W>(reader: &mut R, writer: &mut W, limit: Duration) -> Result<ProvisioningRequest, ProvisioningError>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let result = match timeout(limit, read_request(reader)).await {
		Ok(result) => result,
		Err(_) => Err(ProvisioningError::Timeout),
	};
	let ack = match &result {
		Ok(_) => String::from("OK\n"),
		Err(err) => format!("ERR {}\n", err.code()),
	};
	writer.write_all(ack.as_bytes()).await?;
	writer.flush().await?;
	return result;
}

/// Client side. Sends a request and waits for the acknowledgment.
pub async fn send<R, W>(reader: &mut R, writer: &mut W, request: &ProvisioningRequest, limit: Duration) -> Result<(), ProvisioningError>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	writer.write_all(request.encode().as_bytes()).await?;
	writer.flush().await?;
	let ack = match timeout(limit, read_line(reader)).await {
		Ok(line) => line?,
		Err(_) => return Err(ProvisioningError::Timeout),
	};
	if ack == "OK" {
		return Ok(());
	}
	return match ack.strip_prefix("ERR ") {
		Some(code) => Err(ProvisioningError::Refused(code.to_owned())),
		None => Err(ProvisioningError::Refused(ack)),
	};
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use rocket::tokio::io::{self, AsyncReadExt, AsyncWriteExt, BufReader};

	use super::*;

	fn lines(parts: &[&str]) -> Vec<String> {
		return parts.iter().map(|part| part.to_string()).collect();
	}

	const DEVICE_ID: &str = "000102030405060708090a0b0c0d0e0f";
	const AUTH_KEY: &str = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff";

	#[test]
	fn parses_valid_request() {
		let request = ProvisioningRequest::from_lines(&lines(&["home", "hunter22", "10.0.0.5:3333", DEVICE_ID, AUTH_KEY])).unwrap();
		assert_eq!(request.ssid, "home");
		assert_eq!(request.device_id[15], 0x0f);
		assert_eq!(request.auth_key[0], 0xf0);
	}

	#[test]
	fn accepts_open_network_and_raw_psk() {
		assert!(ProvisioningRequest::from_lines(&lines(&["cafe", "", "ota.local:1", DEVICE_ID, AUTH_KEY])).is_ok());
		let psk = "a".repeat(64);
		assert!(ProvisioningRequest::from_lines(&lines(&["cafe", &psk, "ota.local:1", DEVICE_ID, AUTH_KEY])).is_ok());
	}

	#[test]
	fn rejects_bad_fields() {
		let long_ssid = "s".repeat(33);
		let check = |parts: &[&str]| ProvisioningRequest::from_lines(&lines(parts)).unwrap_err();
		assert_eq!(check(&["", "hunter22", "h:1", DEVICE_ID, AUTH_KEY]), ProvisioningError::Ssid);
		assert_eq!(check(&[&long_ssid, "hunter22", "h:1", DEVICE_ID, AUTH_KEY]), ProvisioningError::Ssid);
		assert_eq!(check(&["home", "short", "h:1", DEVICE_ID, AUTH_KEY]), ProvisioningError::Passphrase);
		assert_eq!(check(&["home", &"z".repeat(64), "h:1", DEVICE_ID, AUTH_KEY]), ProvisioningError::Passphrase);
		assert_eq!(check(&["home", "hunter22", "nohost", DEVICE_ID, AUTH_KEY]), ProvisioningError::Server);
		assert_eq!(check(&["home", "hunter22", "h:0", DEVICE_ID, AUTH_KEY]), ProvisioningError::Server);
		assert_eq!(check(&["home", "hunter22", "h:1", "abcd", AUTH_KEY]), ProvisioningError::DeviceId);
		assert_eq!(check(&["home", "hunter22", "h:1", DEVICE_ID, "xyz"]), ProvisioningError::AuthKey);
	}

	#[rocket::async_test]
	async fn exchange_over_stream() {
		let (device_side, client_side) = io::duplex(4096);
		let (device_read, mut device_write) = io::split(device_side);
		let (client_read, mut client_write) = io::split(client_side);
		let request = ProvisioningRequest {
			ssid: String::from("home"),
			passphrase: String::from("hunter22"),
			server_address: String::from("192.168.1.10:3333"),
			device_id: [1; 16],
			auth_key: [2; 16],
		};
		let sent = request.clone();
		let client = rocket::tokio::spawn(async move {
			let mut reader = BufReader::new(client_read);
			return send(&mut reader, &mut client_write, &sent, Duration::from_secs(5)).await;
		});
		let mut reader = BufReader::new(device_read);
		let received = accept(&mut reader, &mut device_write, Duration::from_secs(5)).await.unwrap();
		assert_eq!(received, request);
		client.await.unwrap().unwrap();
	}

	#[rocket::async_test]
	async fn invalid_request_is_answered_with_code() {
		let (device_side, mut client_side) = io::duplex(4096);
		let (device_read, mut device_write) = io::split(device_side);
		client_side.write_all(b"home\r\nshort\r\nh:1\r\n00\r\n00\r\n").await.unwrap();
		let mut reader = BufReader::new(device_read);
		let err = accept(&mut reader, &mut device_write, Duration::from_secs(5)).await.unwrap_err();
		assert_eq!(err, ProvisioningError::Passphrase);
		let mut ack = [0u8; 15];
		client_side.read_exact(&mut ack).await.unwrap();
		assert_eq!(&ack, b"ERR PASSPHRASE\n");
	}

	#[rocket::async_test]
	async fn overlong_line_is_rejected() {
		let (device_side, mut client_side) = io::duplex(4096);
		let (device_read, mut device_write) = io::split(device_side);
		let line = format!("{}\n", "x".repeat(MAX_LINE_LEN + 10));
		client_side.write_all(line.as_bytes()).await.unwrap();
		let mut reader = BufReader::new(device_read);
		let err = accept(&mut reader, &mut device_write, Duration::from_secs(5)).await.unwrap_err();
		assert_eq!(err, ProvisioningError::TooLong);
	}

	#[rocket::async_test]
	async fn silent_client_times_out() {
		let (device_side, _client_side) = io::duplex(64);
		let (device_read, mut device_write) = io::split(device_side);
		let mut reader = BufReader::new(device_read);
		let err = accept(&mut reader, &mut device_write, Duration::from_millis(50)).await.unwrap_err();
		assert_eq!(err, ProvisioningError::Timeout);
	}

	#[rocket::async_test]
	async fn truncated_stream() {
		let (device_side, mut client_side) = io::duplex(4096);
		let (device_read, mut device_write) = io::split(device_side);
		client_side.write_all(b"home\nhunter22\n").await.unwrap();
		client_side.shutdown().await.unwrap();
		let mut reader = BufReader::new(device_read);
		let err = accept(&mut reader, &mut device_write, Duration::from_secs(5)).await.unwrap_err();
		assert_eq!(err, ProvisioningError::Truncated);
	}
}
