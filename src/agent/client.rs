use std::{collections::VecDeque, time::Duration};

use rocket::tokio::{net::{TcpStream, ToSocketAddrs}, time::timeout};

use super::{AgentError, FirmwareSource, UpdateOffer};
use crate::{
	device_connector::packets::{
		read_packet_async, write_packet_async, AcknowledgePacket, ApplicationPacket, CheckForUpdatePacket, EmptyPacket, FailureDetail,
		FirmwareChunkRequestPacket, InitiateConnectionPacket, Message, PacketReadError, ReportedState, ResultCode, UpdateStatusPacket,
	},
	version::FirmwareVersion,
};

/// Device end of a bridge connection
pub struct AgentClient {
	stream: TcpStream,
	session_id: [u8; 16],
	/// Packets the server sent on its own while a reply was awaited
	pushed: VecDeque<Message>,
}

fn read_error(err: PacketReadError) -> AgentError {
	return match err {
		PacketReadError::CantRead => AgentError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "server closed the connection")),
		other => AgentError::Protocol(format!("{:?}", other)),
	};
}

impl AgentClient {
	pub async fn connect<A: ToSocketAddrs>(address: A, device_id: [u8; 16], auth_key: [u8; 16], version: FirmwareVersion) -> Result<Self, AgentError> {
		let stream = TcpStream::connect(address).await?;
		let mut client = Self { stream, session_id: [0; 16], pushed: VecDeque::new() };
		let reply = client.request(Message::InitiateConnection(InitiateConnectionPacket {
			device_id,
			auth_key,
			firmware_version: version.into(),
		})).await?;
		match reply.message {
			Message::Acknowledge(AcknowledgePacket { result: ResultCode::Ok }) => {
				client.session_id = reply.header.session_id;
				log::info!("Connected to bridge with session {}", hex::encode(client.session_id));
				return Ok(client);
			}
			Message::Acknowledge(AcknowledgePacket { result }) => return Err(AgentError::Rejected(result)),
			other => return Err(AgentError::Protocol(format!("unexpected handshake reply {:?}", other))),
		}
	}

	pub fn session_id(&self) -> [u8; 16] {
		return self.session_id;
	}

	async fn request(&mut self, message: Message) -> Result<ApplicationPacket, AgentError> {
		let packet = ApplicationPacket::new(self.session_id, false, message);
		write_packet_async(&mut self.stream, &packet).await?;
		loop {
			let reply = read_packet_async(&mut self.stream).await.map_err(read_error)?;
			if reply.header.is_response {
				return Ok(reply);
			}
			self.pushed.push_back(reply.message);
		}
	}

	pub async fn heartbeat(&mut self) -> Result<(), AgentError> {
		let reply = self.request(Message::NoOperation(EmptyPacket {})).await?;
		return match reply.message {
			Message::NoOperation(_) => Ok(()),
			Message::Acknowledge(AcknowledgePacket { result }) => Err(AgentError::Rejected(result)),
			other => Err(AgentError::Protocol(format!("unexpected heartbeat reply {:?}", other))),
		};
	}

	pub async fn check_for_update(&mut self, current: FirmwareVersion) -> Result<Option<UpdateOffer>, AgentError> {
		let reply = self.request(Message::CheckForUpdate(CheckForUpdatePacket { current_version: current.into() })).await?;
		return match reply.message {
			Message::UpdateAvailable(offer) => Ok(Some(offer.into())),
			Message::NoUpdate(_) => Ok(None),
			Message::Acknowledge(AcknowledgePacket { result }) => Err(AgentError::Rejected(result)),
			other => Err(AgentError::Protocol(format!("unexpected update check reply {:?}", other))),
		};
	}

	/// Waits up to `wait` for an update pushed by the dispatcher
	pub async fn next_pushed_offer(&mut self, wait: Duration) -> Result<Option<UpdateOffer>, AgentError> {
		while let Some(message) = self.pushed.pop_front() {
			if let Message::UpdateAvailable(offer) = message {
				return Ok(Some(offer.into()));
			}
		}
		let packet = match timeout(wait, read_packet_async(&mut self.stream)).await {
			Ok(result) => result.map_err(read_error)?,
			Err(_) => return Ok(None),
		};
		return match packet.message {
			Message::UpdateAvailable(offer) => Ok(Some(offer.into())),
			other => {
				log::debug!("Ignoring unsolicited packet {:?}", other);
				Ok(None)
			}
		};
	}

	/// Tells the server the device was reset. The server forgets the device.
	pub async fn unregister(mut self) -> Result<(), AgentError> {
		let reply = self.request(Message::UnregisterDevice(EmptyPacket {})).await?;
		return match reply.message {
			Message::Acknowledge(AcknowledgePacket { result: ResultCode::Ok }) => Ok(()),
			Message::Acknowledge(AcknowledgePacket { result }) => Err(AgentError::Rejected(result)),
			other => Err(AgentError::Protocol(format!("unexpected unregister reply {:?}", other))),
		};
	}
}

#[rocket::async_trait]
impl FirmwareSource for AgentClient {
	async fn fetch_chunk(&mut self, update_id: [u8; 16], offset: u32, length: u16) -> Result<Vec<u8>, AgentError> {
		let reply = self.request(Message::FirmwareChunkRequest(FirmwareChunkRequestPacket { update_id, offset, length })).await?;
		return match reply.message {
			Message::FirmwareChunk(chunk) if chunk.update_id == update_id && chunk.offset == offset => Ok(chunk.data),
			Message::Acknowledge(AcknowledgePacket { result }) => Err(AgentError::Rejected(result)),
			other => Err(AgentError::Protocol(format!("unexpected chunk reply {:?}", other))),
		};
	}

	async fn report(&mut self, update_id: [u8; 16], state: ReportedState, detail: FailureDetail) -> Result<(), AgentError> {
		let reply = self.request(Message::UpdateStatus(UpdateStatusPacket { update_id, state, detail })).await?;
		return match reply.message {
			Message::Acknowledge(AcknowledgePacket { result: ResultCode::Ok }) => Ok(()),
			Message::Acknowledge(AcknowledgePacket { result }) => Err(AgentError::Rejected(result)),
			other => Err(AgentError::Protocol(format!("unexpected status reply {:?}", other))),
		};
	}
}
