use std::{net::SocketAddr, path::PathBuf, sync::{Arc, Mutex}, time::{Duration, Instant}};

use diesel::{delete, prelude::*, update, Connection as _};
use packets::{
	read_packet_async, write_packet_async, AcknowledgePacket, ApplicationPacket, CheckForUpdatePacket, EmptyPacket, FirmwareChunkPacket,
	FirmwareChunkRequestPacket, InitiateConnectionPacket, Message, PacketReadError, ResultCode, UpdateStatusPacket,
};
use rocket::{
	fairing::{Fairing, Info, Kind},
	tokio::{
		net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
		select, spawn,
		sync::{mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender}, Notify},
		task::JoinHandle,
	},
	Build, Orbit, Rocket,
};
use session::SessionRegistry;
use tokio_util::sync::CancellationToken;

use crate::{
	auth::hash_device_key,
	config::OtaConfig,
	db::now,
	firmware::read_chunk,
	model::Device,
	rollout::transaction::{self, ReportOutcome, RetryPolicy},
	schema::{device::dsl as device_dsl, device_update::dsl as update_dsl},
	version::FirmwareVersion,
	MainDatabase,
};

pub mod packets;
pub mod session;

/// `last_seen` is written at most this often per connection
const LAST_SEEN_INTERVAL: Duration = Duration::from_secs(10);

/// Shared by every connection task
struct BridgeContext {
	database: MainDatabase,
	sessions: SessionRegistry,
	wake: Arc<Notify>,
	policy: RetryPolicy,
	chunk_size: u16,
}

/// TCP endpoint devices keep a session with
pub struct DeviceBridge {
	local_addr: SocketAddr,
	canceller: CancellationToken,
	listening_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceBridge {
	fn start(port: u16, context: BridgeContext) -> std::io::Result<Self> {
		let tcp_socket = std::net::TcpListener::bind(("0.0.0.0", port))?;
		tcp_socket.set_nonblocking(true)?;
		let tcp_socket = TcpListener::from_std(tcp_socket)?;
		let local_addr = tcp_socket.local_addr()?;

		let canceller = CancellationToken::new();
		let context = Arc::new(context);
		let listener_canceller = canceller.clone();
		let listening_task = spawn(async move {
			loop {
				select! {
					_ = listener_canceller.cancelled() => {
						return;
					}
					connection = tcp_socket.accept() => {
						match connection {
							Ok((stream, peer)) => {
								log::debug!("Device connection from {}", peer);
								spawn(handle_connection(stream, context.clone(), listener_canceller.child_token()));
							}
							Err(err) => {
								log::warn!("Failed to accept device connection: {}", err);
							}
						}
					}
				}
			}
		});
		log::info!("Device bridge listening on {}", local_addr);

		return Ok(Self { local_addr, canceller, listening_task: Mutex::new(Some(listening_task)) });
	}

	/// Address the bridge is bound to, useful when the configured port was 0
	pub fn local_addr(&self) -> SocketAddr {
		return self.local_addr;
	}

	/// Stops accepting and closes every open connection
	pub async fn shutdown(&self) {
		self.canceller.cancel();
		let task = self.listening_task.lock().ok().and_then(|mut slot| slot.take());
		if let Some(task) = task {
			task.await.ok();
		}
	}

	pub fn fairing() -> DeviceBridgeFairing {
		return DeviceBridgeFairing;
	}
}

async fn write_queued(mut writer: OwnedWriteHalf, mut queue: UnboundedReceiver<ApplicationPacket>, canceller: CancellationToken) {
	loop {
		select! {
			_ = canceller.cancelled() => {
				return;
			}
			packet = queue.recv() => {
				let Some(packet) = packet else {
					return;
				};
				if let Err(err) = write_packet_async(&mut writer, &packet).await {
					log::warn!("Failed writing to device: {}", err);
					canceller.cancel();
					return;
				}
			}
		}
	}
}

async fn handle_connection(socket: TcpStream, context: Arc<BridgeContext>, canceller: CancellationToken) {
	let (mut reader, writer) = socket.into_split();
	let (outbound, queue) = unbounded_channel();
	let writer_task = spawn(write_queued(writer, queue, canceller.clone()));
	let mut connection = Connection { context, outbound, canceller: canceller.clone(), session: None, last_seen_written: None };

	loop {
		select! {
			_ = canceller.cancelled() => {
				break;
			}
			read_result = read_packet_async(&mut reader) => {
				match read_result {
					Ok(packet) => {
						match connection.handle_packet(packet).await {
							Ok(_) => {
								log::debug!("Finished packet handler");
							}
							Err(PacketHandlerError::Ending) => {
								log::info!("Closing device connection");
								break;
							}
							Err(PacketHandlerError::NonEnding) => {
								log::warn!("Packet handler failed, keeping the connection");
							}
						};
					}
					Err(PacketReadError::CantRead) => {
						log::debug!("Device stream ended");
						break;
					}
					Err(PacketReadError::TooLarge(size)) => {
						log::warn!("Device announced a {} byte body, dropping the connection", size);
						break;
					}
					Err(PacketReadError::HeaderParseError(data) | PacketReadError::PacketParseError(data)) => {
						log::warn!("Packet parsing failure: {}", data);
						connection.acknowledge(ResultCode::InvalidRequest);
					}
				}
			}
		}
	}

	if let Some((session_id, _)) = connection.session {
		connection.context.sessions.close(&session_id);
	}
	// Lets already queued replies go out before the writer stops
	drop(connection);
	writer_task.await.ok();
}

/// Makes a decision to either kill the socket or not
enum PacketHandlerError {
	Ending,
	NonEnding,
}

struct Connection {
	context: Arc<BridgeContext>,
	outbound: UnboundedSender<ApplicationPacket>,
	canceller: CancellationToken,
	/// Session id and device id once authenticated
	session: Option<([u8; 16], [u8; 16])>,
	last_seen_written: Option<Instant>,
}

impl Connection {
	fn session_id(&self) -> [u8; 16] {
		return self.session.map(|(session_id, _)| session_id).unwrap_or([0; 16]);
	}

	fn respond(&self, message: Message) {
		if self.outbound.send(ApplicationPacket::new(self.session_id(), true, message)).is_err() {
			log::debug!("Writer is gone, dropping reply");
		}
	}

	fn acknowledge(&self, result: ResultCode) {
		self.respond(Message::Acknowledge(AcknowledgePacket { result }));
	}

	async fn handle_packet(&mut self, packet: ApplicationPacket) -> Result<(), PacketHandlerError> {
		log::trace!("Got packet: {:?}", packet);
		if let Message::InitiateConnection(data) = packet.message {
			return self.handle_initiation(data).await;
		}
		let Some((session_id, device_id)) = self.session else {
			log::debug!("Packet before InitiateConnection");
			self.acknowledge(ResultCode::NotConnected);
			return Err(PacketHandlerError::NonEnding);
		};
		if packet.header.session_id != session_id {
			log::debug!("Packet carries session {} instead of {}", hex::encode(packet.header.session_id), hex::encode(session_id));
			self.acknowledge(ResultCode::NotConnected);
			return Err(PacketHandlerError::NonEnding);
		}
		self.touch(device_id).await;

		match packet.message {
			Message::NoOperation(_) => {
				self.respond(Message::NoOperation(EmptyPacket {}));
				return Ok(());
			}
			Message::UnregisterDevice(_) => {
				return self.handle_unregister(device_id).await;
			}
			Message::CheckForUpdate(data) => {
				return self.handle_update_check(device_id, data).await;
			}
			Message::FirmwareChunkRequest(data) => {
				return self.handle_chunk_request(device_id, data).await;
			}
			Message::UpdateStatus(data) => {
				return self.handle_status(device_id, data).await;
			}
			other => {
				log::warn!("Device sent a server-only message: {:?}", other);
				self.acknowledge(ResultCode::InvalidRequest);
				return Err(PacketHandlerError::NonEnding);
			}
		}
	}

	async fn handle_initiation(&mut self, data: InitiateConnectionPacket) -> Result<(), PacketHandlerError> {
		let InitiateConnectionPacket { device_id, auth_key, firmware_version } = data;
		let version = FirmwareVersion::from(firmware_version).to_string();
		let found = self.context.database.run(move |conn| -> QueryResult<Option<Device>> {
			let device = device_dsl::device.find(device_id.to_vec()).first::<Device>(conn).optional()?;
			let Some(device) = device else {
				return Ok(None);
			};
			if device.auth_key_hash != hash_device_key(&auth_key) {
				return Ok(None);
			}
			update(device_dsl::device.find(device_id.to_vec()))
				.set((device_dsl::firmware_version.eq(Some(version)), device_dsl::last_seen.eq(Some(now()))))
				.execute(conn)?;
			return Ok(Some(device));
		}).await;

		match found {
			Ok(Some(device)) => {
				if let Some((old_session, _)) = self.session.take() {
					self.context.sessions.close(&old_session);
				}
				let session_id = self.context.sessions.open(device_id, self.outbound.clone(), self.canceller.clone());
				self.session = Some((session_id, device_id));
				self.last_seen_written = Some(Instant::now());
				log::info!("Device {} ({}) connected running {}", device.name, hex::encode(device_id), FirmwareVersion::from(firmware_version));
				self.acknowledge(ResultCode::Ok);
				// Pending rollout updates may now be deliverable
				self.context.wake.notify_one();
				return Ok(());
			}
			Ok(None) => {
				log::warn!("Rejected connection for device {}: bad credentials", hex::encode(device_id));
				self.acknowledge(ResultCode::BadCredentials);
				return Err(PacketHandlerError::Ending);
			}
			Err(err) => {
				log::error!("Database error during device authentication: {}", err);
				self.acknowledge(ResultCode::InternalError);
				return Err(PacketHandlerError::Ending);
			}
		}
	}

	async fn touch(&mut self, device_id: [u8; 16]) {
		if self.last_seen_written.is_some_and(|written| written.elapsed() < LAST_SEEN_INTERVAL) {
			return;
		}
		self.last_seen_written = Some(Instant::now());
		let result = self.context.database.run(move |conn| {
			update(device_dsl::device.find(device_id.to_vec())).set(device_dsl::last_seen.eq(Some(now()))).execute(conn)
		}).await;
		if let Err(err) = result {
			log::warn!("Failed to record last_seen: {}", err);
		}
	}

	async fn handle_unregister(&mut self, device_id: [u8; 16]) -> Result<(), PacketHandlerError> {
		let result = self.context.database.run(move |conn| {
			return conn.transaction(|conn| {
				delete(update_dsl::device_update.filter(update_dsl::device_id.eq(device_id.to_vec()))).execute(conn)?;
				return delete(device_dsl::device.find(device_id.to_vec())).execute(conn);
			});
		}).await;
		match result {
			Ok(_) => {
				log::info!("Device {} unregistered itself", hex::encode(device_id));
				self.acknowledge(ResultCode::Ok);
				return Err(PacketHandlerError::Ending);
			}
			Err(err) => {
				log::error!("Failed to unregister device {}: {}", hex::encode(device_id), err);
				self.acknowledge(ResultCode::InternalError);
				return Err(PacketHandlerError::NonEnding);
			}
		}
	}

	async fn handle_update_check(&mut self, device_id: [u8; 16], data: CheckForUpdatePacket) -> Result<(), PacketHandlerError> {
		let reported = FirmwareVersion::from(data.current_version);
		let result = self.context.database.run(move |conn| {
			return conn.transaction(|conn| {
				update(device_dsl::device.find(device_id.to_vec()))
					.set(device_dsl::firmware_version.eq(Some(reported.to_string())))
					.execute(conn)?;
				return transaction::actionable_for_device(conn, &device_id);
			});
		}).await;
		match result {
			Ok(Some((open, firmware))) => match transaction::offer_packet(&open, &firmware) {
				Some(offer) => {
					self.respond(Message::UpdateAvailable(offer));
					return Ok(());
				}
				None => {
					log::error!("Firmware {} can't be announced", hex::encode(&firmware.firmware_id));
					self.acknowledge(ResultCode::InternalError);
					return Err(PacketHandlerError::NonEnding);
				}
			},
			Ok(None) => {
				self.respond(Message::NoUpdate(EmptyPacket {}));
				return Ok(());
			}
			Err(err) => {
				log::error!("Update check failed: {}", err);
				self.acknowledge(ResultCode::InternalError);
				return Err(PacketHandlerError::NonEnding);
			}
		}
	}

	async fn handle_chunk_request(&mut self, device_id: [u8; 16], data: FirmwareChunkRequestPacket) -> Result<(), PacketHandlerError> {
		let FirmwareChunkRequestPacket { update_id, offset, length } = data;
		let found = self.context.database.run(move |conn| transaction::begin_download(conn, &update_id, &device_id)).await;
		let firmware = match found {
			Ok(Some(firmware)) => firmware,
			Ok(None) => {
				log::debug!("Chunk request for unknown update {}", hex::encode(update_id));
				self.acknowledge(ResultCode::UnknownUpdate);
				return Err(PacketHandlerError::NonEnding);
			}
			Err(err) => {
				log::error!("Chunk lookup failed: {}", err);
				self.acknowledge(ResultCode::InternalError);
				return Err(PacketHandlerError::NonEnding);
			}
		};
		if offset as i64 > firmware.size {
			self.acknowledge(ResultCode::InvalidRequest);
			return Err(PacketHandlerError::NonEnding);
		}
		let length = length.min(self.context.chunk_size) as usize;
		match read_chunk(&PathBuf::from(&firmware.artifact_path), offset as u64, length).await {
			Ok(chunk) => {
				self.respond(Message::FirmwareChunk(FirmwareChunkPacket::new(update_id, offset, chunk)));
				return Ok(());
			}
			Err(err) => {
				log::error!("Failed to read artifact {}: {}", firmware.artifact_path, err);
				self.acknowledge(ResultCode::InternalError);
				return Err(PacketHandlerError::NonEnding);
			}
		}
	}

	async fn handle_status(&mut self, device_id: [u8; 16], data: UpdateStatusPacket) -> Result<(), PacketHandlerError> {
		let UpdateStatusPacket { update_id, state, detail } = data;
		let policy = self.context.policy;
		let outcome = self.context.database.run(move |conn| transaction::apply_report(conn, &update_id, &device_id, state, detail, &policy)).await;
		match outcome {
			Ok(ReportOutcome::Applied(next)) => {
				log::debug!("Update {} is now {}", hex::encode(update_id), next);
				self.acknowledge(ResultCode::Ok);
				if next.is_terminal() {
					self.context.wake.notify_one();
				}
				return Ok(());
			}
			Ok(ReportOutcome::Unknown) => {
				self.acknowledge(ResultCode::UnknownUpdate);
				return Err(PacketHandlerError::NonEnding);
			}
			Err(err) => {
				log::error!("Failed to apply status report: {}", err);
				self.acknowledge(ResultCode::InternalError);
				return Err(PacketHandlerError::NonEnding);
			}
		}
	}
}

pub struct DeviceBridgeFairing;

#[rocket::async_trait]
impl Fairing for DeviceBridgeFairing {
	fn info(&self) -> Info {
		return Info {
			name: "Device bridge",
			kind: Kind::Ignite | Kind::Shutdown,
		};
	}

	async fn on_ignite(&self, rocket: Rocket<Build>) -> Result<Rocket<Build>, Rocket<Build>> {
		let Some(database) = MainDatabase::get_one(&rocket).await else {
			log::error!("No database connection for the device bridge");
			return Err(rocket);
		};
		let (Some(config), Some(sessions), Some(wake)) = (rocket.state::<OtaConfig>(), rocket.state::<SessionRegistry>(), rocket.state::<Arc<Notify>>()) else {
			log::error!("Device bridge needs the configuration, session registry and wake handle managed first");
			return Err(rocket);
		};
		let port = config.device_port;
		let context = BridgeContext {
			database,
			sessions: sessions.clone(),
			wake: wake.clone(),
			policy: RetryPolicy::from(config),
			chunk_size: config.chunk_size.max(1),
		};
		return match DeviceBridge::start(port, context) {
			Ok(bridge) => Ok(rocket.manage(bridge)),
			Err(err) => {
				log::error!("Failed to bind device bridge on port {}: {}", port, err);
				Err(rocket)
			}
		};
	}

	async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
		if let Some(bridge) = rocket.state::<DeviceBridge>() {
			bridge.shutdown().await;
		}
	}
}
