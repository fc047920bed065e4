use std::{collections::HashMap, sync::{Arc, Mutex, MutexGuard}};

use rocket::tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::packets::{ApplicationPacket, Message};

pub struct Session {
	pub device_id: [u8; 16],
	outbound: UnboundedSender<ApplicationPacket>,
	canceller: CancellationToken,
}

#[derive(Default)]
struct Sessions {
	by_session: HashMap<[u8; 16], Session>,
	by_device: HashMap<[u8; 16], [u8; 16]>,
}

/// Authenticated device connections, shared by the bridge and the dispatcher
#[derive(Clone, Default)]
pub struct SessionRegistry {
	inner: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
	fn lock(&self) -> MutexGuard<'_, Sessions> {
		// Nothing panics while holding the lock, poisoning only follows a bug elsewhere
		return self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
	}

	/// Registers a connection for `device_id` and returns its new session id.
	/// An older connection of the same device is cancelled.
	pub fn open(&self, device_id: [u8; 16], outbound: UnboundedSender<ApplicationPacket>, canceller: CancellationToken) -> [u8; 16] {
		let mut sessions = self.lock();
		let mut session_id = rand::random::<[u8; 16]>();
		while session_id == [0; 16] || sessions.by_session.contains_key(&session_id) {
			session_id = rand::random();
		}
		if let Some(previous) = sessions.by_device.insert(device_id, session_id) {
			if let Some(old) = sessions.by_session.remove(&previous) {
				log::info!("Device {} reconnected, dropping session {}", hex::encode(device_id), hex::encode(previous));
				old.canceller.cancel();
			}
		}
		sessions.by_session.insert(session_id, Session { device_id, outbound, canceller });
		return session_id;
	}

	pub fn close(&self, session_id: &[u8; 16]) {
		let mut sessions = self.lock();
		if let Some(session) = sessions.by_session.remove(session_id) {
			if sessions.by_device.get(&session.device_id) == Some(session_id) {
				sessions.by_device.remove(&session.device_id);
			}
		}
	}

	pub fn device_for(&self, session_id: &[u8; 16]) -> Option<[u8; 16]> {
		return self.lock().by_session.get(session_id).map(|session| session.device_id);
	}

	pub fn is_online(&self, device_id: &[u8]) -> bool {
		let Ok(device_id) = <[u8; 16]>::try_from(device_id) else {
			return false;
		};
		return self.lock().by_device.contains_key(&device_id);
	}

	pub fn online_devices(&self) -> Vec<[u8; 16]> {
		return self.lock().by_device.keys().copied().collect();
	}

	/// Queues an unsolicited packet for the device. Returns false when the
	/// device has no live session.
	pub fn push(&self, device_id: &[u8; 16], message: Message) -> bool {
		let sessions = self.lock();
		let Some(session_id) = sessions.by_device.get(device_id) else {
			return false;
		};
		let Some(session) = sessions.by_session.get(session_id) else {
			return false;
		};
		return session.outbound.send(ApplicationPacket::new(*session_id, false, message)).is_ok();
	}

	pub fn disconnect(&self, device_id: &[u8]) {
		let Ok(device_id) = <[u8; 16]>::try_from(device_id) else {
			return;
		};
		let mut sessions = self.lock();
		if let Some(session_id) = sessions.by_device.remove(&device_id) {
			if let Some(session) = sessions.by_session.remove(&session_id) {
				session.canceller.cancel();
			}
		}
	}
}
