use std::{sync::Arc, time::Duration};

use chrono::NaiveDateTime;
use diesel::{prelude::*, update, SqliteConnection};
use rocket::{
	fairing::{Fairing, Info, Kind},
	tokio::{select, spawn, sync::Notify, task::JoinHandle, time::sleep},
	Build, Orbit, Rocket,
};
use tokio_util::sync::CancellationToken;

use super::{counts, transaction::{self, RetryPolicy}, with_status};
use crate::{
	config::OtaConfig,
	db::now,
	device_connector::{packets::{Message, UpdateAvailablePacket}, session::SessionRegistry},
	error::ApiError,
	firmware,
	model::{DeviceUpdate, RolloutStatus, UpdateState},
	schema::{device_update::dsl as update_dsl, rollout::dsl as rollout_dsl},
	MainDatabase,
};

/// An announcement the dispatcher decided to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
	pub device_id: [u8; 16],
	pub update_id: Vec<u8>,
	pub packet: UpdateAvailablePacket,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
	pub expired: usize,
	pub completed: usize,
	pub halted: usize,
	pub deliveries: Vec<Delivery>,
}

fn pending_for_online(conn: &mut SqliteConnection, rollout_id: Option<&[u8]>, online: &[Vec<u8>], limit: i64) -> QueryResult<Vec<DeviceUpdate>> {
	let mut query = update_dsl::device_update
		.filter(update_dsl::state.eq(UpdateState::Pending.as_str()))
		.filter(update_dsl::device_id.eq_any(online.to_vec()))
		.order(update_dsl::created_at.asc())
		.limit(limit)
		.into_boxed();
	query = match rollout_id {
		Some(rollout_id) => query.filter(update_dsl::rollout_id.eq(rollout_id.to_vec())),
		None => query.filter(update_dsl::rollout_id.is_null()),
	};
	return query.load(conn);
}

/// Marks the updates notified and turns them into deliveries. Updates whose
/// firmware can't be described on the wire are failed instead.
fn announce(conn: &mut SqliteConnection, updates: Vec<DeviceUpdate>, report: &mut DispatchReport) -> Result<(), ApiError> {
	for pending in updates {
		let target = firmware::find(conn, &pending.firmware_id)?;
		let Ok(device_id) = <[u8; 16]>::try_from(pending.device_id.as_slice()) else {
			continue;
		};
		let Some(packet) = transaction::offer_packet(&pending, &target) else {
			log::error!("Firmware {} can't be announced, failing update {}", hex::encode(&target.firmware_id), hex::encode(&pending.update_id));
			update(update_dsl::device_update.find(&pending.update_id))
				.set((
					update_dsl::state.eq(UpdateState::Failed.as_str()),
					update_dsl::last_error.eq(Some("firmware metadata is not announceable")),
					update_dsl::updated_at.eq(now()),
				))
				.execute(conn)?;
			continue;
		};
		if transaction::mark_notified(conn, &pending.update_id)? == 1 {
			report.deliveries.push(Delivery { device_id, update_id: pending.update_id, packet });
		}
	}
	return Ok(());
}

fn set_rollout_status(conn: &mut SqliteConnection, rollout_id: &[u8], status: RolloutStatus) -> QueryResult<usize> {
	return update(rollout_dsl::rollout.find(rollout_id)).set(rollout_dsl::status.eq(status.as_str())).execute(conn);
}

/// One pass of the dispatch algorithm. Only decides and records, sending
/// the returned deliveries is up to the caller.
pub fn plan_dispatch(conn: &mut SqliteConnection, online: &[[u8; 16]], policy: &RetryPolicy, current: NaiveDateTime) -> Result<DispatchReport, ApiError> {
	let online: Vec<Vec<u8>> = online.iter().map(|id| id.to_vec()).collect();
	let mut report = DispatchReport { expired: transaction::expire_stale(conn, policy, current)?, ..Default::default() };

	for rollout in with_status(conn, RolloutStatus::Active)? {
		let counts = counts(conn, &rollout.rollout_id)?;
		if counts.open() == 0 {
			log::info!("Rollout {} completed: {} succeeded, {} failed, {} rolled back", hex::encode(&rollout.rollout_id), counts.succeeded, counts.failed, counts.rolled_back);
			set_rollout_status(conn, &rollout.rollout_id, RolloutStatus::Completed)?;
			report.completed += 1;
			continue;
		}
		if counts.exceeds_failure_threshold(rollout.failure_threshold_percent) {
			log::warn!(
				"Halting rollout {}: {} of {} devices failed, threshold is {}%",
				hex::encode(&rollout.rollout_id), counts.failed + counts.rolled_back, counts.total, rollout.failure_threshold_percent
			);
			set_rollout_status(conn, &rollout.rollout_id, RolloutStatus::Paused)?;
			report.halted += 1;
			continue;
		}
		let free = rollout.batch_size as i64 - counts.in_flight;
		if free <= 0 || online.is_empty() {
			continue;
		}
		let admitted = pending_for_online(conn, Some(rollout.rollout_id.as_slice()), &online, free)?;
		announce(conn, admitted, &mut report)?;
	}

	if !online.is_empty() {
		let manual = pending_for_online(conn, None, &online, i64::MAX)?;
		announce(conn, manual, &mut report)?;
	}
	return Ok(report);
}

/// Periodically drives rollouts and manual updates forward
pub struct RolloutDispatcher {
	database: Arc<MainDatabase>,
	sessions: SessionRegistry,
	policy: RetryPolicy,
	wake: Arc<Notify>,
}

impl RolloutDispatcher {
	pub fn new(database: MainDatabase, sessions: SessionRegistry, config: &OtaConfig, wake: Arc<Notify>) -> Self {
		return Self {
			database: Arc::new(database),
			sessions,
			policy: RetryPolicy::from(config),
			wake,
		};
	}

	/// Runs one dispatch pass and pushes the announcements to connected devices
	pub async fn tick(&self) -> Result<DispatchReport, ApiError> {
		let online = self.sessions.online_devices();
		let policy = self.policy;
		let report = self.database.run(move |conn| {
			return conn.transaction(|conn| plan_dispatch(conn, &online, &policy, now()));
		}).await?;

		for delivery in &report.deliveries {
			if self.sessions.push(&delivery.device_id, Message::UpdateAvailable(delivery.packet)) {
				log::info!("Announced update {} to device {}", hex::encode(&delivery.update_id), hex::encode(delivery.device_id));
				continue;
			}
			// The device went away between planning and sending
			let update_id = delivery.update_id.clone();
			if let Err(err) = self.database.run(move |conn| transaction::unmark_notified(conn, &update_id)).await {
				log::error!("Failed to revert undelivered announcement: {}", err);
			}
		}
		return Ok(report);
	}

	async fn run(self: Arc<Self>, interval: Duration, canceller: CancellationToken) {
		loop {
			select! {
				_ = canceller.cancelled() => {
					log::debug!("Dispatcher stopping");
					return;
				}
				_ = sleep(interval) => {}
				_ = self.wake.notified() => {}
			}
			match self.tick().await {
				Ok(report) if report != DispatchReport::default() => {
					log::debug!("Dispatch pass: {} expired, {} completed, {} halted, {} announced", report.expired, report.completed, report.halted, report.deliveries.len());
				}
				Ok(_) => {}
				Err(err) => log::error!("Dispatch pass failed: {}", err),
			}
		}
	}

	pub fn fairing() -> DispatcherFairing {
		return DispatcherFairing { canceller: CancellationToken::new(), task: std::sync::Mutex::new(None) };
	}
}

impl From<&OtaConfig> for RetryPolicy {
	fn from(config: &OtaConfig) -> Self {
		return RetryPolicy {
			max_attempts: config.max_update_attempts,
			timeout: chrono::Duration::seconds(config.update_timeout_secs),
		};
	}
}

pub struct DispatcherFairing {
	canceller: CancellationToken,
	task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[rocket::async_trait]
impl Fairing for DispatcherFairing {
	fn info(&self) -> Info {
		return Info {
			name: "Rollout dispatcher",
			kind: Kind::Ignite | Kind::Liftoff | Kind::Shutdown,
		};
	}

	async fn on_ignite(&self, rocket: Rocket<Build>) -> Result<Rocket<Build>, Rocket<Build>> {
		let Some(database) = MainDatabase::get_one(&rocket).await else {
			log::error!("No database connection for the rollout dispatcher");
			return Err(rocket);
		};
		let (Some(config), Some(sessions), Some(wake)) = (rocket.state::<OtaConfig>(), rocket.state::<SessionRegistry>(), rocket.state::<Arc<Notify>>()) else {
			log::error!("Rollout dispatcher needs the configuration, session registry and wake handle managed first");
			return Err(rocket);
		};
		let dispatcher = RolloutDispatcher::new(database, sessions.clone(), config, wake.clone());
		return Ok(rocket.manage(Arc::new(dispatcher)));
	}

	async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
		let (Some(dispatcher), Some(config)) = (rocket.state::<Arc<RolloutDispatcher>>(), rocket.state::<OtaConfig>()) else {
			return;
		};
		let interval = Duration::from_secs(config.dispatch_interval_secs.max(1));
		let task = spawn(dispatcher.clone().run(interval, self.canceller.clone()));
		if let Ok(mut slot) = self.task.lock() {
			*slot = Some(task);
		}
		log::info!("Rollout dispatcher running every {:?}", interval);
	}

	async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
		self.canceller.cancel();
		let task = self.task.lock().ok().and_then(|mut slot| slot.take());
		if let Some(task) = task {
			task.await.ok();
		}
	}
}
