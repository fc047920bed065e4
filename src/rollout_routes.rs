use std::sync::Arc;

use chrono::NaiveDateTime;
use rocket::{get, post, routes, serde::json::Json, tokio::sync::Notify, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
	auth::AdminUser,
	config::OtaConfig,
	db::{format_id, parse_id},
	error::{ApiError, ApiResult},
	model::{Rollout, RolloutStatus},
	rollout::{self, NewRollout, RolloutCounts},
	MainDatabase,
};

pub fn routes() -> Vec<Route> {
	return routes![
		create_rollout,
		list_rollouts,
		get_rollout,
		pause_rollout,
		resume_rollout,
		abort_rollout,
	];
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RolloutView {
	pub rollout_id: String,
	pub firmware_id: String,
	pub status: RolloutStatus,
	pub batch_size: i32,
	pub failure_threshold_percent: i32,
	pub created_by: String,
	pub created_at: NaiveDateTime,
	pub counts: RolloutCounts,
}

impl RolloutView {
	fn new(row: Rollout, counts: RolloutCounts) -> Self {
		return Self {
			status: row.status(),
			rollout_id: format_id(&row.rollout_id),
			firmware_id: format_id(&row.firmware_id),
			batch_size: row.batch_size,
			failure_threshold_percent: row.failure_threshold_percent,
			created_by: format_id(&row.created_by),
			created_at: row.created_at,
			counts,
		};
	}
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CreateRolloutData {
	pub firmware_id: String,
	pub batch_size: Option<i32>,
	pub failure_threshold_percent: Option<i32>,
}

#[post("/", data = "<rollout_data>")]
async fn create_rollout(database: MainDatabase, config: &State<OtaConfig>, wake: &State<Arc<Notify>>, admin: AdminUser, rollout_data: Json<CreateRolloutData>) -> ApiResult<RolloutView> {
	let data = rollout_data.0;
	let new = NewRollout {
		firmware_id: parse_id(&data.firmware_id)?,
		created_by: admin.0.user_id,
		batch_size: data.batch_size.unwrap_or(config.default_batch_size),
		failure_threshold_percent: data.failure_threshold_percent.unwrap_or(config.default_failure_threshold_percent),
	};
	let (created, counts) = database.run(move |conn| rollout::create(conn, new)).await?;
	wake.notify_one();
	return Ok(Json(RolloutView::new(created, counts)));
}

#[get("/")]
async fn list_rollouts(database: MainDatabase, _admin: AdminUser) -> ApiResult<Vec<RolloutView>> {
	let listed = database.run(|conn| -> Result<Vec<(Rollout, RolloutCounts)>, ApiError> {
		let mut listed = Vec::new();
		for row in rollout::list(conn)? {
			let counts = rollout::counts(conn, &row.rollout_id)?;
			listed.push((row, counts));
		}
		return Ok(listed);
	}).await?;
	return Ok(Json(listed.into_iter().map(|(row, counts)| RolloutView::new(row, counts)).collect()));
}

async fn load_view(database: &MainDatabase, rollout_id: Vec<u8>) -> ApiResult<RolloutView> {
	let (row, counts) = database.run(move |conn| -> Result<(Rollout, RolloutCounts), ApiError> {
		let row = rollout::find(conn, &rollout_id)?;
		let counts = rollout::counts(conn, &rollout_id)?;
		return Ok((row, counts));
	}).await?;
	return Ok(Json(RolloutView::new(row, counts)));
}

#[get("/<rollout_id>")]
async fn get_rollout(database: MainDatabase, _admin: AdminUser, rollout_id: &str) -> ApiResult<RolloutView> {
	return load_view(&database, parse_id(rollout_id)?).await;
}

async fn change_status(database: &MainDatabase, rollout_id: &str, next: RolloutStatus) -> ApiResult<RolloutView> {
	let rollout_id = parse_id(rollout_id)?;
	let target = rollout_id.clone();
	let changed = database.run(move |conn| rollout::set_status(conn, &target, next)).await?;
	log::info!("Rollout {} is now {}", format_id(&changed.rollout_id), changed.status());
	return load_view(database, rollout_id).await;
}

#[post("/<rollout_id>/pause")]
async fn pause_rollout(database: MainDatabase, _admin: AdminUser, rollout_id: &str) -> ApiResult<RolloutView> {
	return change_status(&database, rollout_id, RolloutStatus::Paused).await;
}

#[post("/<rollout_id>/resume")]
async fn resume_rollout(database: MainDatabase, wake: &State<Arc<Notify>>, _admin: AdminUser, rollout_id: &str) -> ApiResult<RolloutView> {
	let resumed = change_status(&database, rollout_id, RolloutStatus::Active).await?;
	wake.notify_one();
	return Ok(resumed);
}

#[post("/<rollout_id>/abort")]
async fn abort_rollout(database: MainDatabase, _admin: AdminUser, rollout_id: &str) -> ApiResult<RolloutView> {
	return change_status(&database, rollout_id, RolloutStatus::Aborted).await;
}
