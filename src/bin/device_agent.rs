//! Reference device agent. Waits for provisioning on standard input when it
//! has no stored identity, then keeps a session with the device bridge and
//! installs whatever update the server offers into two image files.

use std::{io::ErrorKind, path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use ota_server::{
	agent::{client::AgentClient, slots::DirectorySlots, AgentError, ImageSlot, UpdateTransaction},
	provisioning::{self, ProvisioningError, ProvisioningRequest},
	version::FirmwareVersion,
};
use rocket::tokio::{fs, io::BufReader, select, signal::ctrl_c, time::sleep};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "device-agent", about = "Simulated device for the OTA server")]
struct Args {
	/// Holds the stored provisioning and both image slots
	#[arg(long, default_value = "device-data")]
	data_dir: PathBuf,

	/// Seconds between update checks
	#[arg(long, default_value_t = 60)]
	poll_secs: u64,

	/// Version of the factory image when the slots are created
	#[arg(long, default_value = "0.0.1")]
	initial_version: FirmwareVersion,

	#[arg(long, default_value_t = 300)]
	provisioning_timeout_secs: u64,

	#[arg(long, default_value_t = 1024)]
	chunk_size: u16,

	/// Unregister from the server and wipe the stored state
	#[arg(long)]
	reset: bool,
}

#[derive(Debug, Error)]
enum Failure {
	#[error("provisioning failed: {0}")]
	Provisioning(#[from] ProvisioningError),
	#[error(transparent)]
	Agent(#[from] AgentError),
	#[error("can't access {0}: {1}")]
	Storage(PathBuf, std::io::Error),
}

const PROVISIONING_FILE: &str = "provisioning";

async fn stored_provisioning(path: &PathBuf) -> Result<Option<ProvisioningRequest>, Failure> {
	let content = match fs::read_to_string(path).await {
		Ok(content) => content,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
		Err(err) => return Err(Failure::Storage(path.clone(), err)),
	};
	let lines: Vec<String> = content.lines().map(str::to_owned).collect();
	return Ok(Some(ProvisioningRequest::from_lines(&lines)?));
}

async fn load_or_provision(args: &Args) -> Result<ProvisioningRequest, Failure> {
	let path = args.data_dir.join(PROVISIONING_FILE);
	if let Some(request) = stored_provisioning(&path).await? {
		return Ok(request);
	}
	log::info!("No stored identity, waiting for provisioning on standard input");
	let mut reader = BufReader::new(rocket::tokio::io::stdin());
	let mut writer = rocket::tokio::io::stdout();
	let request = provisioning::accept(&mut reader, &mut writer, Duration::from_secs(args.provisioning_timeout_secs)).await?;
	fs::create_dir_all(&args.data_dir).await.map_err(|err| Failure::Storage(args.data_dir.clone(), err))?;
	fs::write(&path, request.encode()).await.map_err(|err| Failure::Storage(path.clone(), err))?;
	log::info!("Provisioned as device {} for network {}", hex::encode(request.device_id), request.ssid);
	return Ok(request);
}

/// One connection to the bridge. Returns when the connection breaks.
async fn serve(request: &ProvisioningRequest, slots: &mut DirectorySlots, args: &Args) -> Result<(), AgentError> {
	let mut client = AgentClient::connect(request.server_address.as_str(), request.device_id, request.auth_key, slots.active_version()).await?;
	let poll = Duration::from_secs(args.poll_secs.max(1));
	loop {
		let offer = match client.check_for_update(slots.active_version()).await? {
			Some(offer) => Some(offer),
			None => client.next_pushed_offer(poll).await?,
		};
		let Some(offer) = offer else {
			client.heartbeat().await?;
			continue;
		};
		log::info!("Installing {} over {}", offer.version, slots.active_version());
		let state = UpdateTransaction::new(offer, args.chunk_size).forbid_downgrade().run(&mut client, slots).await?;
		log::info!("Update finished as {:?}, running {}", state, slots.active_version());
	}
}

async fn reset(request: &ProvisioningRequest, args: &Args) -> Result<(), Failure> {
	let client = AgentClient::connect(request.server_address.as_str(), request.device_id, request.auth_key, FirmwareVersion::default()).await?;
	client.unregister().await?;
	fs::remove_dir_all(&args.data_dir).await.map_err(|err| Failure::Storage(args.data_dir.clone(), err))?;
	log::info!("Device unregistered and wiped");
	return Ok(());
}

async fn run(args: Args) -> Result<(), Failure> {
	let request = load_or_provision(&args).await?;
	if args.reset {
		return reset(&request, &args).await;
	}
	let mut slots = DirectorySlots::open(args.data_dir.join("slots"), args.initial_version).await?;
	loop {
		if let Err(err) = serve(&request, &mut slots, &args).await {
			log::warn!("Lost connection to {}: {}", request.server_address, err);
		}
		sleep(Duration::from_secs(args.poll_secs.max(1))).await;
	}
}

#[rocket::main]
async fn main() -> ExitCode {
	// Standard output carries the provisioning acknowledgement
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let args = Args::parse();
	select! {
		result = run(args) => {
			if let Err(err) = result {
				log::error!("{}", err);
				return ExitCode::FAILURE;
			}
		}
		_ = ctrl_c() => {
			log::info!("Interrupted");
		}
	}
	return ExitCode::SUCCESS;
}
