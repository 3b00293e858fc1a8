//! Fleet worker daemon entry point: parses configuration, loads the local
//! hardware inventory, and hands off to [`daemon::Daemon::run`] for the
//! lifetime of the process.

mod command;
mod config;
mod daemon;
mod error;
mod gpu;
mod job;
mod rpc;
mod selector;
mod stream;

use clap::Parser;

use crate::config::{Cli, HardwareInventory};
use crate::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let inventory = HardwareInventory::load(cli.daemon.gpu_descriptors_path.as_deref())?;
	let ffmpeg_binary = config::resolve_binary("ffmpeg", cli.daemon.ffmpeg_binary.as_deref())?;
	let daemon_id = uuid::Uuid::new_v4().to_string();
	let cpu_info = daemon::read_cpu_info();

	tracing::info!(%daemon_id, ffmpeg_binary = %ffmpeg_binary.display(), gpus = inventory.gpus.len(), "starting tvarrd");

	let daemon = Daemon::new(daemon_id, cli.daemon, ffmpeg_binary, inventory, cpu_info);
	daemon.run().await
}
