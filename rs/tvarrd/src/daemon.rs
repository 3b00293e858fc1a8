//! Top-level daemon loop: register with the coordinator, hold a heartbeat
//! cadence, and drive the bidirectional `Transcode` stream until it
//! breaks, reconnecting with backoff.
//!
//! One struct owns the whole lifetime of the coordinator relationship
//! across however many reconnects it takes, not just a single stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{DaemonConfig, HardwareInventory};
use crate::gpu::GpuTracker;
use crate::rpc::proto::{Capabilities, GpuDescriptor as ProtoGpuDescriptor, HeartbeatCommand, HeartbeatRequest, HeartbeatResponse, JobStatus, RegisterRequest};
use crate::rpc::{self, ReconnectBackoff};
use crate::selector::Accelerator;
use crate::stream::{Prober, StreamHandler, UnimplementedProber};

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const HEARTBEAT_FAILURE_THRESHOLD: u32 = 3;

/// Everything needed to run the daemon for its entire process lifetime,
/// assembled once in `main` from `DaemonConfig` + `HardwareInventory`.
pub struct Daemon {
	pub daemon_id: String,
	pub config: DaemonConfig,
	pub ffmpeg_binary: PathBuf,
	pub gpu_tracker: Arc<GpuTracker>,
	pub inventory: HardwareInventory,
	pub accelerators: Vec<Accelerator>,
	pub cpu_info: String,
	pub prober: Arc<dyn Prober>,
}

impl Daemon {
	pub fn new(daemon_id: String, config: DaemonConfig, ffmpeg_binary: PathBuf, inventory: HardwareInventory, cpu_info: String) -> Self {
		let gpu_tracker = GpuTracker::new(&inventory.gpus);
		let accelerators = inventory.accelerators.iter().cloned().map(Accelerator::from).collect();
		Self {
			daemon_id,
			config,
			ffmpeg_binary,
			gpu_tracker,
			inventory,
			accelerators,
			cpu_info,
			prober: Arc::new(UnimplementedProber),
		}
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			video_encoders: software_video_encoders(),
			audio_encoders: self.inventory.audio_encoders.clone(),
			gpus: self
				.inventory
				.gpus
				.iter()
				.map(|gpu| ProtoGpuDescriptor {
					index: gpu.index,
					name: gpu.name.clone(),
					max_encode_sessions: gpu.max_encode_sessions as i32,
					device_class: format!("{:?}", gpu.class).to_ascii_lowercase(),
				})
				.collect(),
		}
	}

	/// Runs forever: connect, register, heartbeat + transcode stream until
	/// either breaks, then reconnect with exponential backoff. Never
	/// returns except on an unrecoverable configuration error -- a lost
	/// coordinator is a reconnect, not a process exit .
	pub async fn run(self) -> anyhow::Result<()> {
		let mut backoff = ReconnectBackoff::default();

		loop {
			match self.connect_and_serve().await {
				Ok(()) => {
					tracing::info!("transcode stream ended cleanly, reconnecting");
					backoff.reset();
				}
				Err(err) => {
					tracing::warn!(%err, "coordinator session failed");
				}
			}

			match backoff.next_delay() {
				Some(delay) => {
					tracing::info!(delay_secs = delay.as_secs(), "reconnecting to coordinator");
					tokio::time::sleep(delay).await;
				}
				None => {
					tracing::error!("exhausted reconnect attempts for this cycle, resetting backoff");
					backoff.reset();
					tokio::time::sleep(Duration::from_secs(5)).await;
				}
			}
		}
	}

	async fn connect_and_serve(&self) -> anyhow::Result<()> {
		let mut client = rpc::connect(&self.config.coordinator_addr).await?;

		let register = client
			.register(RegisterRequest {
				daemon_id: self.daemon_id.clone(),
				display_name: self.config.daemon_name.clone(),
				version: env!("CARGO_PKG_VERSION").to_string(),
				auth_token: self.config.auth_token.clone().unwrap_or_default(),
				capabilities: Some(self.capabilities()),
			})
			.await?
			.into_inner();

		if !register.accepted {
			anyhow::bail!("coordinator rejected registration: {}", register.message);
		}
		let heartbeat_interval = if register.heartbeat_interval_secs > 0 {
			Duration::from_secs(register.heartbeat_interval_secs as u64)
		} else {
			self.config.heartbeat_interval
		};
		tracing::info!(heartbeat_interval = ?heartbeat_interval, "registered with coordinator");

		let handler = StreamHandler::new(
			self.daemon_id.clone(),
			self.gpu_tracker.clone(),
			self.ffmpeg_binary.clone(),
			Vec::new(),
			self.accelerators.clone(),
			self.inventory.audio_encoders.clone(),
			self.cpu_info.clone(),
			self.prober.clone(),
		);

		let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
		let outbound_stream = ReceiverStream::new(outbound_rx);
		let inbound = client.transcode(outbound_stream).await?.into_inner();

		let heartbeat_daemon_id = self.daemon_id.clone();
		let mut heartbeat_client = client.clone();
		let heartbeat_failed = Arc::new(Notify::new());
		let (command_tx, command_rx) = mpsc::unbounded_channel();
		let heartbeat_task = tokio::spawn({
			let heartbeat_failed = heartbeat_failed.clone();
			async move {
				heartbeat_loop(&mut heartbeat_client, heartbeat_daemon_id, heartbeat_interval, heartbeat_failed, command_tx).await;
			}
		});

		// A broken heartbeat ends the session even if the transcode stream
		// itself is still technically readable -- the coordinator considers
		// us gone after `HEARTBEAT_FAILURE_THRESHOLD` misses, so holding the
		// stream open past that point would just mean reconnecting later
		// than the coordinator already expects. `run` itself watches
		// `heartbeat_failed` and stops any active job before returning.
		let result = handler.run(inbound, outbound_tx, &heartbeat_failed, command_rx).await;
		heartbeat_task.abort();
		result
	}
}

/// One command carried back on a `HeartbeatResponse`, forwarded to the
/// stream handler so it can act on the job the coordinator named.
pub struct HeartbeatCommandMsg {
	pub command: HeartbeatCommand,
	pub job_id: String,
}

/// Heartbeats on a fixed cadence; three consecutive failures notify the
/// caller so `connect_and_serve` tears down the stream and `run` reconnects.
/// Any non-empty command in a successful response is forwarded to `commands`
/// for the stream handler to act on -- DRAIN/CANCEL_JOB affect an active job,
/// RESUME/UPDATE_CONFIG have no further effect on this daemon beyond being
/// observed and logged (see SPEC_FULL.md §4.9: config hot-reload is ambient
/// plumbing the core doesn't implement).
async fn heartbeat_loop(
	client: &mut rpc::GeneratedFleetClient<tonic::transport::Channel>,
	daemon_id: String,
	interval: Duration,
	failed: Arc<Notify>,
	commands: mpsc::UnboundedSender<HeartbeatCommandMsg>,
) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	let mut consecutive_failures = 0u32;

	loop {
		ticker.tick().await;

		let request = HeartbeatRequest {
			daemon_id: daemon_id.clone(),
			jobs: Vec::<JobStatus>::new(),
		};

		match client.heartbeat(request).await {
			Ok(response) => {
				consecutive_failures = 0;
				let response: HeartbeatResponse = response.into_inner();
				let command = response.command();
				if !matches!(command, HeartbeatCommand::Unspecified) {
					tracing::info!(?command, job_id = %response.command_job_id, "received heartbeat command");
					let _ = commands.send(HeartbeatCommandMsg { command, job_id: response.command_job_id });
				}
			}
			Err(err) => {
				consecutive_failures += 1;
				tracing::warn!(%err, consecutive_failures, "heartbeat failed");
				if consecutive_failures >= HEARTBEAT_FAILURE_THRESHOLD {
					tracing::warn!("heartbeat failure threshold reached, ending session");
					failed.notify_one();
					return;
				}
			}
		}
	}
}

/// The fixed list of software encoders this daemon always advertises,
/// matching `selector::select_video`'s/`select_audio`'s software fallback
/// table -- hardware encoders are advertised per-accelerator via
/// `Capabilities.gpus`, not this list.
fn software_video_encoders() -> Vec<String> {
	["libx264", "libx265", "libvpx-vp9", "libaom-av1"].into_iter().map(String::from).collect()
}

/// Reads the first `model name` field out of `/proc/cpuinfo`, used by
/// `selector::apply_overrides`'s CPU-description regex matching. Anything
/// short of Linux with a populated `/proc/cpuinfo` yields an empty string,
/// which simply never matches an operator's `cpu_regex` override.
#[cfg(target_os = "linux")]
pub fn read_cpu_info() -> String {
	std::fs::read_to_string("/proc/cpuinfo")
		.ok()
		.and_then(|contents| {
			contents.lines().find_map(|line| line.strip_prefix("model name").map(|rest| rest.trim_start_matches(':').trim().to_string()))
		})
		.unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
pub fn read_cpu_info() -> String {
	String::new()
}
