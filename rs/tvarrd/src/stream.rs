//! Stream handler: multiplexes one long-lived bidirectional RPC
//! stream with the coordinator into at most one active transcode job.
//!
//! One `#[tracing::instrument]`ed event loop owns the gRPC stream's whole
//! lifetime; inbound message match arms dispatch to per-job control.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tonic::Streaming;
use tvarr_codec::{AudioCodec, Ticks, VideoCodec};
use tvarr_mux::{Sample, Track};

use crate::command::OutputFormat;
use crate::daemon::HeartbeatCommandMsg;
use crate::gpu::GpuTracker;
use crate::job::{self, JobEvent, TranscodeJob};
use crate::rpc::proto;
use crate::rpc::proto::transcode_message::Payload;
use crate::rpc::proto::{Ack, Error as ErrorMessage, HeartbeatCommand, ProbeResponse, Sample as ProtoSample, SampleBatch as ProtoSampleBatch, Start, Stats, Stop, TranscodeMessage};
use crate::selector::Accelerator;

const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of probing a third-party source URL. Fields mirror
/// `proto::ProbeResponse`'s success path.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
	pub video_codec: String,
	pub audio_codec: String,
	pub width: u32,
	pub height: u32,
	pub bitrate_kbps: u32,
}

pub type ProbeResult = Result<ProbeInfo, String>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Probing third-party stream URLs is an external collaborator:
/// the core only implements the request/response shape and timeout
/// handling, wired here to whatever concrete prober the binary constructs.
pub trait Prober: Send + Sync {
	fn probe(&self, url: String, timeout: Duration) -> BoxFuture<ProbeResult>;
}

/// Stub used until a real prober (invoking an external probe binary) is
/// wired in; always reports failure so `ProbeResponse.success` is `false`
/// rather than the request silently hanging.
pub struct UnimplementedProber;

impl Prober for UnimplementedProber {
	fn probe(&self, _url: String, _timeout: Duration) -> BoxFuture<ProbeResult> {
		Box::pin(async { Err("probing is not implemented on this daemon".to_string()) })
	}
}

struct ActiveJob {
	job: Arc<TranscodeJob>,
	job_id: String,
	output_rx: mpsc::Receiver<JobEvent>,
}

/// Everything the handler needs to start a job, gathered once at daemon
/// startup and shared read-only across the lifetime of the stream.
pub struct StreamHandler {
	daemon_id: String,
	gpu_tracker: Arc<GpuTracker>,
	ffmpeg_binary: PathBuf,
	global_flags: Vec<String>,
	accelerators: Vec<Accelerator>,
	available_audio_encoders: Vec<String>,
	cpu_info: String,
	prober: Arc<dyn Prober>,
}

impl StreamHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		daemon_id: String,
		gpu_tracker: Arc<GpuTracker>,
		ffmpeg_binary: PathBuf,
		global_flags: Vec<String>,
		accelerators: Vec<Accelerator>,
		available_audio_encoders: Vec<String>,
		cpu_info: String,
		prober: Arc<dyn Prober>,
	) -> Self {
		Self {
			daemon_id,
			gpu_tracker,
			ffmpeg_binary,
			global_flags,
			accelerators,
			available_audio_encoders,
			cpu_info,
			prober,
		}
	}

	/// Drives one `Transcode` stream to completion. Returns once the
	/// coordinator closes the inbound half, a transport error occurs, or
	/// `stop_requested` fires (e.g. the heartbeat side hit its failure
	/// threshold); the caller (the daemon's reconnect loop) decides whether
	/// to redial. Any active job is always stopped before returning, so a
	/// forced teardown still releases its GPU session and child process.
	#[tracing::instrument("stream", skip_all, fields(daemon = %self.daemon_id))]
	pub async fn run(
		&self,
		mut inbound: Streaming<TranscodeMessage>,
		outbound: mpsc::Sender<TranscodeMessage>,
		stop_requested: &tokio::sync::Notify,
		mut commands: mpsc::UnboundedReceiver<HeartbeatCommandMsg>,
	) -> anyhow::Result<()> {
		// The "ready" sentinel: an empty job id in the session field
		// lets the coordinator identify which daemon just opened the stream.
		send(&outbound, Payload::Start(Start { session: self.daemon_id.clone(), config: None })).await;

		let mut active: Option<ActiveJob> = None;
		let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
		stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let mut forced_stop = false;
		// Once the heartbeat task ends, `commands.recv()` would resolve to
		// `None` immediately forever; stop polling the branch rather than
		// busy-looping on it.
		let mut commands_open = true;

		loop {
			let output_event = async {
				match active.as_mut() {
					Some(active_job) => active_job.output_rx.recv().await,
					None => std::future::pending().await,
				}
			};

			tokio::select! {
				_ = stop_requested.notified() => {
					tracing::warn!("stream teardown requested externally");
					forced_stop = true;
					break;
				}
				message = inbound.message() => {
					match message {
						Ok(Some(message)) => {
							self.handle_inbound(message, &mut active, &outbound).await;
						}
						Ok(None) => {
							tracing::info!("coordinator closed the transcode stream");
							break;
						}
						Err(status) => {
							tracing::warn!(%status, "transcode stream error");
							break;
						}
					}
				}
				_ = stats_interval.tick(), if active.is_some() => {
					if let Some(active_job) = active.as_ref() {
						send_stats(active_job, &outbound).await;
					}
				}
				command = commands.recv(), if commands_open => {
					match command {
						Some(command) => self.handle_heartbeat_command(command, &mut active, &outbound).await,
						None => commands_open = false,
					}
				}
				event = output_event => {
					match event {
						Some(JobEvent::Samples(batch)) => {
							if let Some(active_job) = active.as_ref() {
								let proto_batch = convert_outbound_batch(&active_job.job_id, batch);
								send(&outbound, Payload::Samples(proto_batch)).await;
							}
						}
						None => {
							if let Some(finished) = active.take() {
								finished.job.stop("output channel closed").await;
								send(&outbound, Payload::Stop(Stop { job_id: finished.job_id })).await;
							}
						}
					}
				}
			}
		}

		if let Some(active_job) = active.take() {
			active_job.job.stop("stream closed").await;
		}
		if forced_stop {
			anyhow::bail!("stream torn down by external stop request");
		}
		Ok(())
	}

	async fn handle_inbound(&self, message: TranscodeMessage, active: &mut Option<ActiveJob>, outbound: &mpsc::Sender<TranscodeMessage>) {
		let Some(payload) = message.payload else { return };

		match payload {
			Payload::Start(start) => self.handle_start(start, active, outbound).await,
			Payload::Samples(batch) => {
				if let Some(active_job) = active.as_ref() {
					if active_job.job_id == batch.job_id {
						active_job.job.process_samples(&convert_inbound_batch(batch));
					}
				}
			}
			Payload::InputComplete(input_complete) => {
				if let Some(active_job) = active.as_ref() {
					if active_job.job_id == input_complete.job_id {
						active_job.job.signal_input_complete();
					}
				}
			}
			Payload::Stop(stop) => {
				let matches = active.as_ref().is_some_and(|active_job| active_job.job_id == stop.job_id);
				if matches {
					if let Some(active_job) = active.take() {
						active_job.job.stop("stop requested").await;
						send(outbound, Payload::Stop(Stop { job_id: active_job.job_id })).await;
					}
				}
			}
			Payload::ProbeRequest(request) => self.handle_probe(request, outbound.clone()),
			other => {
				tracing::debug!(?other, "ignoring unexpected inbound payload kind");
			}
		}
	}

	/// Acts on a command carried back by a `HeartbeatResponse`. DRAIN signals
	/// the active job to finish gracefully (same effect as an inbound
	/// `InputComplete`); CANCEL_JOB aborts the active job if its id matches.
	/// RESUME and UPDATE_CONFIG have no job to act on from this daemon's side
	/// and are only logged -- hot config reload is out of scope (§4.9).
	async fn handle_heartbeat_command(&self, command: HeartbeatCommandMsg, active: &mut Option<ActiveJob>, outbound: &mpsc::Sender<TranscodeMessage>) {
		match command.command {
			HeartbeatCommand::Drain => {
				if let Some(active_job) = active.as_ref() {
					tracing::info!(job_id = %active_job.job_id, "draining job on coordinator command");
					active_job.job.signal_input_complete();
				}
			}
			HeartbeatCommand::CancelJob => {
				let matches = active.as_ref().is_some_and(|active_job| active_job.job_id == command.job_id);
				if matches {
					if let Some(active_job) = active.take() {
						tracing::info!(job_id = %active_job.job_id, "cancelling job on coordinator command");
						active_job.job.stop("cancelled by coordinator").await;
						send(outbound, Payload::Stop(Stop { job_id: active_job.job_id })).await;
					}
				}
			}
			HeartbeatCommand::Resume | HeartbeatCommand::Unspecified | HeartbeatCommand::UpdateConfig => {
				tracing::debug!(command = ?command.command, "heartbeat command has no daemon-side action");
			}
		}
	}

	async fn handle_start(&self, start: Start, active: &mut Option<ActiveJob>, outbound: &mpsc::Sender<TranscodeMessage>) {
		if let Some(previous) = active.take() {
			previous.job.stop("superseded by new start").await;
		}

		let Some(proto_config) = start.config else {
			send(outbound, Payload::Error(ErrorMessage { job_id: String::new(), kind: "config_invalid".into(), message: "Start carried no config".into() })).await;
			return;
		};
		let job_id = proto_config.job_id.clone();

		let config = match build_job_config(proto_config) {
			Ok(config) => config,
			Err(message) => {
				send(outbound, Payload::Error(ErrorMessage { job_id, kind: "config_invalid".into(), message })).await;
				return;
			}
		};

		let job = TranscodeJob::new(job_id.clone(), self.gpu_tracker.clone());
		let result = job
			.start(config, &self.ffmpeg_binary, &self.global_flags, &self.accelerators, &self.available_audio_encoders, &self.cpu_info)
			.await;

		match result {
			Ok(ack) => {
				let output_rx = job.take_output_channel().expect("freshly started job retains its output channel");
				send(
					outbound,
					Payload::Ack(Ack {
						job_id: job_id.clone(),
						success: true,
						message: String::new(),
						video_encoder: ack.video_encoder,
						audio_encoder: ack.audio_encoder,
						hwaccel: ack.hwaccel,
					}),
				)
				.await;
				*active = Some(ActiveJob { job, job_id, output_rx });
			}
			Err(err) => {
				send(
					outbound,
					Payload::Ack(Ack {
						job_id,
						success: false,
						message: err.to_string(),
						..Default::default()
					}),
				)
				.await;
			}
		}
	}

	fn handle_probe(&self, request: proto::ProbeRequest, outbound: mpsc::Sender<TranscodeMessage>) {
		let prober = self.prober.clone();
		tokio::spawn(async move {
			let job_id = request.job_id;
			let timeout = Duration::from_millis(request.timeout_ms as u64);
			let response = match tokio::time::timeout(timeout, prober.probe(request.url, timeout)).await {
				Ok(Ok(info)) => ProbeResponse {
					job_id,
					success: true,
					video_codec: info.video_codec,
					audio_codec: info.audio_codec,
					width: info.width,
					height: info.height,
					bitrate_kbps: info.bitrate_kbps,
					error: String::new(),
				},
				Ok(Err(message)) => ProbeResponse {
					job_id,
					success: false,
					error: message,
					..Default::default()
				},
				Err(_) => ProbeResponse {
					job_id,
					success: false,
					error: "probe timed out".into(),
					..Default::default()
				},
			};
			send(&outbound, Payload::ProbeResponse(response)).await;
		});
	}
}

async fn send_stats(active_job: &ActiveJob, outbound: &mpsc::Sender<TranscodeMessage>) {
	let stats = active_job.job.stats();
	let message = Stats {
		job_id: active_job.job_id.clone(),
		samples_in: stats.samples_in,
		samples_out: stats.samples_out,
		bytes_in: stats.bytes_in,
		bytes_out: stats.bytes_out,
		speed: stats.speed,
		child_pid: stats.child_pid.unwrap_or(0),
		cpu_percent: stats.cpu_percent.unwrap_or(0.0),
		rss_megabytes: stats.rss_megabytes.unwrap_or(0),
		hwaccel: stats.hwaccel,
		device: stats.device,
	};
	send(outbound, Payload::Stats(message)).await;
}

async fn send(outbound: &mpsc::Sender<TranscodeMessage>, payload: Payload) {
	if outbound.send(TranscodeMessage { payload: Some(payload) }).await.is_err() {
		tracing::debug!("outbound channel closed, dropping message");
	}
}

/// Parses a wire `TranscodeConfig` into the job module's closed-codec form.
/// An unparseable source codec is a config error ,
/// reported back to the coordinator rather than guessed at.
fn build_job_config(proto_config: proto::TranscodeConfig) -> Result<job::TranscodeConfig, String> {
	let source_video = proto_config.source_video_codec.parse::<VideoCodec>().map_err(|err| format!("source video codec: {err}"))?;
	let source_audio = proto_config.source_audio_codec.parse::<AudioCodec>().map_err(|err| format!("source audio codec: {err}"))?;

	let output_container = match proto_config.output_container.trim().to_ascii_lowercase().as_str() {
		"mp4" | "fmp4" => Some(OutputFormat::Mp4),
		"mpegts" | "ts" => Some(OutputFormat::MpegTs),
		_ => None,
	};

	Ok(job::TranscodeConfig {
		job_id: proto_config.job_id,
		channel_id: proto_config.channel_id,
		source_video,
		source_audio,
		target_video: proto_config.target_video_codec,
		target_audio: proto_config.target_audio_codec,
		video_bitrate_kbps: (proto_config.video_bitrate_kbps > 0).then_some(proto_config.video_bitrate_kbps),
		audio_bitrate_kbps: (proto_config.audio_bitrate_kbps > 0).then_some(proto_config.audio_bitrate_kbps),
		preset: (!proto_config.preset.is_empty()).then_some(proto_config.preset),
		preferred_hwaccel: proto_config.preferred_hwaccel,
		audio_init_bytes: Bytes::from(proto_config.audio_init_bytes),
		extra_pre_input_flags: proto_config.extra_pre_input_flags,
		extra_input_flags: proto_config.extra_input_flags,
		extra_output_flags: proto_config.extra_output_flags,
		overrides: proto_config.overrides,
		output_container,
	})
}

fn convert_inbound_batch(batch: ProtoSampleBatch) -> tvarr_mux::SampleBatch {
	let mut samples = Vec::with_capacity(batch.video.len() + batch.audio.len());
	samples.extend(
		batch
			.video
			.into_iter()
			.map(|s| Sample::video(Ticks::new(s.pts), Ticks::new(s.dts), s.keyframe, Bytes::from(s.payload)).with_sequence(s.sequence)),
	);
	samples.extend(batch.audio.into_iter().map(|s| Sample::audio(Ticks::new(s.pts), Bytes::from(s.payload)).with_sequence(s.sequence)));
	tvarr_mux::SampleBatch {
		sequence: batch.batch_sequence,
		samples,
	}
}

fn convert_outbound_batch(job_id: &str, batch: tvarr_mux::SampleBatch) -> ProtoSampleBatch {
	let mut video = Vec::new();
	let mut audio = Vec::new();
	for sample in batch.samples {
		let proto_sample = ProtoSample {
			pts: sample.pts.as_ticks(),
			dts: sample.dts.as_ticks(),
			payload: sample.data.to_vec(),
			keyframe: sample.keyframe,
			sequence: sample.sequence,
		};
		match sample.track {
			Track::Video => video.push(proto_sample),
			Track::Audio => audio.push(proto_sample),
		}
	}
	ProtoSampleBatch {
		job_id: job_id.to_string(),
		batch_sequence: batch.sequence,
		video,
		audio,
		transcoded: true,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_proto_config() -> proto::TranscodeConfig {
		proto::TranscodeConfig {
			job_id: "job-1".into(),
			channel_id: "chan-1".into(),
			source_video_codec: "h264".into(),
			source_audio_codec: "aac".into(),
			target_video_codec: "h264".into(),
			target_audio_codec: "aac".into(),
			video_bitrate_kbps: 0,
			audio_bitrate_kbps: 0,
			preset: String::new(),
			preferred_hwaccel: "auto".into(),
			audio_init_bytes: Vec::new(),
			extra_input_flags: String::new(),
			extra_output_flags: String::new(),
			overrides: Vec::new(),
			output_container: String::new(),
			extra_pre_input_flags: String::new(),
		}
	}

	#[test]
	fn build_job_config_parses_codecs_and_zero_bitrates_as_none() {
		let config = build_job_config(base_proto_config()).unwrap();
		assert_eq!(config.source_video, VideoCodec::H264);
		assert_eq!(config.source_audio, AudioCodec::Aac);
		assert_eq!(config.video_bitrate_kbps, None);
		assert_eq!(config.output_container, None);
	}

	#[test]
	fn build_job_config_rejects_unknown_source_codec() {
		let mut proto_config = base_proto_config();
		proto_config.source_video_codec = "not-a-codec".into();
		assert!(build_job_config(proto_config).is_err());
	}

	#[test]
	fn build_job_config_honors_explicit_output_container() {
		let mut proto_config = base_proto_config();
		proto_config.output_container = "mp4".into();
		let config = build_job_config(proto_config).unwrap();
		assert_eq!(config.output_container, Some(OutputFormat::Mp4));
	}

	#[test]
	fn convert_inbound_batch_splits_tracks_and_forces_audio_dts() {
		let batch = ProtoSampleBatch {
			job_id: "job-1".into(),
			batch_sequence: 7,
			video: vec![ProtoSample { pts: 100, dts: 90, payload: vec![1, 2, 3], keyframe: true, sequence: 0 }],
			audio: vec![ProtoSample { pts: 100, dts: 50, payload: vec![4, 5], keyframe: false, sequence: 0 }],
			transcoded: false,
		};
		let converted = convert_inbound_batch(batch);
		assert_eq!(converted.sequence, 7);
		assert_eq!(converted.samples.len(), 2);
		let audio = converted.samples.iter().find(|s| s.track == Track::Audio).unwrap();
		assert_eq!(audio.pts, audio.dts);
	}

	#[test]
	fn convert_outbound_batch_marks_transcoded_and_splits_tracks() {
		let mut batch = tvarr_mux::SampleBatch::new(3);
		batch.push(Sample::video(Ticks::new(10), Ticks::new(10), true, Bytes::from_static(b"v")).with_sequence(5));
		batch.push(Sample::audio(Ticks::new(10), Bytes::from_static(b"a")).with_sequence(9));
		let proto_batch = convert_outbound_batch("job-9", batch);
		assert!(proto_batch.transcoded);
		assert_eq!(proto_batch.video.len(), 1);
		assert_eq!(proto_batch.audio.len(), 1);
		assert_eq!(proto_batch.job_id, "job-9");
		assert_eq!(proto_batch.video[0].sequence, 5);
		assert_eq!(proto_batch.audio[0].sequence, 9);
	}

	#[tokio::test]
	async fn unimplemented_prober_reports_failure() {
		let prober = UnimplementedProber;
		let result = prober.probe("rtmp://example/live".into(), Duration::from_secs(1)).await;
		assert!(result.is_err());
	}
}
