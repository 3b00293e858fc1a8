//! Per-job transcoding pipeline: spawns a native transcoder child
//! process, feeds it container-muxed ES samples on stdin, and demuxes its
//! stdout back into samples for the outbound channel.
//!
//! Uses a chunked `AsyncReadExt::read_buf`-shaped stdout loop, structured
//! `#[tracing::instrument]`ed lifecycle logging, and `tokio::process` with
//! an escalating shutdown sequence (natural exit, then SIGINT, then kill).

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tvarr_codec::{AudioCodec, VideoCodec};
use tvarr_mux::demux::{Fmp4Demux, MpegTsDemux, OnAudio, OnVideo, OutputDemuxer, OutputDemuxerKind};
use tvarr_mux::mux::{InputMuxer, InputMuxerKind};
use tvarr_mux::{Sample, SampleBatch, Track};

use crate::command::{self, CommandSpec, OutputFormat};
use crate::error::JobError;
use crate::gpu::GpuTracker;
use crate::rpc::proto::EncoderOverride;
use crate::selector::{self, Accelerator};

/// Sized so a coordinator bursting samples faster than the child can
/// consume them drops excess batches rather than ever blocking the RPC
/// receive path.
const STDIN_CHANNEL_CAPACITY: usize = 1000;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const STDOUT_CHUNK_SIZE: usize = 18 * 1024;
const STDERR_RING_CAPACITY: usize = 50;
const OUTBOUND_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_NATURAL_GRACE: Duration = Duration::from_secs(3);
const STOP_INTERRUPT_GRACE: Duration = Duration::from_millis(500);
const STOP_KILL_GRACE: Duration = Duration::from_millis(500);
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Linux's default `_SC_CLK_TCK`, used to turn `/proc/<pid>/stat`'s utime+
/// stime (in clock ticks) into seconds of CPU time between two samples.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
	Created,
	Starting,
	Running,
	Draining,
	Stopping,
	Closed,
}

/// Immutable-after-start job configuration, already parsed into the
/// closed codec sum types — the stream handler is responsible for turning
/// a wire `TranscodeConfig` into this.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
	pub job_id: String,
	pub channel_id: String,
	pub source_video: VideoCodec,
	pub source_audio: AudioCodec,
	/// Raw target codec strings: "copy"/empty mean passthrough, anything
	/// else is parsed by the selector and by `resolve_target_video_codec`.
	pub target_video: String,
	pub target_audio: String,
	pub video_bitrate_kbps: Option<u32>,
	pub audio_bitrate_kbps: Option<u32>,
	pub preset: Option<String>,
	pub preferred_hwaccel: String,
	pub audio_init_bytes: Bytes,
	pub extra_pre_input_flags: String,
	pub extra_input_flags: String,
	pub extra_output_flags: String,
	pub overrides: Vec<EncoderOverride>,
	pub output_container: Option<OutputFormat>,
}

/// Result of a successful `start()`, mirroring `proto::Ack`'s fields
/// without depending on the generated type here.
#[derive(Debug, Clone, Default)]
pub struct StartAck {
	pub video_encoder: String,
	pub audio_encoder: String,
	pub hwaccel: String,
}

/// One event on the job's outbound channel. The channel closes (no more
/// events, `recv()` returns `None`) when the child process ends and the
/// stdout reader task finishes draining the demuxer.
pub enum JobEvent {
	Samples(SampleBatch),
}

#[derive(Debug, Clone, Default)]
pub struct JobStats {
	pub samples_in: u64,
	pub samples_out: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub speed: f64,
	pub child_pid: Option<u32>,
	pub cpu_percent: Option<f64>,
	pub rss_megabytes: Option<u64>,
	pub hwaccel: String,
	pub device: String,
	pub command: String,
}

/// The per-job state machine. Owns its muxer, demuxer,
/// child-process handle, and channels exclusively; the stream handler owns
/// at most one of these at a time.
pub struct TranscodeJob {
	job_id: String,
	gpu_tracker: Arc<GpuTracker>,
	cancel: CancellationToken,

	state: Mutex<JobState>,
	started: AtomicBool,
	stop_guard: AtomicBool,

	stdin_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
	input_muxer: Mutex<Option<InputMuxerKind>>,
	outbound_rx: Mutex<Option<mpsc::Receiver<JobEvent>>>,
	child: Mutex<Option<Child>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	acquired_gpu: Mutex<Option<usize>>,

	samples_in: AtomicU64,
	bytes_in: AtomicU64,
	samples_out: Arc<AtomicU64>,
	bytes_out: Arc<AtomicU64>,
	stdin_drops: AtomicU64,
	mux_errors: AtomicU64,
	demux_errors: Arc<AtomicU64>,
	speed_bits: Arc<AtomicU64>,

	stderr_ring: Arc<Mutex<std::collections::VecDeque<String>>>,
	hwaccel: Mutex<String>,
	device: Mutex<String>,
	command_str: Mutex<String>,
	cpu_sample: Mutex<Option<(Instant, u64)>>,
}

impl TranscodeJob {
	pub fn new(job_id: String, gpu_tracker: Arc<GpuTracker>) -> Arc<Self> {
		Arc::new(Self {
			job_id,
			gpu_tracker,
			cancel: CancellationToken::new(),
			state: Mutex::new(JobState::Created),
			started: AtomicBool::new(false),
			stop_guard: AtomicBool::new(false),
			stdin_tx: Mutex::new(None),
			input_muxer: Mutex::new(None),
			outbound_rx: Mutex::new(None),
			child: Mutex::new(None),
			tasks: Mutex::new(Vec::new()),
			acquired_gpu: Mutex::new(None),
			samples_in: AtomicU64::new(0),
			bytes_in: AtomicU64::new(0),
			samples_out: Arc::new(AtomicU64::new(0)),
			bytes_out: Arc::new(AtomicU64::new(0)),
			stdin_drops: AtomicU64::new(0),
			mux_errors: AtomicU64::new(0),
			demux_errors: Arc::new(AtomicU64::new(0)),
			speed_bits: Arc::new(AtomicU64::new(0)),
			stderr_ring: Arc::new(Mutex::new(std::collections::VecDeque::with_capacity(STDERR_RING_CAPACITY))),
			hwaccel: Mutex::new(String::new()),
			device: Mutex::new(String::new()),
			command_str: Mutex::new(String::new()),
			cpu_sample: Mutex::new(None),
		})
	}

	pub fn job_id(&self) -> &str {
		&self.job_id
	}

	pub fn state(&self) -> JobState {
		*self.state.lock()
	}

	/// Spawns the child transcoder and its cooperating tasks. CAS-guarded: a
/// second call on the same job returns
	/// `WrongState` rather than re-spawning a child.
	#[tracing::instrument("job.start", skip_all, fields(job = %self.job_id))]
	pub async fn start(
		&self,
		config: TranscodeConfig,
		ffmpeg_binary: &Path,
		global_flags: &[String],
		accelerators: &[Accelerator],
		available_audio_encoders: &[String],
		cpu_info: &str,
	) -> Result<StartAck, JobError> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Err(JobError::WrongState("started"));
		}
		*self.state.lock() = JobState::Starting;

		let mut input_muxer = InputMuxerKind::for_codecs(config.source_video, config.source_audio);
		input_muxer.set_audio_init(&config.audio_init_bytes);

		let target_video_codec = resolve_target_video_codec(config.source_video, &config.target_video);
		let target_audio_codec = config.target_audio.parse::<AudioCodec>().unwrap_or(AudioCodec::Aac);
		let output_format = config
			.output_container
			.unwrap_or(if target_video_codec.requires_fmp4() { OutputFormat::Mp4 } else { OutputFormat::MpegTs });

		let (mut video_encoder, hwaccel, device) = selector::select_video(&config.target_video, &config.preferred_hwaccel, accelerators);
		video_encoder = selector::apply_overrides("video", config.source_video.as_str(), &video_encoder, &hwaccel, cpu_info, &config.overrides);

		let mut audio_encoder = selector::select_audio(&config.target_audio, available_audio_encoders);
		audio_encoder = selector::apply_overrides("audio", config.source_audio.as_str(), &audio_encoder, &hwaccel, cpu_info, &config.overrides);

		// GPU admission: paired one-shot acquire/release per job,
		// mirrored by the release in `stop()` regardless of how the job ends.
		if !hwaccel.is_empty() {
			match self.gpu_tracker.best_encode_gpu() {
				Some(index) if self.gpu_tracker.acquire_encode(index) => {
					*self.acquired_gpu.lock() = Some(index);
				}
				_ => {
					*self.state.lock() = JobState::Closed;
					return Err(JobError::AdmissionDenied { gpu_index: 0 });
				}
			}
		}

		let needs_delayed_moov =
			audio_encoder == "copy" || matches!(target_audio_codec, AudioCodec::Ac3 | AudioCodec::Eac3 | AudioCodec::Opus);
		let aac_bitstream_filter = audio_encoder == "copy" && target_audio_codec == AudioCodec::Aac && output_format == OutputFormat::Mp4;

		let spec = CommandSpec {
			global_flags: global_flags.to_vec().into_iter().chain(split_flags(&config.extra_pre_input_flags)).collect(),
			hwaccel: hwaccel.clone(),
			hwaccel_device: device.clone(),
			input_format: input_muxer.format().to_string(),
			input_flags: split_flags(&config.extra_input_flags),
			video_encoder: video_encoder.clone(),
			video_bitrate_kbps: config.video_bitrate_kbps,
			preset: config.preset.clone(),
			audio_encoder: audio_encoder.clone(),
			audio_bitrate_kbps: config.audio_bitrate_kbps,
			downmix_stereo: false,
			output_format,
			needs_delayed_moov,
			aac_bitstream_filter,
			output_flags: split_flags(&config.extra_output_flags),
		};
		let args = command::build(&spec);

		let mut command = Command::new(ffmpeg_binary);
		command.args(&args);
		command.stdin(Stdio::piped());
		command.stdout(Stdio::piped());
		command.stderr(Stdio::piped());
		command.kill_on_drop(true);

		let mut child = match command.spawn() {
			Ok(child) => child,
			Err(err) => {
				self.release_gpu();
				*self.state.lock() = JobState::Closed;
				return Err(JobError::ChildSpawnFailed(err));
			}
		};

		let stdin = child.stdin.take().expect("stdin piped at spawn");
		let stdout = child.stdout.take().expect("stdout piped at spawn");
		let stderr = child.stderr.take().expect("stderr piped at spawn");

		*self.command_str.lock() = format!("{} {}", ffmpeg_binary.display(), args.join(" "));
		*self.hwaccel.lock() = hwaccel.clone();
		*self.device.lock() = device.clone();
		*self.child.lock() = Some(child);

		let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(STDIN_CHANNEL_CAPACITY);
		let (outbound_tx, outbound_rx) = mpsc::channel::<JobEvent>(OUTBOUND_CHANNEL_CAPACITY);
		*self.stdin_tx.lock() = Some(stdin_tx);
		*self.outbound_rx.lock() = Some(outbound_rx);

		let header = input_muxer.initialize_and_get_header().map_err(|err| {
			tracing::warn!(job = %self.job_id, %err, "failed to build init header");
			JobError::ChildSpawnFailed(std::io::Error::other(err.to_string()))
		})?;
		*self.input_muxer.lock() = Some(input_muxer);
		if !header.is_empty() {
			self.enqueue_stdin(header);
		}

		let mut tasks = Vec::with_capacity(3);
		tasks.push(tokio::spawn(stdin_writer(stdin, stdin_rx, self.cancel.clone(), self.job_id.clone())));
		tasks.push(tokio::spawn(stdout_reader(
			stdout,
			outbound_tx,
			build_output_demuxer(output_format, target_video_codec, target_audio_codec),
			self.samples_out.clone(),
			self.bytes_out.clone(),
			self.demux_errors.clone(),
			self.cancel.clone(),
			self.job_id.clone(),
		)));
		tasks.push(tokio::spawn(stderr_scanner(
			stderr,
			self.stderr_ring.clone(),
			self.speed_bits.clone(),
			self.cancel.clone(),
			self.job_id.clone(),
		)));
		*self.tasks.lock() = tasks;

		*self.state.lock() = JobState::Running;
		tracing::info!(job = %self.job_id, video_encoder, audio_encoder, hwaccel, "transcode job started");

		Ok(StartAck {
			video_encoder,
			audio_encoder,
			hwaccel,
		})
	}

	/// `process_samples`: video then audio, in arrival order within
	/// each track, through the muxer, then a non-blocking stdin enqueue.
	pub fn process_samples(&self, batch: &SampleBatch) {
		let mut guard = self.input_muxer.lock();
		let Some(muxer) = guard.as_mut() else { return };

		for sample in batch.samples.iter().filter(|s| s.track == Track::Video) {
			self.record_inbound(sample);
			if let Err(err) = muxer.write_video(sample.pts, sample.dts, &sample.data, sample.keyframe) {
				self.mux_errors.fetch_add(1, Ordering::Relaxed);
				tracing::debug!(job = %self.job_id, %err, "mux error on video sample, continuing");
			}
		}
		for sample in batch.samples.iter().filter(|s| s.track == Track::Audio) {
			self.record_inbound(sample);
			if let Err(err) = muxer.write_audio(sample.pts, &sample.data) {
				self.mux_errors.fetch_add(1, Ordering::Relaxed);
				tracing::debug!(job = %self.job_id, %err, "mux error on audio sample, continuing");
			}
		}

		match muxer.flush() {
			Ok(bytes) if !bytes.is_empty() => {
				drop(guard);
				self.enqueue_stdin(bytes);
			}
			Ok(_) => {}
			Err(err) => {
				self.mux_errors.fetch_add(1, Ordering::Relaxed);
				tracing::debug!(job = %self.job_id, %err, "mux flush error");
			}
		}
	}

	fn record_inbound(&self, sample: &Sample) {
		self.samples_in.fetch_add(1, Ordering::Relaxed);
		self.bytes_in.fetch_add(sample.data.len() as u64, Ordering::Relaxed);
	}

	fn enqueue_stdin(&self, bytes: Bytes) {
		let guard = self.stdin_tx.lock();
		let Some(tx) = guard.as_ref() else { return };
		match tx.try_send(bytes) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				let drops = self.stdin_drops.fetch_add(1, Ordering::Relaxed) + 1;
				if drops == 1 || drops % 100 == 0 {
					tracing::warn!(job = %self.job_id, drops, "stdin channel full, dropping batch");
				}
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	/// `signal_input_complete`: drop the stdin sender so the writer
	/// task closes the child's stdin once it has drained what's queued.
	pub fn signal_input_complete(&self) {
		*self.state.lock() = JobState::Draining;
		self.stdin_tx.lock().take();
	}

	/// Takes ownership of the outbound channel's receive half. Callable
	/// once; later calls return `None`.
	pub fn take_output_channel(&self) -> Option<mpsc::Receiver<JobEvent>> {
		self.outbound_rx.lock().take()
	}

	fn release_gpu(&self) {
		if let Some(index) = self.acquired_gpu.lock().take() {
			self.gpu_tracker.release_encode(index);
		}
	}

	/// `stop()`: CAS-guarded idempotence, escalating process shutdown,
	/// then a bounded join on every task.
	#[tracing::instrument("job.stop", skip_all, fields(job = %self.job_id))]
	pub async fn stop(&self, reason: &str) {
		if self.stop_guard.swap(true, Ordering::SeqCst) {
			return;
		}
		*self.state.lock() = JobState::Stopping;
		self.cancel.cancel();
		self.stdin_tx.lock().take();
		self.release_gpu();

		if let Some(child) = self.child.lock().take() {
			escalate_shutdown(child, self.job_id.clone()).await;
		}

		let handles: Vec<_> = self.tasks.lock().drain(..).collect();
		for handle in handles {
			if tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await.is_err() {
				tracing::warn!(job = %self.job_id, "job task did not join within timeout");
			}
		}

		*self.state.lock() = JobState::Closed;
		tracing::info!(job = %self.job_id, reason, "transcode job stopped");
	}

	pub fn stats(&self) -> JobStats {
		let pid = self.child.lock().as_ref().and_then(|c| c.id());
		let (cpu_percent, rss_megabytes) = match pid {
			Some(pid) => (self.sample_cpu_percent(pid), read_proc_rss_mb(pid)),
			None => (None, None),
		};
		JobStats {
			samples_in: self.samples_in.load(Ordering::Relaxed),
			samples_out: self.samples_out.load(Ordering::Relaxed),
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
			speed: f64::from_bits(self.speed_bits.load(Ordering::Relaxed)),
			child_pid: pid,
			cpu_percent,
			rss_megabytes,
			hwaccel: self.hwaccel.lock().clone(),
			device: self.device.lock().clone(),
			command: self.command_str.lock().clone(),
		}
	}

	/// Stderr tail for post-mortem diagnostics; most recent line last.
	pub fn recent_stderr(&self) -> Vec<String> {
		self.stderr_ring.lock().iter().cloned().collect()
	}

	pub fn mux_error_count(&self) -> u64 {
		self.mux_errors.load(Ordering::Relaxed)
	}

	pub fn demux_error_count(&self) -> u64 {
		self.demux_errors.load(Ordering::Relaxed)
	}

	fn sample_cpu_percent(&self, pid: u32) -> Option<f64> {
		let ticks_now = read_proc_stat_ticks(pid)?;
		let now = Instant::now();
		let mut guard = self.cpu_sample.lock();
		let percent = guard.and_then(|(prev_instant, prev_ticks)| {
			let elapsed = now.duration_since(prev_instant).as_secs_f64();
			if elapsed > 0.0 && ticks_now >= prev_ticks {
				Some(((ticks_now - prev_ticks) as f64 / CLOCK_TICKS_PER_SEC) / elapsed * 100.0)
			} else {
				None
			}
		});
		*guard = Some((now, ticks_now));
		percent
	}
}

fn split_flags(raw: &str) -> Vec<String> {
	raw.split_whitespace().map(str::to_string).collect()
}

/// Output-container video codec: "copy"/empty targets keep the source
/// codec (there's no re-encode to change it); otherwise the parsed target,
/// falling back to H.264 for an unrecognized string (matching
/// `selector::select_video`'s own software fallback).
fn resolve_target_video_codec(source: VideoCodec, raw: &str) -> VideoCodec {
	let normalized = raw.trim().to_ascii_lowercase();
	if normalized.is_empty() || normalized == "copy" {
		return source;
	}
	normalized.parse().unwrap_or(VideoCodec::H264)
}

fn build_output_demuxer(
	output_format: OutputFormat,
	video_codec: VideoCodec,
	audio_codec: AudioCodec,
) -> (OutputDemuxerKind<'static>, Arc<std::sync::Mutex<Vec<Sample>>>) {
	let pending: Arc<std::sync::Mutex<Vec<Sample>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
	let video_seq = Arc::new(AtomicU64::new(0));
	let audio_seq = Arc::new(AtomicU64::new(0));

	let pending_video = pending.clone();
	let on_video: Box<OnVideo<'static>> = Box::new(move |pts, dts, data, keyframe| {
		let seq = video_seq.fetch_add(1, Ordering::Relaxed);
		pending_video.lock().unwrap().push(Sample::video(pts, dts, keyframe, Bytes::copy_from_slice(data)).with_sequence(seq));
	});
	let pending_audio = pending.clone();
	let on_audio: Box<OnAudio<'static>> = Box::new(move |pts, data| {
		let seq = audio_seq.fetch_add(1, Ordering::Relaxed);
		pending_audio.lock().unwrap().push(Sample::audio(pts, Bytes::copy_from_slice(data)).with_sequence(seq));
	});

	let demux = match output_format {
		OutputFormat::Mp4 => OutputDemuxerKind::Fmp4(Fmp4Demux::new(video_codec, audio_codec, on_video, on_audio)),
		OutputFormat::MpegTs => OutputDemuxerKind::MpegTs(MpegTsDemux::new(video_codec, audio_codec, on_video, on_audio)),
	};
	(demux, pending)
}

async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken, job_id: String) {
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			received = rx.recv() => {
				match received {
					Some(bytes) => {
						if let Err(err) = stdin.write_all(&bytes).await {
							if !cancel.is_cancelled() {
								tracing::debug!(job = %job_id, %err, "stdin write failed");
							}
							break;
						}
					}
					None => break,
				}
			}
		}
	}
	drop(stdin);
}

#[allow(clippy::too_many_arguments)]
async fn stdout_reader(
	mut stdout: tokio::process::ChildStdout,
	outbound_tx: mpsc::Sender<JobEvent>,
	demux_and_pending: (OutputDemuxerKind<'static>, Arc<std::sync::Mutex<Vec<Sample>>>),
	samples_out: Arc<AtomicU64>,
	bytes_out: Arc<AtomicU64>,
	demux_errors: Arc<AtomicU64>,
	cancel: CancellationToken,
	job_id: String,
) {
	let (mut demux, pending) = demux_and_pending;
	let mut buf = vec![0u8; STDOUT_CHUNK_SIZE];
	let mut batch_sequence: u64 = 0;
	let mut saw_activity = false;

	loop {
		let read = tokio::select! {
			_ = cancel.cancelled() => break,
			result = stdout.read(&mut buf) => result,
		};
		let n = match read {
			Ok(0) => break,
			Ok(n) => n,
			Err(_) => break,
		};
		saw_activity = true;

		if let Err(err) = demux.write(&buf[..n]) {
			demux_errors.fetch_add(1, Ordering::Relaxed);
			tracing::debug!(job = %job_id, %err, "demux error, continuing");
		}

		flush_pending(&pending, &mut batch_sequence, &outbound_tx, &samples_out, &bytes_out, &job_id).await;
	}

	if let Err(err) = demux.close() {
		demux_errors.fetch_add(1, Ordering::Relaxed);
		tracing::debug!(job = %job_id, %err, "demux close error");
	}
	flush_pending(&pending, &mut batch_sequence, &outbound_tx, &samples_out, &bytes_out, &job_id).await;

	if !saw_activity {
		// EOF before any output is a start failure, not normal completion.
		tracing::warn!(job = %job_id, "transcoder exited before producing any output");
	}
}

async fn flush_pending(
	pending: &Arc<std::sync::Mutex<Vec<Sample>>>,
	batch_sequence: &mut u64,
	outbound_tx: &mpsc::Sender<JobEvent>,
	samples_out: &Arc<AtomicU64>,
	bytes_out: &Arc<AtomicU64>,
	job_id: &str,
) {
	let samples = {
		let mut guard = pending.lock().unwrap();
		if guard.is_empty() {
			return;
		}
		std::mem::take(&mut *guard)
	};

	let count = samples.len() as u64;
	let bytes: u64 = samples.iter().map(|s| s.data.len() as u64).sum();
	samples_out.fetch_add(count, Ordering::Relaxed);
	bytes_out.fetch_add(bytes, Ordering::Relaxed);
	*batch_sequence += 1;

	let batch = SampleBatch {
		sequence: *batch_sequence,
		samples,
	};
	match tokio::time::timeout(OUTBOUND_SEND_TIMEOUT, outbound_tx.send(JobEvent::Samples(batch))).await {
		Ok(Ok(())) => {}
		Ok(Err(_)) => {} // receiver dropped -- job is shutting down
		Err(_) => {
			tracing::warn!(job = %job_id, "outbound channel backpressure exceeded 5s, dropping sample batch");
		}
	}
}

/// Line-oriented stderr scanner: CR or LF delimited, since the
/// child emits `-stats` progress with CR and diagnostics with LF.
async fn stderr_scanner(
	stderr: tokio::process::ChildStderr,
	ring: Arc<Mutex<std::collections::VecDeque<String>>>,
	speed_bits: Arc<AtomicU64>,
	cancel: CancellationToken,
	job_id: String,
) {
	let mut stderr = stderr;
	let mut carry = Vec::new();

	loop {
		let line = tokio::select! {
			_ = cancel.cancelled() => break,
			line = next_line(&mut stderr, &mut carry) => line,
		};
		let Ok(Some(line)) = line else { break };
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		if let Some(speed) = parse_speed_token(line) {
			speed_bits.store(speed.to_bits(), Ordering::Relaxed);
			continue;
		}

		let mut guard = ring.lock();
		if guard.len() == STDERR_RING_CAPACITY {
			guard.pop_front();
		}
		guard.push_back(line.to_string());
		drop(guard);
		tracing::debug!(job = %job_id, line, "transcoder stderr");
	}
}

async fn next_line(stderr: &mut (impl AsyncReadExt + Unpin), carry: &mut Vec<u8>) -> std::io::Result<Option<String>> {
	loop {
		if let Some(pos) = carry.iter().position(|&b| b == b'\n' || b == b'\r') {
			let mut line: Vec<u8> = carry.drain(..=pos).collect();
			line.pop();
			return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
		}
		let mut buf = [0u8; 4096];
		let n = stderr.read(&mut buf).await?;
		if n == 0 {
			if carry.is_empty() {
				return Ok(None);
			}
			let line = std::mem::take(carry);
			return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
		}
		carry.extend_from_slice(&buf[..n]);
	}
}

/// Scrapes an ffmpeg-style `speed=1.02x` token out of a progress line.
fn parse_speed_token(line: &str) -> Option<f64> {
	let idx = line.find("speed=")?;
	let rest = &line[idx + "speed=".len()..];
	let token = rest.split_whitespace().next()?;
	token.strip_suffix('x')?.trim().parse().ok()
}

/// Escalating shutdown: 3s for natural exit, then SIGINT + 500ms,
/// then SIGKILL + 500ms, then abandon the wait in a detached task so
/// `stop()` itself never blocks indefinitely on a wedged child.
async fn escalate_shutdown(mut child: Child, job_id: String) {
	if tokio::time::timeout(STOP_NATURAL_GRACE, child.wait()).await.is_ok() {
		return;
	}

	#[cfg(unix)]
	if let Some(pid) = child.id() {
		unsafe {
			libc::kill(pid as libc::pid_t, libc::SIGINT);
		}
	}
	if tokio::time::timeout(STOP_INTERRUPT_GRACE, child.wait()).await.is_ok() {
		return;
	}

	if child.start_kill().is_ok() && tokio::time::timeout(STOP_KILL_GRACE, child.wait()).await.is_ok() {
		return;
	}

	tracing::warn!(job = %job_id, "transcoder did not exit after kill, reaping in background");
	tokio::spawn(async move {
		let _ = child.wait().await;
	});
}

#[cfg(target_os = "linux")]
fn read_proc_stat_ticks(pid: u32) -> Option<u64> {
	let data = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
	let rparen = data.rfind(')')?;
	let fields: Vec<&str> = data[rparen + 2..].split_whitespace().collect();
	// Fields after `comm` are numbered from 3 in `proc(5)`; utime is field
	// 14 overall, i.e. index 11 in this 0-indexed post-comm slice.
	let utime: u64 = fields.get(11)?.parse().ok()?;
	let stime: u64 = fields.get(12)?.parse().ok()?;
	Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat_ticks(_pid: u32) -> Option<u64> {
	None
}

#[cfg(target_os = "linux")]
fn read_proc_rss_mb(pid: u32) -> Option<u64> {
	let data = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
	for line in data.lines() {
		if let Some(rest) = line.strip_prefix("VmRSS:") {
			let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
			return Some(kb / 1024);
		}
	}
	None
}

#[cfg(not(target_os = "linux"))]
fn read_proc_rss_mb(_pid: u32) -> Option<u64> {
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_target_video_codec_keeps_source_on_copy() {
		assert_eq!(resolve_target_video_codec(VideoCodec::H265, "copy"), VideoCodec::H265);
		assert_eq!(resolve_target_video_codec(VideoCodec::H265, ""), VideoCodec::H265);
	}

	#[test]
	fn resolve_target_video_codec_parses_explicit_target() {
		assert_eq!(resolve_target_video_codec(VideoCodec::H264, "av1"), VideoCodec::Av1);
	}

	#[test]
	fn resolve_target_video_codec_falls_back_to_h264() {
		assert_eq!(resolve_target_video_codec(VideoCodec::H264, "not-a-codec"), VideoCodec::H264);
	}

	#[test]
	fn split_flags_handles_empty_and_multi_token_strings() {
		assert!(split_flags("").is_empty());
		assert_eq!(split_flags("-re  -threads 2"), vec!["-re", "-threads", "2"]);
	}

	#[test]
	fn parse_speed_token_extracts_float() {
		assert_eq!(parse_speed_token("frame=100 fps=30 speed=1.02x"), Some(1.02));
		assert_eq!(parse_speed_token("no speed token here"), None);
	}

	#[test]
	fn new_job_starts_created_and_not_started() {
		let tracker = GpuTracker::new(&[]);
		let job = TranscodeJob::new("job-1".into(), tracker);
		assert_eq!(job.state(), JobState::Created);
		assert_eq!(job.stats().samples_in, 0);
	}

	#[test]
	fn signal_input_complete_transitions_to_draining() {
		let tracker = GpuTracker::new(&[]);
		let job = TranscodeJob::new("job-2".into(), tracker);
		job.signal_input_complete();
		assert_eq!(job.state(), JobState::Draining);
	}

	/// Mux two access units through an MPEG-TS round trip and confirm the
	/// glue in `build_output_demuxer` assigns strictly increasing
	/// per-track sequence numbers to the demuxed samples (§8 invariant).
	#[test]
	fn output_demuxer_assigns_increasing_per_track_sequence_numbers() {
		let mut mux = tvarr_mux::mux::MpegTsMux::new(VideoCodec::H264, AudioCodec::Aac);
		// Each write_video call is one access unit; embed SPS+PPS inline
		// with the first keyframe's slice so each call yields one sample.
		let au1 = [
			0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
			0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
			0x00, 0x00, 0x00, 0x01, 0x65, 0xAA, 0xBB, // IDR slice
		];
		let au2 = [0x00, 0x00, 0x00, 0x01, 0x65, 0xCC, 0xDD];

		mux.write_video(Ticks::ZERO, Ticks::ZERO, &au1, true).unwrap();
		mux.write_video(Ticks::new(3000), Ticks::new(3000), &au2, true).unwrap();
		let header = mux.initialize_and_get_header().unwrap();
		let body = mux.flush().unwrap();

		let (mut demux, pending) = build_output_demuxer(OutputFormat::MpegTs, VideoCodec::H264, AudioCodec::Aac);
		demux.write(&header).unwrap();
		demux.write(&body).unwrap();
		demux.close().unwrap();

		let samples = pending.lock().unwrap();
		let video_seqs: Vec<u64> = samples.iter().filter(|s| s.track == Track::Video).map(|s| s.sequence).collect();
		assert_eq!(video_seqs, vec![0, 1]);
	}
}
