//! Daemon configuration: CLI flags layered over `TVARR_*` environment
//! variables, one `clap::Parser` struct with one `#[arg(env = ...)]` per
//! field.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::gpu::GpuDescriptor;
use crate::selector::Accelerator;

/// Top-level CLI, flattening the ambient logging config (`tvarr-native`)
/// and the daemon's own settings, the same layering `hang-cli::Cli` uses
/// for `moq_native::Log` plus a subcommand-specific config struct.
#[derive(Parser, Clone, Debug)]
#[command(name = "tvarrd", about = "Fleet worker daemon")]
pub struct Cli {
	#[command(flatten)]
	pub log: tvarr_native::Log,

	#[command(flatten)]
	pub daemon: DaemonConfig,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonConfig {
	/// Address of the fleet coordinator, e.g. `http://coordinator:4443`.
	#[arg(long, env = "TVARR_COORDINATOR_ADDR")]
	pub coordinator_addr: String,

	/// Display name advertised at registration time.
	#[arg(long, env = "TVARR_DAEMON_NAME", default_value = "tvarrd")]
	pub daemon_name: String,

	/// Interval between heartbeats; the coordinator may negotiate a
	/// different one in `RegisterResponse`.
	#[arg(long, env = "TVARR_HEARTBEAT_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
	pub heartbeat_interval: Duration,

	/// Explicit path to the transcoder binary. See `resolve_binary` for the
	/// full discovery order when this is unset.
	#[arg(long, env = "TVARR_FFMPEG_BINARY")]
	pub ffmpeg_binary: Option<PathBuf>,

	/// Path to a small JSON side file describing the GPUs and hardware
	/// accelerators on this host. GPU *enumeration* is out of scope for
	/// this crate; this just loads the shape the session tracker and
	/// encoder selector consume.
	#[arg(long, env = "TVARR_GPU_DESCRIPTORS")]
	pub gpu_descriptors_path: Option<PathBuf>,

	/// Bearer token sent with Register/Heartbeat/Unregister, if the
	/// coordinator requires one. Token *validation* is the coordinator's
	/// problem.
	#[arg(long, env = "TVARR_AUTH_TOKEN")]
	pub auth_token: Option<String>,
}

/// The `gpu_descriptors_path` side-file contents: per-GPU session ceilings
/// plus the hardware accelerators detected on this host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareInventory {
	#[serde(default)]
	pub gpus: Vec<GpuDescriptor>,
	#[serde(default)]
	pub accelerators: Vec<AcceleratorConfig>,
	/// Audio encoders the transcoder binary reports as available (distinct
	/// from `accelerators[].video_encoders`, since audio encoding in this
	/// fleet is always software — `select_audio` just needs to know which
	/// of a codec's candidate encoder names is actually linked in).
	#[serde(default)]
	pub audio_encoders: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceleratorConfig {
	pub label: String,
	#[serde(default)]
	pub device: String,
	#[serde(default)]
	pub video_encoders: Vec<String>,
}

impl From<AcceleratorConfig> for Accelerator {
	fn from(config: AcceleratorConfig) -> Self {
		Self {
			label: config.label,
			device: config.device,
			video_encoders: config.video_encoders,
		}
	}
}

impl HardwareInventory {
	/// Loads the side file if a path was configured; an absent path yields
	/// an empty inventory (no GPUs advertised, software-only selection).
	pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
		let Some(path) = path else {
			return Ok(Self::default());
		};
		let contents = fs::read_to_string(path).map_err(|err| anyhow::anyhow!("reading {}: {err}", path.display()))?;
		serde_json::from_str(&contents).map_err(|err| anyhow::anyhow!("parsing {}: {err}", path.display()))
	}
}

/// Binary discovery per an explicit env-var path wins if it points to
/// an executable file; otherwise a `./<name>` relative to the current
/// directory; otherwise a `PATH` lookup; otherwise failure.
pub fn resolve_binary(name: &str, env_value: Option<&Path>) -> anyhow::Result<PathBuf> {
	if let Some(candidate) = env_value {
		if !candidate.as_os_str().is_empty() && is_executable_file(candidate) {
			return Ok(candidate.to_path_buf());
		}
	}

	let local = PathBuf::from(format!("./{name}"));
	if is_executable_file(&local) {
		return Ok(local);
	}

	if let Ok(path_var) = std::env::var("PATH") {
		for dir in std::env::split_paths(&path_var) {
			let candidate = dir.join(name);
			if is_executable_file(&candidate) {
				return Ok(candidate);
			}
		}
	}

	anyhow::bail!("could not locate executable {name:?} (not overridden, not in cwd, not on PATH)")
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
	use std::os::unix::fs::PermissionsExt;
	match fs::metadata(path) {
		Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
		Err(_) => false,
	}
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
	path.is_file()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_side_file_path_yields_empty_inventory() {
		let inventory = HardwareInventory::load(None).unwrap();
		assert!(inventory.gpus.is_empty());
		assert!(inventory.accelerators.is_empty());
	}

	#[test]
	fn resolve_binary_fails_closed_when_nothing_matches() {
		let result = resolve_binary("definitely-not-a-real-binary-xyz", None);
		assert!(result.is_err());
	}

	#[test]
	fn resolve_binary_rejects_non_executable_override() {
		let dir = std::env::temp_dir().join(format!("tvarrd-test-{}", std::process::id()));
		fs::create_dir_all(&dir).unwrap();
		let fake = dir.join("not-executable");
		fs::write(&fake, b"not a binary").unwrap();
		let result = resolve_binary("ffmpeg", Some(&fake));
		assert!(result.is_err());
		let _ = fs::remove_dir_all(&dir);
	}
}
