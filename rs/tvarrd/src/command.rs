//! Child transcoder command-line assembly.
//!
//! A plain builder function over data, matching `tvarr-mux`'s
//! muxer-construction style.

/// Everything the command template needs, already resolved by the
/// caller (encoder selection, container choice, bitstream-filter
/// decisions). Kept as plain data so the builder itself stays a pure
/// function and is cheap to unit test.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
	pub global_flags: Vec<String>,
	pub hwaccel: String,
	pub hwaccel_device: String,
	pub input_format: String,
	pub input_flags: Vec<String>,
	pub video_encoder: String,
	pub video_bitrate_kbps: Option<u32>,
	/// Only applied for software encoders ("preset only for software
	/// encoders").
	pub preset: Option<String>,
	pub audio_encoder: String,
	pub audio_bitrate_kbps: Option<u32>,
	pub downmix_stereo: bool,
	pub output_format: OutputFormat,
	/// fMP4 only: whether the muxer needs a delayed `moov` (copy mode,
	/// AC-3, E-AC-3, and Opus all require it; everything else uses an
	/// empty `moov`).
	pub needs_delayed_moov: bool,
	/// Insert `-bsf:a aac_adtstoasc` when copying AAC into fMP4.
	pub aac_bitstream_filter: bool,
	pub output_flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
	#[default]
	MpegTs,
	Mp4,
}

impl OutputFormat {
	fn ffmpeg_name(self) -> &'static str {
		match self {
			OutputFormat::MpegTs => "mpegts",
			OutputFormat::Mp4 => "mp4",
		}
	}
}

/// True for encoders this builder treats as hardware (anything selected
/// through a non-empty hwaccel label); used to decide whether to emit the
/// format-convert + upload filter and to suppress `-preset`.
fn is_hardware(spec: &CommandSpec) -> bool {
	!spec.hwaccel.is_empty()
}

/// Builds the full argument list (not including argv0 — the caller passes
/// the resolved binary path separately to `tokio::process::Command::new`).
pub fn build(spec: &CommandSpec) -> Vec<String> {
	let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into(), "-stats".into()];

	args.extend(spec.global_flags.iter().cloned());

	if !spec.hwaccel.is_empty() && !spec.hwaccel_device.is_empty() {
		args.push("-init_hw_device".into());
		args.push(format!("{}={}", spec.hwaccel, spec.hwaccel_device));
	}
	if !spec.hwaccel.is_empty() {
		args.push("-hwaccel".into());
		args.push(spec.hwaccel.clone());
		if !spec.hwaccel_device.is_empty() {
			args.push("-hwaccel_device".into());
			args.push(spec.hwaccel_device.clone());
		}
	}

	args.push("-f".into());
	args.push(spec.input_format.clone());
	args.push("-analyzeduration".into());
	args.push("5000000".into());
	args.push("-probesize".into());
	args.push("5000000".into());
	args.extend(spec.input_flags.iter().cloned());
	args.push("-i".into());
	args.push("pipe:0".into());

	args.push("-map".into());
	args.push("0:v:0".into());
	args.push("-map".into());
	args.push("0:a:0?".into());

	args.push("-c:v".into());
	args.push(spec.video_encoder.clone());
	if is_hardware(spec) {
		args.push("-vf".into());
		args.push("format=nv12,hwupload".into());
	}
	if let Some(kbps) = spec.video_bitrate_kbps {
		args.push("-b:v".into());
		args.push(format!("{kbps}k"));
	}
	if !is_hardware(spec) {
		if let Some(preset) = &spec.preset {
			args.push("-preset".into());
			args.push(preset.clone());
		}
	}

	args.push("-c:a".into());
	args.push(spec.audio_encoder.clone());
	if let Some(kbps) = spec.audio_bitrate_kbps {
		args.push("-b:a".into());
		args.push(format!("{kbps}k"));
	}
	if spec.downmix_stereo {
		args.push("-ac".into());
		args.push("2".into());
	}
	if spec.aac_bitstream_filter {
		args.push("-bsf:a".into());
		args.push("aac_adtstoasc".into());
	}

	match spec.output_format {
		OutputFormat::Mp4 => {
			let moov = if spec.needs_delayed_moov { "delay_moov" } else { "empty_moov" };
			args.push("-movflags".into());
			args.push(format!("frag_keyframe+{moov}+default_base_moof"));
		}
		OutputFormat::MpegTs => {
			args.push("-muxdelay".into());
			args.push("0".into());
		}
	}
	args.push("-flush_packets".into());
	args.push("1".into());

	args.extend(spec.output_flags.iter().cloned());
	args.push("-f".into());
	args.push(spec.output_format.ffmpeg_name().to_string());
	args.push("pipe:1".into());

	args
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_spec() -> CommandSpec {
		CommandSpec {
			input_format: "mpegts".into(),
			video_encoder: "libx264".into(),
			audio_encoder: "aac".into(),
			preset: Some("veryfast".into()),
			output_format: OutputFormat::MpegTs,
			..Default::default()
		}
	}

	#[test]
	fn software_encoder_gets_preset_no_hwupload() {
		let args = build(&base_spec());
		assert!(args.iter().any(|a| a == "-preset"));
		assert!(!args.iter().any(|a| a == "-vf"));
	}

	#[test]
	fn hardware_encoder_gets_hwupload_and_device_init() {
		let mut spec = base_spec();
		spec.video_encoder = "h264_vaapi".into();
		spec.hwaccel = "vaapi".into();
		spec.hwaccel_device = "/dev/dri/renderD128".into();
		spec.preset = None;
		let args = build(&spec);
		assert!(args.iter().any(|a| a == "-vf"));
		assert!(args.windows(2).any(|w| w == ["-init_hw_device", "vaapi=/dev/dri/renderD128"]));
		assert!(!args.iter().any(|a| a == "-preset"));
	}

	#[test]
	fn fmp4_output_uses_delayed_moov_for_ac3() {
		let mut spec = base_spec();
		spec.output_format = OutputFormat::Mp4;
		spec.needs_delayed_moov = true;
		let args = build(&spec);
		let idx = args.iter().position(|a| a == "-movflags").unwrap();
		assert_eq!(args[idx + 1], "frag_keyframe+delay_moov+default_base_moof");
	}

	#[test]
	fn fmp4_output_uses_empty_moov_by_default() {
		let mut spec = base_spec();
		spec.output_format = OutputFormat::Mp4;
		let args = build(&spec);
		let idx = args.iter().position(|a| a == "-movflags").unwrap();
		assert_eq!(args[idx + 1], "frag_keyframe+empty_moov+default_base_moof");
	}

	#[test]
	fn aac_copy_into_fmp4_gets_bitstream_filter() {
		let mut spec = base_spec();
		spec.audio_encoder = "copy".into();
		spec.output_format = OutputFormat::Mp4;
		spec.aac_bitstream_filter = true;
		let args = build(&spec);
		assert!(args.windows(2).any(|w| w == ["-bsf:a", "aac_adtstoasc"]));
	}

	#[test]
	fn mpegts_output_has_muxdelay_and_flush_packets() {
		let args = build(&base_spec());
		assert!(args.windows(2).any(|w| w == ["-muxdelay", "0"]));
		assert!(args.windows(2).any(|w| w == ["-flush_packets", "1"]));
	}
}
