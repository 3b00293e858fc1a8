//! Encoder selection and operator override application.
//!
//! Plain functions over data plus a `thiserror` error for the one genuinely
//! invalid-input case (a malformed override regex).

use std::str::FromStr;

use regex::Regex;
use tvarr_codec::{AudioCodec, VideoCodec};

use crate::rpc::proto::EncoderOverride;

/// Priority order for automatic hardware-accelerator selection.
const HWACCEL_PRIORITY: &[&str] = &["vaapi", "cuda", "qsv", "videotoolbox", "amf"];

/// A hardware accelerator the transcoder binary reports on this host, along
/// with the encoders it has *validated* as actually usable (as opposed to
/// merely listed — a driver frequently lists decode-only encoders too).
#[derive(Debug, Clone, Default)]
pub struct Accelerator {
	pub label: String,
	pub device: String,
	pub video_encoders: Vec<String>,
}

/// Choose a video encoder, hwaccel label, and device for a target codec.
/// `target_codec` is the raw string from `TranscodeConfig`; "copy" or empty
/// means passthrough and short-circuits before anything else runs.
pub fn select_video(target_codec: &str, preferred_hwaccel: &str, accelerators: &[Accelerator]) -> (String, String, String) {
	let normalized = target_codec.trim().to_ascii_lowercase();
	if normalized.is_empty() || normalized == "copy" {
		return ("copy".to_string(), String::new(), String::new());
	}

	let Ok(codec) = VideoCodec::from_str(&normalized) else {
		return ("libx264".to_string(), String::new(), String::new());
	};

	if preferred_hwaccel != "none" {
		if !preferred_hwaccel.is_empty() && preferred_hwaccel != "auto" {
			// A specific accelerator was requested: try only that one.
			if let Some((encoder, accel)) = try_accelerator(codec, preferred_hwaccel, accelerators) {
				return (encoder, accel.label.clone(), accel.device.clone());
			}
		} else {
			for label in HWACCEL_PRIORITY {
				if let Some((encoder, accel)) = try_accelerator(codec, label, accelerators) {
					return (encoder, accel.label.clone(), accel.device.clone());
				}
			}
		}
	}

	(software_encoder(codec).to_string(), String::new(), String::new())
}

fn try_accelerator<'a>(codec: VideoCodec, label: &str, accelerators: &'a [Accelerator]) -> Option<(String, &'a Accelerator)> {
	let accel = accelerators.iter().find(|a| a.label == label)?;
	let encoder = hw_encoder_name(codec, label)?;
	accel.video_encoders.iter().any(|e| e == encoder).then(|| (encoder.to_string(), accel))
}

fn hw_encoder_name(codec: VideoCodec, hwaccel: &str) -> Option<&'static str> {
	use VideoCodec::*;
	match (codec, hwaccel) {
		(H264, "vaapi") => Some("h264_vaapi"),
		(H265, "vaapi") => Some("hevc_vaapi"),
		(Vp9, "vaapi") => Some("vp9_vaapi"),
		(Av1, "vaapi") => Some("av1_vaapi"),
		(H264, "cuda") => Some("h264_nvenc"),
		(H265, "cuda") => Some("hevc_nvenc"),
		(Av1, "cuda") => Some("av1_nvenc"),
		(H264, "qsv") => Some("h264_qsv"),
		(H265, "qsv") => Some("hevc_qsv"),
		(Vp9, "qsv") => Some("vp9_qsv"),
		(Av1, "qsv") => Some("av1_qsv"),
		(H264, "videotoolbox") => Some("h264_videotoolbox"),
		(H265, "videotoolbox") => Some("hevc_videotoolbox"),
		(H264, "amf") => Some("h264_amf"),
		(H265, "amf") => Some("hevc_amf"),
		(Av1, "amf") => Some("av1_amf"),
		_ => None,
	}
}

fn software_encoder(codec: VideoCodec) -> &'static str {
	match codec {
		VideoCodec::H264 => "libx264",
		VideoCodec::H265 => "libx265",
		VideoCodec::Vp9 => "libvpx-vp9",
		VideoCodec::Av1 => "libaom-av1",
	}
}

/// Choose an audio encoder for a target codec out of what the transcoder
/// binary reports as `available`. Falls back to AAC when `target_codec`
/// doesn't parse.
pub fn select_audio(target_codec: &str, available: &[String]) -> String {
	let normalized = target_codec.trim().to_ascii_lowercase();
	let codec = AudioCodec::from_str(&normalized).unwrap_or(AudioCodec::Aac);

	let candidates: &[&str] = match codec {
		AudioCodec::Aac => &["aac", "libfdk_aac"],
		AudioCodec::Ac3 => &["ac3"],
		AudioCodec::Eac3 => &["eac3"],
		AudioCodec::Mp3 => &["libmp3lame", "mp3"],
		AudioCodec::Opus => &["libopus", "opus"],
		AudioCodec::Copy => return "copy".to_string(),
	};

	candidates
		.iter()
		.find(|candidate| available.iter().any(|a| a == *candidate))
		.or(candidates.first())
		.map(|s| s.to_string())
		.unwrap_or_else(|| "aac".to_string())
}

/// Apply operator overrides, highest priority first; the first matching
/// rule wins. An override with an unparseable `cpu_regex` is logged and
/// skipped rather than failing the job.
pub fn apply_overrides(scope: &str, source_codec: &str, current_encoder: &str, hwaccel: &str, cpu_info: &str, overrides: &[EncoderOverride]) -> String {
	let mut rules: Vec<&EncoderOverride> = overrides.iter().filter(|rule| rule.scope == scope).collect();
	rules.sort_by(|a, b| b.priority.cmp(&a.priority));

	for rule in rules {
		if !rule.source_codec.is_empty() && rule.source_codec != source_codec {
			continue;
		}
		if !rule.hwaccel_filter.is_empty() && rule.hwaccel_filter != hwaccel {
			continue;
		}
		if !rule.cpu_regex.is_empty() {
			match Regex::new(&rule.cpu_regex) {
				Ok(re) => {
					if !re.is_match(cpu_info) {
						continue;
					}
				}
				Err(err) => {
					tracing::warn!(pattern = %rule.cpu_regex, %err, "skipping encoder override with invalid cpu_regex");
					continue;
				}
			}
		}
		return rule.encoder.clone();
	}

	current_encoder.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn vaapi(encoders: &[&str]) -> Accelerator {
		Accelerator {
			label: "vaapi".to_string(),
			device: "/dev/dri/renderD128".to_string(),
			video_encoders: encoders.iter().map(|s| s.to_string()).collect(),
		}
	}

	#[test]
	fn copy_and_empty_target_short_circuit() {
		assert_eq!(select_video("copy", "auto", &[]), ("copy".into(), "".into(), "".into()));
		assert_eq!(select_video("", "auto", &[]), ("copy".into(), "".into(), "".into()));
	}

	#[test]
	fn falls_back_to_software_when_no_accelerator_validates_encoder() {
		// The accelerator advertises vp9_vaapi as working but not h264_vaapi --
		// a driver that lists decode-only encoders as available.
		let accelerators = [vaapi(&["vp9_vaapi"])];
		let (encoder, hwaccel, _) = select_video("h264", "auto", &accelerators);
		assert_eq!(encoder, "libx264");
		assert_eq!(hwaccel, "");
	}

	#[test]
	fn auto_selects_hardware_when_validated() {
		let accelerators = [vaapi(&["h264_vaapi"])];
		let (encoder, hwaccel, device) = select_video("h264", "auto", &accelerators);
		assert_eq!(encoder, "h264_vaapi");
		assert_eq!(hwaccel, "vaapi");
		assert_eq!(device, "/dev/dri/renderD128");
	}

	#[test]
	fn explicit_none_forces_software() {
		let accelerators = [vaapi(&["h264_vaapi"])];
		let (encoder, hwaccel, _) = select_video("h264", "none", &accelerators);
		assert_eq!(encoder, "libx264");
		assert_eq!(hwaccel, "");
	}

	#[test]
	fn select_audio_prefers_first_available() {
		// aac precedes libfdk_aac in the priority list and is available.
		let available = vec!["libfdk_aac".to_string(), "aac".to_string()];
		assert_eq!(select_audio("aac", &available), "aac");
	}

	#[test]
	fn select_audio_falls_back_to_only_available_candidate() {
		let available = vec!["libfdk_aac".to_string()];
		assert_eq!(select_audio("aac", &available), "libfdk_aac");
	}

	#[test]
	fn override_priority_picks_highest_first() {
		let overrides = vec![
			EncoderOverride {
				scope: "video".into(),
				source_codec: String::new(),
				encoder: "h264_vaapi".into(),
				hwaccel_filter: String::new(),
				cpu_regex: String::new(),
				priority: 1,
			},
			EncoderOverride {
				scope: "video".into(),
				source_codec: String::new(),
				encoder: "h264_qsv".into(),
				hwaccel_filter: String::new(),
				cpu_regex: String::new(),
				priority: 10,
			},
		];
		let chosen = apply_overrides("video", "h264", "libx264", "", "", &overrides);
		assert_eq!(chosen, "h264_qsv");
	}

	#[test]
	fn override_skips_invalid_regex_and_falls_through() {
		let overrides = vec![EncoderOverride {
			scope: "video".into(),
			source_codec: String::new(),
			encoder: "h264_vaapi".into(),
			hwaccel_filter: String::new(),
			cpu_regex: "(".into(),
			priority: 5,
		}];
		let chosen = apply_overrides("video", "h264", "libx264", "", "Intel", &overrides);
		assert_eq!(chosen, "libx264");
	}

	#[test]
	fn override_cpu_regex_gates_match() {
		let overrides = vec![EncoderOverride {
			scope: "video".into(),
			source_codec: String::new(),
			encoder: "h264_qsv".into(),
			hwaccel_filter: String::new(),
			cpu_regex: "Xeon".into(),
			priority: 5,
		}];
		assert_eq!(apply_overrides("video", "h264", "libx264", "", "AMD Ryzen", &overrides), "libx264");
		assert_eq!(apply_overrides("video", "h264", "libx264", "", "Intel Xeon Gold", &overrides), "h264_qsv");
	}
}
