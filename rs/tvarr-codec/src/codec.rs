/// Target/source video codec, matching `hang::catalog::VideoConfig`'s closed
/// set of codec kinds — dispatched on at construction, never mixed mid-job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
	H264,
	H265,
	Av1,
	Vp9,
}

impl VideoCodec {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::H264 => "h264",
			Self::H265 => "h265",
			Self::Av1 => "av1",
			Self::Vp9 => "vp9",
		}
	}

	/// MPEG-TS has no defined carriage (or universally accepted signalling)
	/// for these two; they must go out as fragmented MP4 instead.
	pub fn requires_fmp4(self) -> bool {
		matches!(self, Self::Av1 | Self::Vp9)
	}
}

impl std::str::FromStr for VideoCodec {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"h264" | "avc" | "avc1" => Ok(Self::H264),
			"h265" | "hevc" | "hev1" | "hvc1" => Ok(Self::H265),
			"av1" | "av01" => Ok(Self::Av1),
			"vp9" | "vp09" => Ok(Self::Vp9),
			other => Err(format!("unknown video codec: {other}")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
	Aac,
	Ac3,
	Eac3,
	Mp3,
	Opus,
	Copy,
}

impl AudioCodec {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Aac => "aac",
			Self::Ac3 => "ac3",
			Self::Eac3 => "eac3",
			Self::Mp3 => "mp3",
			Self::Opus => "opus",
			Self::Copy => "copy",
		}
	}

	/// Nominal samples per frame for codecs with a constant frame duration.
	/// `None` for variable-duration Opus/copy; callers fall back to the
	/// container-supplied PTS for those (see the Opus open question in
	/// DESIGN.md).
	pub fn constant_frame_samples(self) -> Option<u32> {
		match self {
			Self::Aac => Some(1024),
			Self::Mp3 => Some(1152),
			Self::Eac3 => Some(1536),
			Self::Opus => Some(960),
			Self::Ac3 | Self::Copy => None,
		}
	}
}

impl std::str::FromStr for AudioCodec {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"aac" | "mp4a" => Ok(Self::Aac),
			"ac3" | "ac-3" => Ok(Self::Ac3),
			"eac3" | "e-ac-3" => Ok(Self::Eac3),
			"mp3" => Ok(Self::Mp3),
			"opus" => Ok(Self::Opus),
			"copy" => Ok(Self::Copy),
			other => Err(format!("unknown audio codec: {other}")),
		}
	}
}
