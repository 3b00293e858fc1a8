mod fmp4;
mod mpegts;

pub use fmp4::Fmp4Mux;
pub use mpegts::MpegTsMux;

use bytes::Bytes;
use tvarr_codec::{AudioCodec, Ticks, VideoCodec};

use crate::error::MuxError;

/// Packages samples into the container bytes a child transcoder process
/// expects on stdin. Implementations are free to buffer internally; callers
/// drive the sequence `initialize_and_get_header` → repeated `write_video`/
/// `write_audio` → `flush` (possibly interleaved) → final `flush`.
pub trait InputMuxer {
	/// Queue a video access unit. `pts`/`dts` are 90kHz ticks.
	fn write_video(&mut self, pts: Ticks, dts: Ticks, data: &[u8], is_keyframe: bool) -> Result<(), MuxError>;

	/// Queue an audio frame. `pts` is 90kHz ticks.
	fn write_audio(&mut self, pts: Ticks, data: &[u8]) -> Result<(), MuxError>;

	/// Flush any buffered container bytes produced so far, returning them for
	/// the caller to write to the child's stdin. May return an empty buffer.
	fn flush(&mut self) -> Result<Bytes, MuxError>;

	/// Bytes that must reach the child before any media sample, if any.
	/// Idempotent: returns an empty buffer once already emitted.
	fn initialize_and_get_header(&mut self) -> Result<Bytes, MuxError>;

	/// The `-f` value the child ffmpeg-compatible process expects for this
	/// container.
	fn format(&self) -> &'static str;
}

/// Closed set of [`InputMuxer`] implementations, dispatched without a trait
/// object since the variant set is fixed at compile time.
pub enum InputMuxerKind {
	MpegTs(MpegTsMux),
	Fmp4(Fmp4Mux),
}

impl InputMuxerKind {
	/// Pick the variant for a source codec pair. VP9/AV1 require fMP4;
	/// everything else uses MPEG-TS.
	pub fn for_codecs(video: VideoCodec, audio: AudioCodec) -> Self {
		if video.requires_fmp4() {
			Self::Fmp4(Fmp4Mux::new(video, audio))
		} else {
			Self::MpegTs(MpegTsMux::new(video, audio))
		}
	}

	/// Parse `TranscodeConfig::audio_init_bytes` into the muxer's AAC sample
	/// rate/channel count, when the audio codec is AAC. A no-op for every
	/// other audio codec.
	pub fn set_audio_init(&mut self, audio_init: &[u8]) {
		match self {
			Self::MpegTs(m) => m.set_audio_init(audio_init),
			Self::Fmp4(m) => m.set_audio_init(audio_init),
		}
	}
}

impl InputMuxer for InputMuxerKind {
	fn write_video(&mut self, pts: Ticks, dts: Ticks, data: &[u8], is_keyframe: bool) -> Result<(), MuxError> {
		match self {
			Self::MpegTs(m) => m.write_video(pts, dts, data, is_keyframe),
			Self::Fmp4(m) => m.write_video(pts, dts, data, is_keyframe),
		}
	}

	fn write_audio(&mut self, pts: Ticks, data: &[u8]) -> Result<(), MuxError> {
		match self {
			Self::MpegTs(m) => m.write_audio(pts, data),
			Self::Fmp4(m) => m.write_audio(pts, data),
		}
	}

	fn flush(&mut self) -> Result<Bytes, MuxError> {
		match self {
			Self::MpegTs(m) => m.flush(),
			Self::Fmp4(m) => m.flush(),
		}
	}

	fn initialize_and_get_header(&mut self) -> Result<Bytes, MuxError> {
		match self {
			Self::MpegTs(m) => m.initialize_and_get_header(),
			Self::Fmp4(m) => m.initialize_and_get_header(),
		}
	}

	fn format(&self) -> &'static str {
		match self {
			Self::MpegTs(m) => m.format(),
			Self::Fmp4(m) => m.format(),
		}
	}
}
