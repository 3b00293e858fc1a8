mod fmp4;
mod mpegts;

pub use fmp4::Fmp4Demux;
pub use mpegts::MpegTsDemux;

use tvarr_codec::{AudioCodec, Ticks, VideoCodec};

use crate::error::DemuxError;

/// Called for every video access unit recovered from the child's stdout.
/// `pts`/`dts` are normalized to 90kHz regardless of the container's
/// internal time base.
pub type OnVideo<'a> = dyn FnMut(Ticks, Ticks, &[u8], bool) + Send + 'a;

/// Called for every audio frame recovered from the child's stdout.
pub type OnAudio<'a> = dyn FnMut(Ticks, &[u8]) + Send + 'a;

/// Parses a child transcoder's stdout container back into elementary-stream
/// samples. `write` accepts partial/streaming input (callers feed it
/// arbitrary-sized chunks as they're read off the pipe); samples are
/// surfaced synchronously to the two callbacks passed at construction time,
/// never buffered past the `write` call that completed them.
pub trait OutputDemuxer {
	/// Feed container bytes. May invoke the video/audio callbacks zero or
	/// more times before returning.
	fn write(&mut self, data: &[u8]) -> Result<(), DemuxError>;

	/// Flush any data withheld pending a completing box/packet. Called once
	/// stdout has reached EOF.
	fn close(&mut self) -> Result<(), DemuxError>;
}

/// Closed set of [`OutputDemuxer`] implementations, matching
/// [`crate::mux::InputMuxerKind`]'s variant set and selection rule (VP9/AV1
/// targets require fMP4; everything else uses MPEG-TS).
pub enum OutputDemuxerKind<'a> {
	MpegTs(MpegTsDemux<'a>),
	Fmp4(Fmp4Demux<'a>),
}

impl<'a> OutputDemuxerKind<'a> {
	pub fn for_codecs(
		video: VideoCodec,
		audio: AudioCodec,
		on_video: Box<OnVideo<'a>>,
		on_audio: Box<OnAudio<'a>>,
	) -> Self {
		if video.requires_fmp4() {
			Self::Fmp4(Fmp4Demux::new(video, audio, on_video, on_audio))
		} else {
			Self::MpegTs(MpegTsDemux::new(video, audio, on_video, on_audio))
		}
	}
}

impl OutputDemuxer for OutputDemuxerKind<'_> {
	fn write(&mut self, data: &[u8]) -> Result<(), DemuxError> {
		match self {
			Self::MpegTs(d) => d.write(data),
			Self::Fmp4(d) => d.write(data),
		}
	}

	fn close(&mut self) -> Result<(), DemuxError> {
		match self {
			Self::MpegTs(d) => d.close(),
			Self::Fmp4(d) => d.close(),
		}
	}
}
