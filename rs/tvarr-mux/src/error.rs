use thiserror::Error;

/// Failures while packaging samples into a container for a child transcoder.
#[derive(Debug, Error)]
pub enum MuxError {
	#[error("no video sample seen yet, cannot build init segment")]
	NoInitSegment,
	#[error("unsupported video codec for this container")]
	UnsupportedVideoCodec,
	#[error("unsupported audio codec for this container")]
	UnsupportedAudioCodec,
	#[error("codec error: {0}")]
	Codec(#[from] tvarr_codec::CodecError),
	#[error("mp4 box error: {0}")]
	Mp4(#[from] mp4_atom::Error),
	#[error("muxer was already flushed")]
	AlreadyFlushed,
}

/// Failures while parsing a container produced by a child transcoder.
#[derive(Debug, Error)]
pub enum DemuxError {
	#[error("truncated input: expected at least {expected} bytes, had {actual}")]
	Truncated { expected: usize, actual: usize },
	#[error("unknown or unsupported track handler")]
	UnsupportedTrack,
	#[error("no init segment (moov/PMT) seen before media data")]
	MissingInit,
	#[error("codec error: {0}")]
	Codec(#[from] tvarr_codec::CodecError),
	#[error("mp4 box error: {0}")]
	Mp4(#[from] mp4_atom::Error),
	#[error("malformed mpeg-ts packet: {0}")]
	MalformedPacket(&'static str),
}
