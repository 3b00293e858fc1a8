/// Conditions the codec helpers don't silently paper over. Malformed
/// start-code scanning and empty ADTS scans fall back to a best-effort
/// result rather than erroring (of the design: "malformed input degrades
/// to a single-NALU result"); this enum covers what's left.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error("NAL unit too short: {0} bytes")]
	NalTooShort(usize),

	#[error("forbidden zero bit set in NAL header")]
	ForbiddenBitSet,

	#[error("ADTS frame length shorter than header")]
	AdtsFrameTooShort,

	#[error("OBU header truncated")]
	ObuTooShort,

	#[error("failed to parse sequence header: {0}")]
	SequenceHeader(String),

	#[error("VP9 uncompressed header truncated")]
	Vp9HeaderTooShort,
}
