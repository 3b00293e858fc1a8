use bytes::Bytes;
use tvarr_codec::Ticks;

/// Which elementary stream a [`Sample`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
	Video,
	Audio,
}

/// One encoded access unit (video) or frame (audio), as it crosses the
/// muxer/demuxer boundary. Timestamps are 90kHz ticks regardless of the
/// container's own timescale; muxers and demuxers are responsible for the
/// conversion at the edge.
#[derive(Debug, Clone)]
pub struct Sample {
	pub track: Track,
	pub pts: Ticks,
	pub dts: Ticks,
	pub keyframe: bool,
	pub data: Bytes,
	/// Monotonically increasing per-track sequence number, assigned by
	/// whichever side produces the sample (ingress or demux callback).
	pub sequence: u64,
}

impl Sample {
	pub fn video(pts: Ticks, dts: Ticks, keyframe: bool, data: Bytes) -> Self {
		Self {
			track: Track::Video,
			pts,
			dts,
			keyframe,
			data,
			sequence: 0,
		}
	}

	pub fn audio(pts: Ticks, data: Bytes) -> Self {
		Self {
			track: Track::Audio,
			pts,
			dts: pts,
			keyframe: true,
			data,
			sequence: 0,
		}
	}

	pub fn with_sequence(mut self, sequence: u64) -> Self {
		self.sequence = sequence;
		self
	}
}

/// A batch of samples produced by one demux pass, or handed to one mux pass.
/// Batching lets a stream handler forward several access units in a single
/// RPC message instead of one round trip per frame.
#[derive(Debug, Clone, Default)]
pub struct SampleBatch {
	pub sequence: u64,
	pub samples: Vec<Sample>,
}

impl SampleBatch {
	pub fn new(sequence: u64) -> Self {
		Self {
			sequence,
			samples: Vec::new(),
		}
	}

	pub fn push(&mut self, sample: Sample) {
		self.samples.push(sample);
	}

	pub fn is_empty(&self) -> bool {
		self.samples.is_empty()
	}

	pub fn len(&self) -> usize {
		self.samples.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn audio_sample_has_equal_pts_dts() {
		let s = Sample::audio(Ticks::new(90_000), Bytes::from_static(b"abc"));
		assert_eq!(s.pts, s.dts);
		assert!(s.keyframe);
	}

	#[test]
	fn batch_push_and_len() {
		let mut batch = SampleBatch::new(1);
		batch.push(Sample::video(Ticks::ZERO, Ticks::ZERO, true, Bytes::new()));
		assert_eq!(batch.len(), 1);
		assert!(!batch.is_empty());
	}
}
