use std::time::Duration;

/// 90 kHz, the canonical time base for every PTS/DTS this crate produces —
/// matches the MPEG-TS clock and is a clean multiple of the common audio
/// sample rates (8/16/32/44.1/48 kHz don't divide it exactly, but frame
/// counts at those rates round to a whole number of ticks closely enough
/// for any codec's constant frame duration).
pub const TICKS_PER_SECOND: i64 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tick overflow")]
pub struct TicksOverflow;

/// A signed, 90 kHz-tick timestamp. Signed because DTS can run ahead of a
/// batch's nominal zero point when a source is reordered (B-frames) and
/// because tfdt-derived base times in fragmented MP4 can't be assumed
/// non-negative once converted from an arbitrary track time base.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(i64);

impl Ticks {
	pub const ZERO: Self = Self(0);

	pub const fn new(ticks: i64) -> Self {
		Self(ticks)
	}

	pub const fn from_secs(seconds: i64) -> Result<Self, TicksOverflow> {
		match seconds.checked_mul(TICKS_PER_SECOND) {
			Some(ticks) => Ok(Self(ticks)),
			None => Err(TicksOverflow),
		}
	}

	pub const fn from_millis(millis: i64) -> Result<Self, TicksOverflow> {
		match millis.checked_mul(TICKS_PER_SECOND / 1000) {
			Some(ticks) => Ok(Self(ticks)),
			None => Err(TicksOverflow),
		}
	}

	/// Convert a sample count at a given sample rate into ticks, used for
	/// constant-frame-duration codecs (AAC 1024, MP3 1152, Opus 960, EAC-3 1536).
	pub fn from_samples(samples: u32, sample_rate: u32) -> Result<Self, TicksOverflow> {
		if sample_rate == 0 {
			return Err(TicksOverflow);
		}
		let ticks = (samples as i128 * TICKS_PER_SECOND as i128) / sample_rate as i128;
		i64::try_from(ticks).map(Self).map_err(|_| TicksOverflow)
	}

	pub const fn as_ticks(self) -> i64 {
		self.0
	}

	pub const fn as_millis(self) -> i64 {
		self.0 * 1000 / TICKS_PER_SECOND
	}

	pub const fn as_secs_f64(self) -> f64 {
		self.0 as f64 / TICKS_PER_SECOND as f64
	}

	pub fn checked_add(self, rhs: Self) -> Option<Self> {
		self.0.checked_add(rhs.0).map(Self)
	}

	pub fn checked_sub(self, rhs: Self) -> Option<Self> {
		self.0.checked_sub(rhs.0).map(Self)
	}
}

impl TryFrom<Duration> for Ticks {
	type Error = TicksOverflow;

	fn try_from(duration: Duration) -> Result<Self, Self::Error> {
		let ticks = duration.as_secs_f64() * TICKS_PER_SECOND as f64;
		if !ticks.is_finite() || ticks > i64::MAX as f64 {
			return Err(TicksOverflow);
		}
		Ok(Self(ticks as i64))
	}
}

impl std::fmt::Debug for Ticks {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}t", self.0)
	}
}

impl std::fmt::Display for Ticks {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}t", self.0)
	}
}

impl std::ops::Add for Ticks {
	type Output = Self;

	fn add(self, rhs: Self) -> Self {
		self.checked_add(rhs).expect("tick overflow")
	}
}

impl std::ops::AddAssign for Ticks {
	fn add_assign(&mut self, rhs: Self) {
		*self = *self + rhs;
	}
}

impl std::ops::Sub for Ticks {
	type Output = Self;

	fn sub(self, rhs: Self) -> Self {
		self.checked_sub(rhs).expect("tick overflow")
	}
}

impl std::ops::SubAssign for Ticks {
	fn sub_assign(&mut self, rhs: Self) {
		*self = *self - rhs;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn samples_to_ticks_aac() {
		// 1024 samples @ 48kHz -> 1920 ticks @ 90kHz
		assert_eq!(Ticks::from_samples(1024, 48_000).unwrap().as_ticks(), 1920);
	}

	#[test]
	fn add_sub_round_trip() {
		let a = Ticks::new(1000);
		let b = Ticks::new(250);
		assert_eq!((a + b) - b, a);
	}

	#[test]
	fn checked_add_overflows() {
		assert!(Ticks::new(i64::MAX).checked_add(Ticks::new(1)).is_none());
	}
}
