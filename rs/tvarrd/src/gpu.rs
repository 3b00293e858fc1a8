//! Concurrent GPU session accounting.
//!
//! Shared across every job in the daemon behind an `Arc`. A single
//! `parking_lot::Mutex` guards every GPU's counters together, the way
//! `hang`'s `CatalogProducer` locks its whole state rather than splitting it
//! across per-field atomics: encode and decode ceilings here are derived
//! from each other (decode defaults to 2x encode) and read/written in pairs,
//! so one lock keeps them consistent without a retry loop.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

const GPU_MAX_SESSIONS_ENV: &str = "TVARR_GPU_MAX_SESSIONS";

/// Operator-supplied GPU description, loaded from the side file named by
/// `DaemonConfig::gpu_descriptors_path` (GPU *enumeration* is out of scope;
/// this is just the shape the tracker and the advertised capabilities
/// consume).
#[derive(Debug, Clone, Deserialize)]
pub struct GpuDescriptor {
	pub index: i32,
	pub name: String,
	/// 0 means unlimited.
	pub max_encode_sessions: u32,
	#[serde(default)]
	pub class: GpuClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuClass {
	Consumer,
	Professional,
	Datacenter,
	Integrated,
	#[default]
	Unknown,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sessions {
	max_encode: u32,
	max_decode: u32,
	active_encode: u32,
	active_decode: u32,
}

/// Point-in-time read of one GPU's counters, for stats reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSnapshot {
	pub active_encode: u32,
	pub max_encode: u32,
	pub active_decode: u32,
	pub max_decode: u32,
}

/// Admission control for hardware encode/decode sessions, indexed by GPU
/// position in the descriptor list passed to `new` (not the descriptor's own
/// `index` field, which is only advertised upstream).
pub struct GpuTracker {
	gpus: Mutex<Vec<Sessions>>,
}

impl GpuTracker {
	/// `TVARR_GPU_MAX_SESSIONS` is read once here and, when present and
	/// parseable as a non-negative integer, overrides every GPU's encode
	/// ceiling uniformly before decode ceilings are derived.
	pub fn new(gpus: &[GpuDescriptor]) -> Arc<Self> {
		let override_max = std::env::var(GPU_MAX_SESSIONS_ENV).ok().and_then(|v| v.parse::<u32>().ok());

		let sessions = gpus
			.iter()
			.map(|gpu| {
				let max_encode = override_max.unwrap_or(gpu.max_encode_sessions);
				Sessions {
					max_encode,
					max_decode: max_encode.saturating_mul(2),
					active_encode: 0,
					active_decode: 0,
				}
			})
			.collect();

		Arc::new(Self { gpus: Mutex::new(sessions) })
	}

	pub fn acquire_encode(&self, gpu_index: usize) -> bool {
		let mut gpus = self.gpus.lock();
		let Some(sessions) = gpus.get_mut(gpu_index) else {
			return false;
		};
		if sessions.max_encode == 0 || sessions.active_encode < sessions.max_encode {
			sessions.active_encode += 1;
			true
		} else {
			false
		}
	}

	pub fn release_encode(&self, gpu_index: usize) {
		if let Some(sessions) = self.gpus.lock().get_mut(gpu_index) {
			sessions.active_encode = sessions.active_encode.saturating_sub(1);
		}
	}

	pub fn acquire_decode(&self, gpu_index: usize) -> bool {
		let mut gpus = self.gpus.lock();
		let Some(sessions) = gpus.get_mut(gpu_index) else {
			return false;
		};
		if sessions.max_decode == 0 || sessions.active_decode < sessions.max_decode {
			sessions.active_decode += 1;
			true
		} else {
			false
		}
	}

	pub fn release_decode(&self, gpu_index: usize) {
		if let Some(sessions) = self.gpus.lock().get_mut(gpu_index) {
			sessions.active_decode = sessions.active_decode.saturating_sub(1);
		}
	}

	pub fn has_available_encode(&self) -> bool {
		self.gpus.lock().iter().any(|s| s.max_encode == 0 || s.active_encode < s.max_encode)
	}

	/// Prefer any unlimited GPU; otherwise the GPU with the most remaining
	/// encode headroom. `None` if every GPU is at its ceiling.
	pub fn best_encode_gpu(&self) -> Option<usize> {
		let gpus = self.gpus.lock();
		if let Some(index) = gpus.iter().position(|s| s.max_encode == 0) {
			return Some(index);
		}
		gpus.iter()
			.enumerate()
			.filter(|(_, s)| s.active_encode < s.max_encode)
			.max_by_key(|(_, s)| s.max_encode - s.active_encode)
			.map(|(index, _)| index)
	}

	pub fn snapshot(&self, gpu_index: usize) -> Option<GpuSnapshot> {
		self.gpus.lock().get(gpu_index).map(|s| GpuSnapshot {
			active_encode: s.active_encode,
			max_encode: s.max_encode,
			active_decode: s.active_decode,
			max_decode: s.max_decode,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn descriptor(max_encode: u32) -> GpuDescriptor {
		GpuDescriptor {
			index: 0,
			name: "test".into(),
			max_encode_sessions: max_encode,
			class: GpuClass::Consumer,
		}
	}

	#[test]
	fn unlimited_permits_arbitrary_acquisitions() {
		let tracker = GpuTracker::new(&[descriptor(0)]);
		for _ in 0..100 {
			assert!(tracker.acquire_encode(0));
		}
	}

	#[test]
	fn ceiling_of_two_rejects_third_acquire() {
		let tracker = GpuTracker::new(&[descriptor(2)]);
		assert!(tracker.acquire_encode(0));
		assert!(tracker.acquire_encode(0));
		assert!(!tracker.acquire_encode(0));
		tracker.release_encode(0);
		assert!(tracker.acquire_encode(0));
	}

	#[test]
	fn release_never_underflows() {
		let tracker = GpuTracker::new(&[descriptor(1)]);
		tracker.release_encode(0);
		assert_eq!(tracker.snapshot(0).unwrap().active_encode, 0);
	}

	#[test]
	fn decode_ceiling_defaults_to_double_encode() {
		let tracker = GpuTracker::new(&[descriptor(3)]);
		assert_eq!(tracker.snapshot(0).unwrap().max_decode, 6);
	}

	#[test]
	fn best_encode_gpu_prefers_unlimited() {
		let tracker = GpuTracker::new(&[descriptor(1), descriptor(0)]);
		assert_eq!(tracker.best_encode_gpu(), Some(1));
	}

	#[test]
	fn best_encode_gpu_none_when_all_full() {
		let tracker = GpuTracker::new(&[descriptor(1)]);
		tracker.acquire_encode(0);
		assert_eq!(tracker.best_encode_gpu(), None);
	}

	#[test]
	fn balanced_acquire_release_restores_counts() {
		let tracker = GpuTracker::new(&[descriptor(0)]);
		for _ in 0..10 {
			assert!(tracker.acquire_encode(0));
		}
		for _ in 0..10 {
			tracker.release_encode(0);
		}
		assert_eq!(tracker.snapshot(0).unwrap().active_encode, 0);
	}
}
