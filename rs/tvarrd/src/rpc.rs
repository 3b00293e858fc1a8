//! Generated `tonic` client + message types for the fleet protocol, plus a
//! thin reconnecting wrapper the daemon's main loop drives.
//!
//! Only message shapes and the client stub are generated via `build.rs`;
//! connection establishment, auth, and retry/backoff bookkeeping are this
//! module's own code, not `tonic-build` output.

pub mod proto {
	tonic::include_proto!("tvarr.fleet.v1");
}

use std::time::Duration;

use anyhow::Context;
use tonic::transport::Channel;

pub use proto::fleet_client::FleetClient as GeneratedFleetClient;
pub use proto::*;

/// Exponential backoff for reconnecting to the coordinator after the stream
/// breaks or heartbeats fail (initial 5s, cap 60s, up to five attempts).
pub struct ReconnectBackoff {
	attempt: u32,
	initial: Duration,
	cap: Duration,
	max_attempts: u32,
}

impl Default for ReconnectBackoff {
	fn default() -> Self {
		Self {
			attempt: 0,
			initial: Duration::from_secs(5),
			cap: Duration::from_secs(60),
			max_attempts: 5,
		}
	}
}

impl ReconnectBackoff {
	/// `None` once `max_attempts` consecutive failures have been recorded;
	/// the caller should widen its own outer retry cycle at that point.
	pub fn next_delay(&mut self) -> Option<Duration> {
		if self.attempt >= self.max_attempts {
			return None;
		}
		let delay = self.initial.saturating_mul(1 << self.attempt).min(self.cap);
		self.attempt += 1;
		Some(delay)
	}

	pub fn reset(&mut self) {
		self.attempt = 0;
	}
}

/// Dials the coordinator and hands back a connected client. Connection
/// establishment itself (TLS, auth-token validation on the coordinator's
/// side) is out of scope beyond what `tonic::transport::Channel` does for
/// us; this daemon only speaks the client half of `Fleet`.
pub async fn connect(addr: &str) -> anyhow::Result<GeneratedFleetClient<Channel>> {
	let channel = Channel::from_shared(addr.to_string())
		.with_context(|| format!("invalid coordinator address {addr:?}"))?
		.connect()
		.await
		.with_context(|| format!("failed to connect to coordinator at {addr}"))?;
	Ok(GeneratedFleetClient::new(channel))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_and_caps() {
		let mut backoff = ReconnectBackoff::default();
		assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
		assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
		assert_eq!(backoff.next_delay(), Some(Duration::from_secs(20)));
		assert_eq!(backoff.next_delay(), Some(Duration::from_secs(40)));
		assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60))); // capped, would be 80
		assert_eq!(backoff.next_delay(), None); // 5 attempts exhausted
	}

	#[test]
	fn reset_restarts_from_initial_delay() {
		let mut backoff = ReconnectBackoff::default();
		backoff.next_delay();
		backoff.next_delay();
		backoff.reset();
		assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
	}
}
