use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration shared by every tvarr binary. Flattened into a
/// `clap::Parser` struct with `#[command(flatten)] log: tvarr_native::Log`,
/// then `cli.log.init()` called once at the top of `main`.
#[derive(Parser, Clone, Debug)]
pub struct Log {
	/// Log level, unless overridden by `RUST_LOG`.
	#[arg(long, env = "TVARR_LOG", default_value = "info")]
	pub level: String,

	/// Emit logs as newline-delimited JSON instead of human-readable text.
	#[arg(long, env = "TVARR_LOG_JSON")]
	pub json: bool,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			json: false,
		}
	}
}

impl Log {
	/// Install the global `tracing` subscriber. Idempotent in practice
	/// (tests that call it more than once should use `tracing_test` instead
	/// of relying on double-init not panicking).
	pub fn init(&self) {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

		let registry = tracing_subscriber::registry().with(filter);

		if self.json {
			registry.with(tracing_subscriber::fmt::layer().json()).init();
		} else {
			registry.with(tracing_subscriber::fmt::layer()).init();
		}
	}
}
