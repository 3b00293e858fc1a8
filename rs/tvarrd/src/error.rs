//! Job-level error taxonomy.
//!
//! Library crates (`tvarr-codec`, `tvarr-mux`) expose their own
//! `thiserror`-derived enums for callers to match on; this binary uses
//! `anyhow::Result` with `.context(...)` at call sites for everything
//! operational (spawn, RPC, config), matching `hang-cli`/`moq-relay`'s split
//! of anyhow at the application layer and thiserror at the library
//! boundary. `JobError` is the one thiserror type that crosses that
//! boundary deliberately: the stream handler needs to match on *kind* to
//! decide whether a failure is fatal for the job or just logged.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
	#[error("failed to spawn transcoder process: {0}")]
	ChildSpawnFailed(#[source] std::io::Error),

	#[error("transcoder exited before producing any output")]
	ChildExitedBeforeActivity,

	#[error("gpu session admission denied for index {gpu_index}")]
	AdmissionDenied { gpu_index: usize },

	#[error("job already {0}")]
	WrongState(&'static str),
}
