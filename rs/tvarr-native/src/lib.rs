//! Helper library for native tvarr applications.
//!
//! The daemon's ambient CLI/logging concerns live here rather than in
//! `tvarrd` directly, the way the fleet's other native binaries share one
//! `tracing-subscriber` setup instead of repeating it per `main.rs`.

mod log;

pub use log::Log;
