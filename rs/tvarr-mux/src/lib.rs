//! Container muxers and demuxers for transcoding worker pipelines.
//!
//! `tvarr-mux` packages elementary-stream [`Sample`]s into a container a
//! native transcoder expects on stdin (the [`mux`] module), and parses the
//! transcoder's stdout back into samples (the [`demux`] module). Two
//! container variants are supported on each side: MPEG-TS, for H.264/H.265
//! sources and outputs, and fragmented MP4, the only variant that can carry
//! VP9 or AV1.

mod error;
mod sample;

pub mod demux;
pub mod mux;

pub use error::{DemuxError, MuxError};
pub use sample::{Sample, SampleBatch, Track};
