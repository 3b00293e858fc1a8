//! Codec-level helpers for transcoding worker pipelines.
//!
//! This crate knows about bitstreams, not containers: splitting H.264/H.265
//! access units into NAL units, reordering them into the canonical order a
//! decoder expects, framing/deframing ADTS AAC, and picking apart VP9 and
//! AV1 headers far enough to recover frame dimensions and keyframe status.
//! Container muxing (MPEG-TS, fragmented MP4) lives in `tvarr-mux`, which
//! depends on this crate.

mod adts;
mod av1;
mod codec;
mod error;
mod nal;
mod param_sets;
mod ticks;
mod vp9;

pub use adts::{build_adts_frame, extract_adts_frames, is_adts_framed, parse_aac_asc, AacConfig};
pub use av1::{av1_obus, parse_av1c, sequence_header, Obu, ObuType, SequenceHeader};
pub use codec::{AudioCodec, VideoCodec};
pub use error::CodecError;
pub use nal::{classify, is_random_access_point, nalu_type, reorder_access_unit, split_annex_b, split_length_prefixed, NalKind};
pub use param_sets::{avcc_param_sets, hvcc_param_sets};
pub use ticks::{Ticks, TicksOverflow, TICKS_PER_SECOND};
pub use vp9::{is_vp9_keyframe, vp9_frame_size};
