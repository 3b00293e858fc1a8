use crate::error::CodecError;
use bytes::{Buf, Bytes};
use scuffle_av1::seq::SequenceHeaderObu;

/// The AV1 OBU types this crate cares about — a subset of
/// `scuffle_av1::ObuType`, re-exported in our own vocabulary so callers
/// outside this crate don't need the `scuffle_av1` dependency directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObuType {
	SequenceHeader,
	TemporalDelimiter,
	FrameHeader,
	Frame,
	Metadata,
	TileGroup,
	TileList,
	Other,
}

impl From<scuffle_av1::ObuType> for ObuType {
	fn from(ty: scuffle_av1::ObuType) -> Self {
		match ty {
			scuffle_av1::ObuType::SequenceHeader => Self::SequenceHeader,
			scuffle_av1::ObuType::TemporalDelimiter => Self::TemporalDelimiter,
			scuffle_av1::ObuType::FrameHeader => Self::FrameHeader,
			scuffle_av1::ObuType::Frame => Self::Frame,
			scuffle_av1::ObuType::Metadata => Self::Metadata,
			scuffle_av1::ObuType::TileGroup => Self::TileGroup,
			scuffle_av1::ObuType::TileList => Self::TileList,
			_ => Self::Other,
		}
	}
}

/// One parsed OBU: its type and the full bytes (header included) so callers
/// can re-serialize it unchanged into a bitstream or an `mdat`.
#[derive(Debug, Clone)]
pub struct Obu {
	pub obu_type: ObuType,
	pub is_keyframe: bool,
	pub data: Bytes,
}

/// The fields of an AV1 sequence header this crate surfaces — enough to
/// build an `av1C` box and fMP4 `VideoConfig`-equivalent init data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceHeader {
	pub profile: u8,
	pub level: u8,
	pub tier: bool,
	pub bit_depth: u8,
	pub mono_chrome: bool,
	pub subsampling_x: bool,
	pub subsampling_y: bool,
	pub chroma_sample_position: u8,
	pub color_primaries: u8,
	pub transfer_characteristics: u8,
	pub matrix_coefficients: u8,
	pub full_range: bool,
	pub max_frame_width: u32,
	pub max_frame_height: u32,
}

impl From<&SequenceHeaderObu> for SequenceHeader {
	fn from(h: &SequenceHeaderObu) -> Self {
		Self {
			profile: h.seq_profile,
			level: h.operating_points.first().map(|op| op.seq_level_idx).unwrap_or(0),
			tier: h.operating_points.first().map(|op| op.seq_tier).unwrap_or(false),
			bit_depth: h.color_config.bit_depth as u8,
			mono_chrome: h.color_config.mono_chrome,
			subsampling_x: h.color_config.subsampling_x,
			subsampling_y: h.color_config.subsampling_y,
			chroma_sample_position: h.color_config.chroma_sample_position,
			color_primaries: h.color_config.color_primaries,
			transfer_characteristics: h.color_config.transfer_characteristics,
			matrix_coefficients: h.color_config.matrix_coefficients,
			full_range: h.color_config.full_color_range,
			max_frame_width: h.max_frame_width as u32,
			max_frame_height: h.max_frame_height as u32,
		}
	}
}

/// Parse an `av1C` box payload (ISO/IEC 14496-15 §5.3.2) into a
/// `SequenceHeader`, for when the only init data available is the MP4 box
/// rather than an inline OBU (e.g. re-muxing already-fragmented input).
/// Width/height aren't present in `av1C` and are left at 0; the caller
/// should fill them in once the first frame's sequence header OBU arrives.
pub fn parse_av1c(data: &[u8]) -> Result<SequenceHeader, CodecError> {
	if data.len() < 4 {
		return Err(CodecError::SequenceHeader("av1C box too short".into()));
	}

	let seq_profile = (data[1] >> 5) & 0x07;
	let seq_level_idx = data[1] & 0x1F;
	let tier = ((data[2] >> 7) & 0x01) == 1;
	let high_bitdepth = ((data[2] >> 6) & 0x01) == 1;
	let twelve_bit = ((data[2] >> 5) & 0x01) == 1;

	Ok(SequenceHeader {
		profile: seq_profile,
		level: seq_level_idx,
		tier,
		bit_depth: if high_bitdepth {
			if twelve_bit {
				12
			} else {
				10
			}
		} else {
			8
		},
		mono_chrome: ((data[2] >> 4) & 0x01) == 1,
		subsampling_x: ((data[2] >> 3) & 0x01) == 1,
		subsampling_y: ((data[2] >> 2) & 0x01) == 1,
		chroma_sample_position: data[2] & 0x03,
		color_primaries: 1,
		transfer_characteristics: 1,
		matrix_coefficients: 1,
		full_range: false,
		max_frame_width: 0,
		max_frame_height: 0,
	})
}

/// Split a raw AV1 OBU stream (low-overhead bitstream format, LEB128 sized
/// OBUs) into individual OBUs, classifying each one and flagging frame/
/// frame-header OBUs that start a key frame.
pub fn av1_obus(data: &[u8]) -> Vec<Obu> {
	let mut obus = Vec::new();
	let mut contains_keyframe = false;
	let mut buf = Bytes::copy_from_slice(data);

	while buf.has_remaining() {
		let Some(raw) = next_obu(&mut buf) else { break };

		let mut reader = &raw[..];
		let Ok(header) = scuffle_av1::ObuHeader::parse(&mut reader) else {
			break;
		};
		let payload_offset = raw.len() - reader.len();
		let obu_type: ObuType = header.obu_type.into();

		let is_keyframe = match obu_type {
			ObuType::SequenceHeader => {
				contains_keyframe = true;
				true
			}
			ObuType::FrameHeader | ObuType::Frame => {
				let payload = &raw[payload_offset..];
				let frame_is_key = match payload.first() {
					Some(first_byte) => {
						let show_existing_frame = (first_byte >> 7) & 1;
						if show_existing_frame == 1 {
							contains_keyframe
						} else {
							(first_byte >> 5) & 0b11 == 0
						}
					}
					None => false,
				};
				contains_keyframe = contains_keyframe || frame_is_key;
				contains_keyframe
			}
			_ => contains_keyframe,
		};

		obus.push(Obu {
			obu_type,
			is_keyframe,
			data: raw,
		});
	}

	obus
}

/// Parse the sequence header out of a list of OBUs (as returned by
/// [`av1_obus`]), if one is present.
pub fn sequence_header(obus: &[Obu]) -> Option<SequenceHeader> {
	for obu in obus {
		if obu.obu_type != ObuType::SequenceHeader {
			continue;
		}
		let mut reader = &obu.data[..];
		let header = scuffle_av1::ObuHeader::parse(&mut reader).ok()?;
		let payload_offset = obu.data.len() - reader.len();
		let parsed = SequenceHeaderObu::parse(header, &mut &obu.data[payload_offset..]).ok()?;
		return Some(SequenceHeader::from(&parsed));
	}
	None
}

fn next_obu(buf: &mut Bytes) -> Option<Bytes> {
	if buf.is_empty() {
		return None;
	}

	let data = buf.as_ref();
	let header = *data.first()?;
	let has_extension = (header >> 2) & 1 == 1;
	let has_size = (header >> 1) & 1 == 1;

	if !has_size {
		let remaining = buf.remaining();
		return Some(buf.copy_to_bytes(remaining));
	}

	let mut size: usize = 0;
	let mut offset = if has_extension { 2 } else { 1 };
	let mut shift = 0;

	loop {
		let byte = *data.get(offset)?;
		offset += 1;
		size |= ((byte & 0x7F) as usize) << shift;
		shift += 7;
		if byte & 0x80 == 0 {
			break;
		}
		if shift >= 56 {
			return None;
		}
	}

	let total_size = offset + size;
	if total_size > buf.remaining() {
		return None;
	}

	Some(buf.copy_to_bytes(total_size))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_av1c_box() {
		// marker, profile 0 / level 0, tier=0 high_bitdepth=0 twelve_bit=0 mono=0 ss_x=1 ss_y=1 cp=0
		let data = [0x81, 0x00, 0x0C, 0x00];
		let header = parse_av1c(&data).unwrap();
		assert_eq!(header.profile, 0);
		assert_eq!(header.bit_depth, 8);
		assert!(header.subsampling_x);
		assert!(header.subsampling_y);
	}

	#[test]
	fn splits_sized_obus() {
		// Two minimal OBUs with has_size_field set and a 1-byte LEB128 size.
		// header byte: forbidden(0) type(4) ext(0) has_size(1) reserved(0)
		// type 2 = OBU_TEMPORAL_DELIMITER
		let td_header = 0b0001_0010u8; // type=2, has_size=1
		let data = vec![td_header, 0x00]; // size = 0
		let obus = av1_obus(&data);
		assert_eq!(obus.len(), 1);
		assert_eq!(obus[0].obu_type, ObuType::TemporalDelimiter);
	}
}
