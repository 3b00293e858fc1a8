use crate::error::CodecError;

/// Minimal MSB-first bit reader over the VP9 uncompressed header — VP9 has
/// no byte alignment within the header the way NAL headers do, so this
/// reads it bit by bit rather than masking fixed byte offsets.
struct BitReader<'a> {
	data: &'a [u8],
	bit_pos: usize,
}

impl<'a> BitReader<'a> {
	fn new(data: &'a [u8]) -> Self {
		Self { data, bit_pos: 0 }
	}

	fn read_bit(&mut self) -> Option<u8> {
		let byte = self.bit_pos / 8;
		let bit = 7 - (self.bit_pos % 8);
		let b = *self.data.get(byte)?;
		self.bit_pos += 1;
		Some((b >> bit) & 1)
	}

	fn read_bits(&mut self, n: u32) -> Option<u32> {
		let mut value = 0u32;
		for _ in 0..n {
			value = (value << 1) | self.read_bit()? as u32;
		}
		Some(value)
	}
}

/// `true` iff the VP9 frame's uncompressed header marks it as a key frame
/// that is being freshly decoded (not a `show_existing_frame` reference to
/// an already-decoded frame).
pub fn is_vp9_keyframe(data: &[u8]) -> bool {
	let mut r = BitReader::new(data);

	let Some(marker) = r.read_bits(2) else { return false };
	if marker != 0b10 {
		return false;
	}

	let Some(profile_low) = r.read_bit() else { return false };
	let Some(profile_high) = r.read_bit() else { return false };
	let profile = (profile_high << 1) | profile_low;
	if profile == 3 && r.read_bit().is_none() {
		return false;
	}

	match r.read_bit() {
		Some(1) => return false, // show_existing_frame
		Some(0) => {}
		None => return false,
	}

	matches!(r.read_bit(), Some(0)) // frame_type: 0 == KEY_FRAME
}

/// Parse width/height from a VP9 key frame's uncompressed header. Returns
/// `None` on any non-keyframe or truncated header — callers (the fMP4
/// muxer) should only invoke this once `is_vp9_keyframe` has returned true.
pub fn vp9_frame_size(data: &[u8]) -> Result<(u32, u32), CodecError> {
	let mut r = BitReader::new(data);

	let marker = r.read_bits(2).ok_or(CodecError::Vp9HeaderTooShort)?;
	if marker != 0b10 {
		return Err(CodecError::Vp9HeaderTooShort);
	}

	let profile_low = r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	let profile_high = r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	let profile = (profile_high << 1) | profile_low;
	if profile == 3 {
		r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	}

	let show_existing_frame = r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	if show_existing_frame == 1 {
		return Err(CodecError::Vp9HeaderTooShort);
	}

	let frame_type = r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	if frame_type != 0 {
		return Err(CodecError::Vp9HeaderTooShort);
	}

	let _show_frame = r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	let _error_resilient_mode = r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;

	// frame_sync_code: 0x49 0x83 0x42
	for _ in 0..24 {
		r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?;
	}

	// color_config
	let bit_depth_high_precision = profile >= 2;
	if bit_depth_high_precision {
		r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?; // ten_or_twelve_bit
	}
	let color_space = r.read_bits(3).ok_or(CodecError::Vp9HeaderTooShort)?;
	const CS_RGB: u32 = 7;
	if color_space != CS_RGB {
		r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?; // color_range
		if profile == 1 || profile == 3 {
			r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?; // subsampling_x
			r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?; // subsampling_y
			r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?; // reserved_zero
		}
	} else if profile == 1 || profile == 3 {
		r.read_bit().ok_or(CodecError::Vp9HeaderTooShort)?; // reserved_zero
	}

	// frame_size
	let width_minus_1 = r.read_bits(16).ok_or(CodecError::Vp9HeaderTooShort)?;
	let height_minus_1 = r.read_bits(16).ok_or(CodecError::Vp9HeaderTooShort)?;

	Ok((width_minus_1 + 1, height_minus_1 + 1))
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Hand-build a minimal VP9 key frame uncompressed header: profile 0,
	/// not show_existing_frame, key frame, show_frame=1,
	/// error_resilient=0, sync code, color_space=CS_BT_601(1) (not RGB,
	/// profile 0 so no subsampling bits), color_range=0, 1280x720.
	fn key_frame_header(width: u32, height: u32) -> Vec<u8> {
		let mut bits: Vec<u8> = Vec::new();
		let mut push = |v: u32, n: u32| {
			for i in (0..n).rev() {
				bits.push(((v >> i) & 1) as u8);
			}
		};
		push(0b10, 2); // frame_marker
		push(0, 1); // profile_low
		push(0, 1); // profile_high -> profile 0
		push(0, 1); // show_existing_frame = 0
		push(0, 1); // frame_type = KEY_FRAME
		push(1, 1); // show_frame
		push(0, 1); // error_resilient_mode
		push(0x49, 8);
		push(0x83, 8);
		push(0x42, 8);
		push(1, 3); // color_space (not RGB)
		push(0, 1); // color_range
		push(width - 1, 16);
		push(height - 1, 16);

		let mut bytes = Vec::new();
		for chunk in bits.chunks(8) {
			let mut byte = 0u8;
			for (i, b) in chunk.iter().enumerate() {
				byte |= b << (7 - i);
			}
			bytes.push(byte);
		}
		bytes
	}

	#[test]
	fn detects_keyframe() {
		let data = key_frame_header(1280, 720);
		assert!(is_vp9_keyframe(&data));
	}

	#[test]
	fn parses_frame_size() {
		let data = key_frame_header(1920, 1080);
		assert_eq!(vp9_frame_size(&data).unwrap(), (1920, 1080));
	}

	#[test]
	fn non_keyframe_marker_rejected() {
		assert!(!is_vp9_keyframe(&[0x00, 0x00]));
	}
}
