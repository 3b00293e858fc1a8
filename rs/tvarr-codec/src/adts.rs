use bytes::{BufMut, Buf, Bytes, BytesMut};

/// ADTS sync word: 12 bits, all set.
const SYNC_WORD: u16 = 0x0FFF;

/// `AudioSpecificConfig` fields relevant to ADTS framing: MPEG-4 audio
/// object type, sampling frequency, and channel count. Defaults (AAC-LC,
/// 48kHz, stereo) match "otherwise default to 48 kHz stereo AAC-LC".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
	pub object_type: u8,
	pub sample_rate: u32,
	pub channels: u16,
}

impl Default for AacConfig {
	fn default() -> Self {
		Self {
			object_type: 2, // AAC-LC
			sample_rate: 48_000,
			channels: 2,
		}
	}
}

const SAMPLING_FREQUENCIES: [u32; 13] = [
	96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350,
];

/// Parse the 2+ byte `AudioSpecificConfig` carried in `TranscodeConfig`'s
/// `audio_init_bytes` for AAC sources. Returns `None` on anything shorter
/// than the minimum 2-byte form or an out-of-range sampling frequency
/// index; callers fall back to [`AacConfig::default`] in that case.
pub fn parse_aac_asc(data: &[u8]) -> Option<AacConfig> {
	if data.len() < 2 {
		return None;
	}
	let object_type = data[0] >> 3;
	let freq_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
	let channel_config = (data[1] >> 3) & 0x0F;

	let sample_rate = *SAMPLING_FREQUENCIES.get(freq_index as usize)?;
	// channel_config 0 means "defined in an AOT-specific way"; treat as stereo
	// rather than failing the whole parse over one ambiguous field.
	let channels = if channel_config == 0 { 2 } else { channel_config as u16 };

	Some(AacConfig {
		object_type,
		sample_rate,
		channels,
	})
}

fn sampling_frequency_index(sample_rate: u32) -> u8 {
	SAMPLING_FREQUENCIES
		.iter()
		.position(|&rate| rate == sample_rate)
		.map(|i| i as u8)
		.unwrap_or(3) // 48kHz, the same fallback `tvarr-mux`'s fMP4 esds builder uses
}

/// Wrap one raw (header-stripped) AAC frame in a 7-byte ADTS header (no
/// CRC), the form MPEG-TS elementary streams carry AAC in.
pub fn build_adts_frame(config: AacConfig, raw: &[u8]) -> Bytes {
	let frame_length = raw.len() + 7;
	let freq_index = sampling_frequency_index(config.sample_rate);

	let mut out = BytesMut::with_capacity(frame_length);
	out.put_u8(0xFF);
	out.put_u8(0xF1); // MPEG-4, layer 00, protection_absent=1
	out.put_u8(((config.object_type.saturating_sub(1)) << 6) | (freq_index << 2) | ((config.channels as u8) >> 2));
	out.put_u8(((config.channels as u8 & 0x03) << 6) | ((frame_length >> 11) & 0x03) as u8);
	out.put_u8(((frame_length >> 3) & 0xFF) as u8);
	out.put_u8((((frame_length & 0x07) << 5) as u8) | 0x1F);
	out.put_u8(0xFC);
	out.extend_from_slice(raw);
	out.freeze()
}

/// True if `data` begins with a valid ADTS sync word — used to decide
/// whether an audio sample needs ADTS framing applied before it reaches an
/// MPEG-TS elementary stream, or is already framed and should pass through.
pub fn is_adts_framed(data: &[u8]) -> bool {
	data.len() >= 2 && (((data[0] as u16) << 4) | ((data[1] as u16) >> 4)) == SYNC_WORD
}

/// Scan an ADTS AAC byte stream and return the raw (header-stripped) AAC
/// frames it contains. Frames with a declared length that doesn't fit in
/// the remaining buffer are dropped rather than treated as fatal, mirroring
/// the crate's general "best effort on malformed input" contract.
pub fn extract_adts_frames(data: &[u8]) -> Vec<Bytes> {
	let mut frames = Vec::new();
	let mut buf = Bytes::copy_from_slice(data);

	while buf.remaining() >= 7 {
		let b = buf.chunk();
		let sync = ((b[0] as u16) << 4) | ((b[1] as u16) >> 4);
		if sync != SYNC_WORD {
			// Not aligned on a frame boundary; bail rather than scan byte by
			// byte for a codec that's supposed to already be frame-aligned.
			break;
		}

		let protection_absent = b[1] & 0x01;
		let frame_length = (((b[3] as usize) & 0x03) << 11) | ((b[4] as usize) << 3) | ((b[5] as usize) >> 5);
		let header_len = if protection_absent == 1 { 7 } else { 9 };

		if frame_length < header_len || frame_length > buf.remaining() {
			break;
		}

		buf.advance(header_len);
		frames.push(buf.copy_to_bytes(frame_length - header_len));
	}

	frames
}

#[cfg(test)]
mod tests {
	use super::*;

	fn adts_header(payload_len: usize) -> [u8; 7] {
		let frame_length = (payload_len + 7) as u32;
		[
			0xFF,
			0xF1, // MPEG-4, no CRC (protection_absent = 1)
			0x50, // profile=AAC LC, sampling_freq_index=4 (44.1k), private=0, channel high bit
			0x80 | ((frame_length >> 11) & 0x03) as u8,
			((frame_length >> 3) & 0xFF) as u8,
			(((frame_length & 0x07) << 5) as u8) | 0x1F,
			0xFC,
		]
	}

	#[test]
	fn extracts_single_frame() {
		let payload = [1u8, 2, 3, 4];
		let mut data = adts_header(payload.len()).to_vec();
		data.extend_from_slice(&payload);

		let frames = extract_adts_frames(&data);
		assert_eq!(frames.len(), 1);
		assert_eq!(&frames[0][..], &payload[..]);
	}

	#[test]
	fn extracts_multiple_frames() {
		let payload_a = [1u8, 2, 3];
		let payload_b = [4u8, 5];

		let mut data = adts_header(payload_a.len()).to_vec();
		data.extend_from_slice(&payload_a);
		data.extend_from_slice(&adts_header(payload_b.len()));
		data.extend_from_slice(&payload_b);

		let frames = extract_adts_frames(&data);
		assert_eq!(frames.len(), 2);
		assert_eq!(&frames[0][..], &payload_a[..]);
		assert_eq!(&frames[1][..], &payload_b[..]);
	}

	#[test]
	fn stops_on_bad_sync_word() {
		let data = [0x00, 0x00, 0x00, 0x00];
		assert!(extract_adts_frames(&data).is_empty());
	}

	#[test]
	fn parses_stereo_44k_asc() {
		// object_type=2 (AAC-LC), freq_index=4 (44100), channel_config=2 (stereo)
		let asc = [0x12, 0x10];
		let config = parse_aac_asc(&asc).unwrap();
		assert_eq!(config.object_type, 2);
		assert_eq!(config.sample_rate, 44_100);
		assert_eq!(config.channels, 2);
	}

	#[test]
	fn short_asc_fails_to_parse() {
		assert!(parse_aac_asc(&[0x12]).is_none());
	}

	#[test]
	fn build_adts_then_extract_round_trips() {
		let config = AacConfig::default();
		let raw = [1u8, 2, 3, 4, 5];
		let framed = build_adts_frame(config, &raw);
		assert!(is_adts_framed(&framed));
		let frames = extract_adts_frames(&framed);
		assert_eq!(frames.len(), 1);
		assert_eq!(&frames[0][..], &raw[..]);
	}

	#[test]
	fn is_adts_framed_detects_raw_payload() {
		assert!(!is_adts_framed(&[0x00, 0x00, 0x01, 0x02]));
	}
}
