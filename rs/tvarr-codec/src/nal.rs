use crate::error::CodecError;
use bytes::{Buf, Bytes};

/// The canonical position a NAL unit occupies within a reordered access
/// unit: AUD, parameter sets, SEI, slices, other — in that order. Some
/// upstream sources emit SEI ahead of SPS/PPS, which breaks decoders that
/// resolve SEI against the currently active SPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NalKind {
	Aud,
	ParameterSet,
	Sei,
	Slice,
	Other,
}

/// HEVC NAL unit type codes, ITU H.265 V10 Table 7-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
enum HevcNalType {
	TrailN = 0,
	TrailR = 1,
	TsaN = 2,
	TsaR = 3,
	StsaN = 4,
	StsaR = 5,
	RadlN = 6,
	RadlR = 7,
	RaslN = 8,
	RaslR = 9,
	BlaWLp = 16,
	BlaWRadl = 17,
	BlaNLp = 18,
	IdrWRadl = 19,
	IdrNLp = 20,
	Cra = 21,
	Vps = 32,
	Sps = 33,
	Pps = 34,
	Aud = 35,
	EndOfSequence = 36,
	EndOfBitstream = 37,
	Filler = 38,
	SeiPrefix = 39,
	SeiSuffix = 40,
}

/// AVC (H.264) NAL unit type codes, ITU H.264 Table 7-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
enum AvcNalType {
	Slice = 1,
	DataPartitionA = 2,
	DataPartitionB = 3,
	DataPartitionC = 4,
	Idr = 5,
	Sei = 6,
	Sps = 7,
	Pps = 8,
	Aud = 9,
	EndOfSequence = 10,
	EndOfStream = 11,
	Filler = 12,
	SpsExt = 13,
	Prefix = 14,
	SubsetSps = 15,
}

/// Returns the raw NAL unit type for a single NAL unit (start code and any
/// length prefix already stripped). `is_hevc` selects the bit layout: HEVC
/// packs the type into bits 1-6 of the first byte; AVC uses bits 0-4.
pub fn nalu_type(nal: &[u8], is_hevc: bool) -> Result<u8, CodecError> {
	let header = *nal.first().ok_or(CodecError::NalTooShort(nal.len()))?;

	if is_hevc {
		if nal.len() < 2 {
			return Err(CodecError::NalTooShort(nal.len()));
		}
		if (header >> 7) & 1 != 0 {
			return Err(CodecError::ForbiddenBitSet);
		}
		Ok((header >> 1) & 0b0111_1111)
	} else {
		if (header >> 7) & 1 != 0 {
			return Err(CodecError::ForbiddenBitSet);
		}
		Ok(header & 0b0001_1111)
	}
}

/// Public wrapper over the internal AUD/parameter-set/SEI/slice/other
/// classifier, for demuxers that need to recognize parameter sets and
/// random-access slices without re-deriving NAL type tables of their own.
pub fn classify(nal: &[u8], is_hevc: bool) -> NalKind {
	classify_inner(nal, is_hevc)
}

/// `true` iff any NAL unit in the access unit is a random-access slice
/// (AVC IDR; HEVC IDR/CRA/BLA) — used by the MPEG-TS demuxer to mark
/// keyframes the same way a decoder would recognize a splice point.
pub fn is_random_access_point(nalus: &[Bytes], is_hevc: bool) -> bool {
	nalus.iter().any(|nal| {
		let Ok(ty) = nalu_type(nal, is_hevc) else {
			return false;
		};
		if is_hevc {
			matches!(
				HevcNalType::try_from(ty),
				Ok(HevcNalType::BlaWLp
					| HevcNalType::BlaWRadl
					| HevcNalType::BlaNLp
					| HevcNalType::IdrWRadl
					| HevcNalType::IdrNLp
					| HevcNalType::Cra)
			)
		} else {
			matches!(AvcNalType::try_from(ty), Ok(AvcNalType::Idr))
		}
	})
}

fn classify_inner(nal: &[u8], is_hevc: bool) -> NalKind {
	let Ok(ty) = nalu_type(nal, is_hevc) else {
		return NalKind::Other;
	};

	if is_hevc {
		match HevcNalType::try_from(ty) {
			Ok(HevcNalType::Aud) => NalKind::Aud,
			Ok(HevcNalType::Vps | HevcNalType::Sps | HevcNalType::Pps) => NalKind::ParameterSet,
			Ok(HevcNalType::SeiPrefix | HevcNalType::SeiSuffix) => NalKind::Sei,
			Ok(
				HevcNalType::TrailN
				| HevcNalType::TrailR
				| HevcNalType::TsaN
				| HevcNalType::TsaR
				| HevcNalType::StsaN
				| HevcNalType::StsaR
				| HevcNalType::RadlN
				| HevcNalType::RadlR
				| HevcNalType::RaslN
				| HevcNalType::RaslR
				| HevcNalType::BlaWLp
				| HevcNalType::BlaWRadl
				| HevcNalType::BlaNLp
				| HevcNalType::IdrWRadl
				| HevcNalType::IdrNLp
				| HevcNalType::Cra,
			) => NalKind::Slice,
			_ => NalKind::Other,
		}
	} else {
		match AvcNalType::try_from(ty) {
			Ok(AvcNalType::Aud) => NalKind::Aud,
			Ok(AvcNalType::Sps | AvcNalType::Pps | AvcNalType::SpsExt | AvcNalType::SubsetSps) => {
				NalKind::ParameterSet
			}
			Ok(AvcNalType::Sei) => NalKind::Sei,
			Ok(AvcNalType::Slice | AvcNalType::Idr | AvcNalType::DataPartitionA) => NalKind::Slice,
			_ => NalKind::Other,
		}
	}
}

/// Stable-sort NAL units into AUD, parameter sets, SEI, slices, other.
/// Idempotent: reordering an already-ordered access unit is a no-op.
pub fn reorder_access_unit(nals: Vec<Bytes>, is_hevc: bool) -> Vec<Bytes> {
	let mut indexed: Vec<(NalKind, usize, Bytes)> = nals
		.into_iter()
		.enumerate()
		.map(|(i, nal)| (classify(&nal, is_hevc), i, nal))
		.collect();

	indexed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
	indexed.into_iter().map(|(_, _, nal)| nal).collect()
}

/// Split an Annex-B bitstream (3 or 4 byte 0x000001 / 0x00000001 start
/// codes) into individual NAL units, start codes stripped. On malformed
/// input (no start code found at all) falls back to treating the whole
/// buffer as a single NAL unit, per the no-fatal-parse-error contract for
/// this helper.
pub fn split_annex_b(data: &[u8]) -> Vec<Bytes> {
	let mut nals = Vec::new();
	let mut buf = Bytes::copy_from_slice(data);

	let Some(mut start) = after_start_code(buf.as_ref()) else {
		if !buf.is_empty() {
			nals.push(buf);
		}
		return nals;
	};

	loop {
		match find_start_code(&buf.as_ref()[start..]) {
			Some((size, new_start)) => {
				buf.advance(start);
				let nal = buf.copy_to_bytes(size);
				nals.push(nal);
				start = new_start;
			}
			None => {
				buf.advance(start);
				if buf.has_remaining() {
					nals.push(buf.copy_to_bytes(buf.remaining()));
				}
				break;
			}
		}
	}

	nals
}

/// Split a length-prefixed bitstream (AVC1/HVC1 style: big-endian length
/// field of `nal_length_size` bytes, typically 4, followed by the NAL
/// unit) into individual NAL units.
pub fn split_length_prefixed(data: &[u8], nal_length_size: usize) -> Vec<Bytes> {
	let mut nals = Vec::new();
	let mut buf = Bytes::copy_from_slice(data);

	while buf.remaining() >= nal_length_size {
		let len = match nal_length_size {
			1 => buf.chunk()[0] as usize,
			2 => u16::from_be_bytes([buf.chunk()[0], buf.chunk()[1]]) as usize,
			4 => u32::from_be_bytes([buf.chunk()[0], buf.chunk()[1], buf.chunk()[2], buf.chunk()[3]]) as usize,
			_ => break,
		};
		buf.advance(nal_length_size);

		if len == 0 || len > buf.remaining() {
			// Malformed trailing length: stop rather than panic on the slice.
			break;
		}
		nals.push(buf.copy_to_bytes(len));
	}

	nals
}

/// Returns the start-code size at the front of the buffer, if any.
fn after_start_code(b: &[u8]) -> Option<usize> {
	if b.len() < 3 || b[0] != 0 || b[1] != 0 {
		return None;
	}
	match b.get(2)? {
		0 if b.len() >= 4 && b[3] == 1 => Some(4),
		1 => Some(3),
		_ => None,
	}
}

/// Returns (size of the NAL before the next start code, size of that start
/// code), scanning from the front of `b`. Ported from the same bit-twiddling
/// used for HEVC inline parameter set scanning, generalized to return `None`
/// cleanly (rather than bailing) so callers can fall back gracefully.
fn find_start_code(mut b: &[u8]) -> Option<(usize, usize)> {
	let size = b.len();

	while b.len() >= 3 {
		match b[2] {
			0 if b.len() >= 4 => match b[3] {
				1 => match b[1] {
					0 => match b[0] {
						0 => return Some((size - b.len(), 4)),
						_ => return Some((size - b.len() + 1, 3)),
					},
					_ => b = &b[4..],
				},
				0 => b = &b[1..],
				_ => b = &b[4..],
			},
			0 => return None,
			1 => match b[1] {
				0 => match b[0] {
					0 => return Some((size - b.len(), 3)),
					_ => b = &b[3..],
				},
				_ => b = &b[3..],
			},
			_ => b = &b[3..],
		}
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn nal(ty: u8, hevc: bool) -> Bytes {
		if hevc {
			Bytes::from(vec![(ty << 1) & 0xfe, 0, 0xab])
		} else {
			Bytes::from(vec![ty & 0x1f, 0xab, 0xcd])
		}
	}

	#[test]
	fn split_annex_b_three_and_four_byte_start_codes() {
		let mut data = vec![0, 0, 1];
		data.extend_from_slice(&[0x67, 1, 2, 3]); // SPS-ish
		data.extend_from_slice(&[0, 0, 0, 1]);
		data.extend_from_slice(&[0x68, 4, 5]); // PPS-ish

		let nals = split_annex_b(&data);
		assert_eq!(nals.len(), 2);
		assert_eq!(&nals[0][..], &[0x67, 1, 2, 3]);
		assert_eq!(&nals[1][..], &[0x68, 4, 5]);
	}

	#[test]
	fn split_annex_b_malformed_falls_back_to_single_nal() {
		let data = vec![1, 2, 3, 4];
		let nals = split_annex_b(&data);
		assert_eq!(nals.len(), 1);
		assert_eq!(&nals[0][..], &data[..]);
	}

	#[test]
	fn split_length_prefixed_basic() {
		let mut data = Vec::new();
		data.extend_from_slice(&4u32.to_be_bytes());
		data.extend_from_slice(&[1, 2, 3, 4]);
		data.extend_from_slice(&2u32.to_be_bytes());
		data.extend_from_slice(&[5, 6]);

		let nals = split_length_prefixed(&data, 4);
		assert_eq!(nals.len(), 2);
		assert_eq!(&nals[0][..], &[1, 2, 3, 4]);
		assert_eq!(&nals[1][..], &[5, 6]);
	}

	#[test]
	fn reorder_is_idempotent_avc() {
		let nals = vec![
			nal(AvcNalType::Sei as u8, false),
			nal(AvcNalType::Sps as u8, false),
			nal(AvcNalType::Pps as u8, false),
			nal(AvcNalType::Slice as u8, false),
		];
		let once = reorder_access_unit(nals, false);
		let twice = reorder_access_unit(once.clone(), false);
		assert_eq!(once, twice);
		// SPS/PPS must now precede SEI.
		assert_eq!(classify(&once[0], false), NalKind::ParameterSet);
		assert_eq!(classify(&once[1], false), NalKind::ParameterSet);
		assert_eq!(classify(&once[2], false), NalKind::Sei);
		assert_eq!(classify(&once[3], false), NalKind::Slice);
	}

	#[test]
	fn reorder_is_idempotent_hevc() {
		let nals = vec![
			nal(HevcNalType::SeiPrefix as u8, true),
			nal(HevcNalType::Vps as u8, true),
			nal(HevcNalType::Sps as u8, true),
			nal(HevcNalType::Pps as u8, true),
			nal(HevcNalType::IdrWRadl as u8, true),
		];
		let once = reorder_access_unit(nals, true);
		let twice = reorder_access_unit(once.clone(), true);
		assert_eq!(once, twice);
		assert_eq!(classify(&once[0], true), NalKind::ParameterSet);
		assert_eq!(classify(&once.last().unwrap(), true), NalKind::Slice);
	}
}
