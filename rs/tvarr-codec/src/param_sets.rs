use bytes::Bytes;

/// Pull the SPS/PPS NAL units back out of a raw `avcC` (ISO/IEC 14496-15
/// §5.2.4.1) box body. The fMP4 demuxer needs these to prepend on every
/// emitted keyframe (the stored form is length-prefixed and param-set-free
/// once muxed into `moov`). Parsed directly from the byte layout, in the
/// same "walk bytes, validate a fixed field, slice out a unit" style as
/// this crate's ADTS and VP9 header scans.
pub fn avcc_param_sets(avcc: &[u8]) -> Vec<Bytes> {
	let mut out = Vec::new();
	if avcc.len() < 6 {
		return out;
	}

	let mut pos = 5;
	let Some(num_sps) = avcc.get(pos).map(|b| b & 0x1F) else {
		return out;
	};
	pos += 1;

	for _ in 0..num_sps {
		let Some(len) = read_u16_len(avcc, pos) else { break };
		pos += 2;
		let Some(nal) = slice_len(avcc, pos, len) else { break };
		out.push(nal);
		pos += len;
	}

	let Some(num_pps) = avcc.get(pos).copied() else {
		return out;
	};
	pos += 1;

	for _ in 0..num_pps {
		let Some(len) = read_u16_len(avcc, pos) else { break };
		pos += 2;
		let Some(nal) = slice_len(avcc, pos, len) else { break };
		out.push(nal);
		pos += len;
	}

	out
}

/// Pull VPS/SPS/PPS NAL units out of a raw `hvcC` (ISO/IEC 14496-15
/// §8.3.3.1) box body. Same rationale as [`avcc_param_sets`]: parsed
/// directly from the byte layout rather than round-tripped opaquely.
pub fn hvcc_param_sets(hvcc: &[u8]) -> Vec<Bytes> {
	let mut out = Vec::new();
	if hvcc.len() < 23 {
		return out;
	}

	let num_arrays = hvcc[22];
	let mut pos = 23;

	for _ in 0..num_arrays {
		let Some(&array_header) = hvcc.get(pos) else { break };
		pos += 1;
		let nal_unit_type = array_header & 0x3F;
		let is_param_set = matches!(nal_unit_type, 32 | 33 | 34); // VPS, SPS, PPS

		let Some(num_nalus) = read_u16_len(hvcc, pos) else { break };
		pos += 2;

		for _ in 0..num_nalus {
			let Some(len) = read_u16_len(hvcc, pos) else { return out };
			pos += 2;
			let Some(nal) = slice_len(hvcc, pos, len) else { return out };
			pos += len;
			if is_param_set {
				out.push(nal);
			}
		}
	}

	out
}

fn read_u16_len(data: &[u8], pos: usize) -> Option<usize> {
	let b0 = *data.get(pos)?;
	let b1 = *data.get(pos + 1)?;
	Some(u16::from_be_bytes([b0, b1]) as usize)
}

fn slice_len(data: &[u8], pos: usize, len: usize) -> Option<Bytes> {
	data.get(pos..pos + len).map(Bytes::copy_from_slice)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn avcc_empty_on_truncated_input() {
		assert!(avcc_param_sets(&[0, 0, 0]).is_empty());
	}

	#[test]
	fn avcc_extracts_sps_and_pps() {
		let mut avcc = vec![1, 0x64, 0, 0x1F, 0xFF];
		let sps = [0x67, 0xAA, 0xBB];
		let pps = [0x68, 0xCC];
		avcc.push(0xE0 | 1); // 1 SPS
		avcc.extend_from_slice(&(sps.len() as u16).to_be_bytes());
		avcc.extend_from_slice(&sps);
		avcc.push(1); // 1 PPS
		avcc.extend_from_slice(&(pps.len() as u16).to_be_bytes());
		avcc.extend_from_slice(&pps);

		let sets = avcc_param_sets(&avcc);
		assert_eq!(sets.len(), 2);
		assert_eq!(&sets[0][..], &sps[..]);
		assert_eq!(&sets[1][..], &pps[..]);
	}
}
