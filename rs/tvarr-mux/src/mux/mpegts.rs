use bytes::{BufMut, Bytes, BytesMut};
use tvarr_codec::{build_adts_frame, is_adts_framed, nalu_type, parse_aac_asc, reorder_access_unit, split_annex_b, AacConfig, AudioCodec, Ticks, VideoCodec};

use crate::error::MuxError;
use crate::mux::InputMuxer;

const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const TS_PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Hand-rolled PAT/PMT/PES MPEG-TS muxer for H.264/H.265 sources, since no
/// TS-muxing crate exists in the dependency graph and the format is small
/// enough to author directly.
pub struct MpegTsMux {
	video_codec: VideoCodec,
	audio_codec: AudioCodec,
	is_hevc: bool,
	continuity: [u8; 3], // pat, pmt, video indexed by helper; audio tracked separately
	audio_continuity: u8,
	param_sets: Vec<Bytes>,
	pat_pmt_sent: bool,
	buf: BytesMut,
	aac_config: AacConfig,
}

impl MpegTsMux {
	pub fn new(video_codec: VideoCodec, audio_codec: AudioCodec) -> Self {
		Self {
			video_codec,
			audio_codec,
			is_hevc: matches!(video_codec, VideoCodec::H265),
			continuity: [0; 3],
			audio_continuity: 0,
			param_sets: Vec::new(),
			pat_pmt_sent: false,
			buf: BytesMut::new(),
			aac_config: AacConfig::default(),
		}
	}

	/// Parse `TranscodeConfig::audio_init_bytes` (AAC `AudioSpecificConfig`)
	/// to get the real sample rate/channel count/object type this source
	/// uses; an unparseable or absent config keeps the 48kHz stereo AAC-LC
	/// default .
	pub fn set_audio_init(&mut self, audio_init: &[u8]) {
		if self.audio_codec == AudioCodec::Aac {
			if let Some(config) = parse_aac_asc(audio_init) {
				self.aac_config = config;
			}
		}
	}

	fn video_stream_type(&self) -> u8 {
		match self.video_codec {
			VideoCodec::H264 => 0x1B,
			VideoCodec::H265 => 0x24,
			// fMP4-only codecs never reach this muxer; default defensively.
			VideoCodec::Av1 | VideoCodec::Vp9 => 0x06,
		}
	}

	fn audio_stream_type(&self) -> u8 {
		match self.audio_codec {
			AudioCodec::Aac => 0x0F,
			AudioCodec::Ac3 => 0x81,
			AudioCodec::Eac3 => 0x87,
			AudioCodec::Mp3 => 0x03,
			AudioCodec::Opus | AudioCodec::Copy => 0x06,
		}
	}

	fn write_pat_pmt(&mut self) {
		let mut pat = BytesMut::new();
		pat.put_u8(0x00); // table_id
		let pat_body = {
			let mut b = BytesMut::new();
			b.put_u16(1); // transport_stream_id
			b.put_u8(0xC1); // version 0, current_next=1
			b.put_u8(0); // section_number
			b.put_u8(0); // last_section_number
			b.put_u16(1); // program_number
			b.put_u16(0xE000 | PMT_PID);
			b
		};
		let section_len = pat_body.len() + 4; // + crc placeholder
		pat.put_u16(0xB000 | section_len as u16);
		pat.extend_from_slice(&pat_body);
		pat.put_u32(crc32_mpeg2(&pat[..]));
		psi_to_ts(PAT_PID, &pat, &mut self.continuity[0], &mut self.buf);

		let mut pmt = BytesMut::new();
		pmt.put_u8(0x02); // table_id
		let pmt_body = {
			let mut b = BytesMut::new();
			b.put_u16(1); // program_number
			b.put_u8(0xC1);
			b.put_u8(0);
			b.put_u8(0);
			b.put_u16(0xE000 | VIDEO_PID); // PCR_PID
			b.put_u16(0xF000); // program_info_length = 0
			b.put_u8(self.video_stream_type());
			b.put_u16(0xE000 | VIDEO_PID);
			b.put_u16(0xF000);
			b.put_u8(self.audio_stream_type());
			b.put_u16(0xE000 | AUDIO_PID);
			b.put_u16(0xF000);
			b
		};
		let section_len = pmt_body.len() + 4;
		pmt.put_u16(0xB000 | section_len as u16);
		pmt.extend_from_slice(&pmt_body);
		pmt.put_u32(crc32_mpeg2(&pmt[..]));
		psi_to_ts(PMT_PID, &pmt, &mut self.continuity[1], &mut self.buf);

		self.pat_pmt_sent = true;
	}

	fn update_param_sets(&mut self, nalus: &[Bytes]) {
		for nal in nalus {
			if let Ok(ty) = nalu_type(nal, self.is_hevc) {
				if classify_is_param_set(ty, self.is_hevc) {
					self.param_sets.push(nal.clone());
				}
			}
		}
	}

	fn has_param_sets(&self, nalus: &[Bytes]) -> bool {
		nalus.iter().any(|nal| {
			nalu_type(nal, self.is_hevc)
				.map(|ty| classify_is_param_set(ty, self.is_hevc))
				.unwrap_or(false)
		})
	}
}

fn classify_is_param_set(nal_type: u8, is_hevc: bool) -> bool {
	if is_hevc {
		matches!(nal_type, 32..=34) // VPS, SPS, PPS
	} else {
		matches!(nal_type, 7 | 8) // SPS, PPS
	}
}

impl InputMuxer for MpegTsMux {
	fn write_video(&mut self, pts: Ticks, dts: Ticks, data: &[u8], is_keyframe: bool) -> Result<(), MuxError> {
		if !self.pat_pmt_sent {
			self.write_pat_pmt();
		}

		let mut nalus = split_annex_b(data);
		self.update_param_sets(&nalus);

		if is_keyframe && !self.has_param_sets(&nalus) && !self.param_sets.is_empty() {
			let mut with_params = self.param_sets.clone();
			with_params.append(&mut nalus);
			nalus = with_params;
		}

		let nalus = reorder_access_unit(nalus, self.is_hevc);

		let mut au = BytesMut::new();
		for nal in &nalus {
			au.put_u8(0x00);
			au.put_u8(0x00);
			au.put_u8(0x01);
			au.extend_from_slice(nal);
		}

		let pes = build_pes(0xE0, au.freeze(), pts, Some(dts));
		video_to_ts(VIDEO_PID, &pes, is_keyframe, &mut self.continuity[2], &mut self.buf);
		Ok(())
	}

	fn write_audio(&mut self, pts: Ticks, data: &[u8]) -> Result<(), MuxError> {
		if !self.pat_pmt_sent {
			self.write_pat_pmt();
		}

		// ADTS-framed audio passes through unchanged; raw AAC frames
		// get an ADTS header built from the parsed AudioSpecificConfig (or
		// the 48kHz stereo default) so the TS elementary stream is valid AAC.
		let payload = if self.audio_codec == AudioCodec::Aac && !is_adts_framed(data) {
			build_adts_frame(self.aac_config, data)
		} else {
			Bytes::copy_from_slice(data)
		};

		let pes = build_pes(0xC0, payload, pts, None);
		video_to_ts(AUDIO_PID, &pes, true, &mut self.audio_continuity, &mut self.buf);
		Ok(())
	}

	fn flush(&mut self) -> Result<Bytes, MuxError> {
		Ok(self.buf.split().freeze())
	}

	fn initialize_and_get_header(&mut self) -> Result<Bytes, MuxError> {
		// PAT/PMT are interleaved with media rather than emitted as a
		// separate header; nothing needs to precede the first flush.
		Ok(Bytes::new())
	}

	fn format(&self) -> &'static str {
		"mpegts"
	}
}

/// Build a PES packet (header + payload) for one access unit / audio frame.
fn build_pes(stream_id: u8, payload: Bytes, pts: Ticks, dts: Option<Ticks>) -> Bytes {
	let mut out = BytesMut::new();
	out.put_u8(0x00);
	out.put_u8(0x00);
	out.put_u8(0x01);
	out.put_u8(stream_id);

	let pts_dts_flags: u8 = if dts.is_some() { 0b11 } else { 0b10 };
	let header_data_len = if dts.is_some() { 10 } else { 5 };
	let packet_len = payload.len() + 3 + header_data_len;
	out.put_u16(if packet_len <= 0xFFFF { packet_len as u16 } else { 0 });

	out.put_u8(0x80); // '10' marker, no scrambling/priority flags
	out.put_u8(pts_dts_flags << 6);
	out.put_u8(header_data_len as u8);

	write_timestamp(&mut out, if dts.is_some() { 0b0011 } else { 0b0010 }, pts);
	if let Some(dts) = dts {
		write_timestamp(&mut out, 0b0001, dts);
	}

	out.extend_from_slice(&payload);
	out.freeze()
}

fn write_timestamp(out: &mut BytesMut, marker: u8, ticks: Ticks) {
	let value = (ticks.as_ticks() as u64) & 0x1_FFFF_FFFF;
	let b0 = (marker << 4) | (((value >> 30) & 0x7) as u8) << 1 | 1;
	let b1 = ((value >> 22) & 0xFF) as u8;
	let b2 = (((value >> 15) & 0x7F) as u8) << 1 | 1;
	let b3 = ((value >> 7) & 0xFF) as u8;
	let b4 = (((value & 0x7F) as u8) << 1) | 1;
	out.put_u8(b0);
	out.put_u8(b1);
	out.put_u8(b2);
	out.put_u8(b3);
	out.put_u8(b4);
}

/// Split a PSI section (PAT/PMT) into 188-byte TS packets, pointer-field
/// prefixed on the first packet.
fn psi_to_ts(pid: u16, section: &[u8], continuity: &mut u8, out: &mut BytesMut) {
	let mut payload = BytesMut::new();
	payload.put_u8(0x00); // pointer_field
	payload.extend_from_slice(section);
	to_ts_packets(pid, &payload, true, continuity, out);
}

/// Split a PES packet into 188-byte TS packets with payload_unit_start set
/// only on the packet carrying the PES header.
fn video_to_ts(pid: u16, pes: &[u8], _keyframe: bool, continuity: &mut u8, out: &mut BytesMut) {
	to_ts_packets(pid, pes, true, continuity, out);
}

fn to_ts_packets(pid: u16, payload: &[u8], unit_start: bool, continuity: &mut u8, out: &mut BytesMut) {
	let mut offset = 0;
	let mut first = true;

	while offset < payload.len() || first {
		let remaining = payload.len() - offset;
		let mut header = [0u8; 4];
		header[0] = SYNC_BYTE;
		header[1] = (if first && unit_start { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F);
		header[2] = (pid & 0xFF) as u8;

		let available = TS_PACKET_LEN - 4;
		let (adaptation_len, payload_len) = if remaining >= available {
			(0, available)
		} else {
			(available - remaining, remaining)
		};

		if adaptation_len == 0 {
			header[3] = 0x10 | (*continuity & 0x0F); // payload only
			out.extend_from_slice(&header);
		} else {
			header[3] = 0x30 | (*continuity & 0x0F); // adaptation + payload
			out.extend_from_slice(&header);
			let stuffing = adaptation_len - 1;
			out.put_u8(stuffing as u8);
			if stuffing > 0 {
				out.put_u8(0x00); // no flags set
				for _ in 0..(stuffing - 1) {
					out.put_u8(0xFF);
				}
			}
		}

		out.extend_from_slice(&payload[offset..offset + payload_len]);
		offset += payload_len;
		*continuity = continuity.wrapping_add(1) & 0x0F;
		first = false;
	}
}

/// CRC-32/MPEG-2 over a PSI section (table_id through the last data byte,
/// excluding the CRC field itself).
fn crc32_mpeg2(data: &[u8]) -> u32 {
	let mut crc: u32 = 0xFFFF_FFFF;
	for &byte in data {
		crc ^= (byte as u32) << 24;
		for _ in 0..8 {
			crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04C1_1DB7 } else { crc << 1 };
		}
	}
	crc
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ts_packets_are_188_bytes() {
		let mut out = BytesMut::new();
		let mut cc = 0u8;
		to_ts_packets(VIDEO_PID, &[0xAB; 500], true, &mut cc, &mut out);
		assert_eq!(out.len() % TS_PACKET_LEN, 0);
		for chunk in out.chunks(TS_PACKET_LEN) {
			assert_eq!(chunk[0], SYNC_BYTE);
		}
	}

	#[test]
	fn pat_pmt_written_once() {
		let mut mux = MpegTsMux::new(VideoCodec::H264, AudioCodec::Aac);
		mux.write_pat_pmt();
		assert!(mux.pat_pmt_sent);
		let out = mux.flush().unwrap();
		assert!(!out.is_empty());
		assert_eq!(out[0], SYNC_BYTE);
	}

	#[test]
	fn keyframe_gets_param_sets_prepended() {
		let mut mux = MpegTsMux::new(VideoCodec::H264, AudioCodec::Aac);
		let sps = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];
		let idr = [0x00, 0x00, 0x00, 0x01, 0x65, 0xAA, 0xBB];
		mux.write_video(Ticks::ZERO, Ticks::ZERO, &sps, false).unwrap();
		assert_eq!(mux.param_sets.len(), 1);

		mux.write_video(Ticks::new(3000), Ticks::new(3000), &idr, true).unwrap();
		// param set was already carried in the access unit, so no duplicate push.
		assert_eq!(mux.param_sets.len(), 1);
	}

	#[test]
	fn raw_aac_gets_adts_framed_using_parsed_asc() {
		let mut mux = MpegTsMux::new(VideoCodec::H264, AudioCodec::Aac);
		// object_type=2, freq_index=3 (48000), channel_config=2 (stereo)
		mux.set_audio_init(&[0x11, 0x90]);
		assert_eq!(mux.aac_config.sample_rate, 48_000);
		assert_eq!(mux.aac_config.channels, 2);

		mux.write_audio(Ticks::ZERO, &[0xAA, 0xBB, 0xCC]).unwrap();
		let out = mux.flush().unwrap();
		assert!(!out.is_empty());
	}

	#[test]
	fn already_adts_framed_aac_passes_through() {
		let mut mux = MpegTsMux::new(VideoCodec::H264, AudioCodec::Aac);
		let framed = tvarr_codec::build_adts_frame(AacConfig::default(), &[1, 2, 3]);
		mux.write_audio(Ticks::ZERO, &framed).unwrap();
		let out = mux.flush().unwrap();
		assert!(!out.is_empty());
	}
}
