use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use tvarr_codec::{
	classify, extract_adts_frames, is_random_access_point, reorder_access_unit, split_annex_b, AudioCodec, NalKind,
	Ticks, VideoCodec,
};

use crate::demux::{OnAudio, OnVideo, OutputDemuxer};
use crate::error::DemuxError;

const TS_PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;

/// Hand-rolled PAT/PMT/PES MPEG-TS demuxer, symmetric to
/// [`crate::mux::MpegTsMux`]. Drives a buffered reader that blocks until
/// PAT/PMT is seen (i.e. emits nothing for any other PID until both have
/// been parsed), then binds per-PID PES reassembly for the video and audio
/// elementary streams it discovers.
pub struct MpegTsDemux<'a> {
	video_codec: VideoCodec,
	audio_codec: AudioCodec,
	is_hevc: bool,
	on_video: Box<OnVideo<'a>>,
	on_audio: Box<OnAudio<'a>>,
	buf: BytesMut,
	pmt_pid: Option<u16>,
	video_pid: Option<u16>,
	audio_pid: Option<u16>,
	pes_buf: HashMap<u16, BytesMut>,
	param_sets: Vec<Bytes>,
}

impl<'a> MpegTsDemux<'a> {
	pub fn new(video_codec: VideoCodec, audio_codec: AudioCodec, on_video: Box<OnVideo<'a>>, on_audio: Box<OnAudio<'a>>) -> Self {
		Self {
			video_codec,
			audio_codec,
			is_hevc: matches!(video_codec, VideoCodec::H265),
			on_video,
			on_audio,
			buf: BytesMut::new(),
			pmt_pid: None,
			video_pid: None,
			audio_pid: None,
			pes_buf: HashMap::new(),
			param_sets: Vec::new(),
		}
	}

	fn handle_pat(&mut self, payload: &[u8]) {
		let Some(section) = psi_section(payload) else { return };
		// table_id(1) + section_length(2) + transport_stream_id(2) + version/current_next(1)
		// + section_number(1) + last_section_number(1) = 8 bytes before the program loop.
		if section.len() < 8 {
			return;
		}
		let mut pos = 8;
		while pos + 4 <= section.len().saturating_sub(4) {
			let program_number = u16::from_be_bytes([section[pos], section[pos + 1]]);
			let pid = u16::from_be_bytes([section[pos + 2], section[pos + 3]]) & 0x1FFF;
			pos += 4;
			if program_number != 0 {
				self.pmt_pid = Some(pid);
				return;
			}
		}
	}

	fn handle_pmt(&mut self, payload: &[u8]) {
		let Some(section) = psi_section(payload) else { return };
		if section.len() < 12 {
			return;
		}
		let program_info_length = (u16::from_be_bytes([section[10], section[11]]) & 0x0FFF) as usize;
		let mut pos = 12 + program_info_length;

		// Section ends 4 bytes before the end (CRC32).
		while pos + 5 <= section.len().saturating_sub(4) {
			let stream_type = section[pos];
			let pid = u16::from_be_bytes([section[pos + 1], section[pos + 2]]) & 0x1FFF;
			let es_info_length = (u16::from_be_bytes([section[pos + 3], section[pos + 4]]) & 0x0FFF) as usize;
			pos += 5 + es_info_length;

			match stream_type {
				0x1B | 0x24 => self.video_pid = Some(pid),
				0x0F | 0x81 | 0x87 | 0x03 => self.audio_pid = Some(pid),
				// Opus/generic private data streams: only claim the PID if we're
				// actually expecting a codec with no well-known stream_type.
				0x06 if matches!(self.audio_codec, AudioCodec::Opus | AudioCodec::Copy) => self.audio_pid = Some(pid),
				_ => {}
			}
		}
	}

	fn finish_pes(&mut self, pid: u16) -> Result<(), DemuxError> {
		let Some(data) = self.pes_buf.remove(&pid) else {
			return Ok(());
		};
		if data.is_empty() {
			return Ok(());
		}
		self.emit_pes(pid, data.freeze())
	}

	fn emit_pes(&mut self, pid: u16, data: Bytes) -> Result<(), DemuxError> {
		let Some(pes) = parse_pes(&data) else {
			return Err(DemuxError::MalformedPacket("truncated PES header"));
		};

		if Some(pid) == self.video_pid {
			self.emit_video(pes.pts, pes.dts.unwrap_or(pes.pts), pes.payload);
		} else if Some(pid) == self.audio_pid {
			self.emit_audio(pes.pts, pes.payload);
		}
		Ok(())
	}

	fn emit_video(&mut self, pts: Ticks, dts: Ticks, payload: &[u8]) {
		let mut nalus = split_annex_b(payload);
		for nal in &nalus {
			if classify(nal, self.is_hevc) == NalKind::ParameterSet {
				self.param_sets.push(nal.clone());
			}
		}

		let keyframe = is_random_access_point(&nalus, self.is_hevc);
		if keyframe {
			let has_param_set = nalus.iter().any(|nal| classify(nal, self.is_hevc) == NalKind::ParameterSet);
			if !has_param_set && !self.param_sets.is_empty() {
				let mut with_params = self.param_sets.clone();
				with_params.append(&mut nalus);
				nalus = with_params;
			}
		}

		let nalus = reorder_access_unit(nalus, self.is_hevc);
		let mut out = BytesMut::new();
		for nal in &nalus {
			out.extend_from_slice(&[0x00, 0x00, 0x01]);
			out.extend_from_slice(nal);
		}

		(self.on_video)(pts, dts, &out, keyframe);
	}

	fn emit_audio(&mut self, pts: Ticks, payload: &[u8]) {
		if !matches!(self.audio_codec, AudioCodec::Aac) {
			(self.on_audio)(pts, payload);
			return;
		}

		let sample_rate = adts_sample_rate(payload).unwrap_or(48_000);
		let frames = extract_adts_frames(payload);
		let frame_samples = self.audio_codec.constant_frame_samples().unwrap_or(1024);

		let mut frame_pts = pts;
		for frame in &frames {
			(self.on_audio)(frame_pts, frame);
			// See DESIGN.md's Opus open question: this constant-duration advance
			// is correct for AAC but is reused here only for AAC ADTS framing.
			if let Ok(duration) = Ticks::from_samples(frame_samples, sample_rate) {
				frame_pts += duration;
			}
		}
	}
}

impl OutputDemuxer for MpegTsDemux<'_> {
	fn write(&mut self, data: &[u8]) -> Result<(), DemuxError> {
		self.buf.extend_from_slice(data);

		loop {
			while !self.buf.is_empty() && self.buf[0] != SYNC_BYTE {
				self.buf.advance(1);
			}
			if self.buf.len() < TS_PACKET_LEN {
				break;
			}

			let packet = self.buf.split_to(TS_PACKET_LEN).freeze();
			self.handle_packet(&packet)?;
		}

		Ok(())
	}

	fn close(&mut self) -> Result<(), DemuxError> {
		if let Some(pid) = self.video_pid {
			self.finish_pes(pid)?;
		}
		if let Some(pid) = self.audio_pid {
			self.finish_pes(pid)?;
		}
		Ok(())
	}
}

impl MpegTsDemux<'_> {
	fn handle_packet(&mut self, packet: &[u8]) -> Result<(), DemuxError> {
		if packet.len() != TS_PACKET_LEN {
			return Err(DemuxError::MalformedPacket("short TS packet"));
		}

		let unit_start = packet[1] & 0x40 != 0;
		let pid = u16::from_be_bytes([packet[1], packet[2]]) & 0x1FFF;
		let adaptation_control = (packet[3] >> 4) & 0x3;

		let mut offset = 4;
		if adaptation_control == 0b10 || adaptation_control == 0b11 {
			let adaptation_len = *packet.get(offset).unwrap_or(&0) as usize;
			offset += 1 + adaptation_len;
		}
		if adaptation_control == 0b10 || offset > packet.len() {
			// Adaptation-field-only packet: no payload to extract.
			return Ok(());
		}

		let mut payload = &packet[offset..];
		if unit_start && !payload.is_empty() {
			// PSI payloads carry a pointer_field before the section starts.
			if pid == PAT_PID || Some(pid) == self.pmt_pid {
				let pointer = payload[0] as usize;
				if pointer + 1 <= payload.len() {
					payload = &payload[1 + pointer..];
				}
			}
		}

		if pid == PAT_PID {
			self.handle_pat(payload);
			return Ok(());
		}
		if Some(pid) == self.pmt_pid {
			self.handle_pmt(payload);
			return Ok(());
		}

		if Some(pid) == self.video_pid || Some(pid) == self.audio_pid {
			if unit_start {
				self.finish_pes(pid)?;
				self.pes_buf.entry(pid).or_default().extend_from_slice(payload);
			} else if let Some(buf) = self.pes_buf.get_mut(&pid) {
				buf.extend_from_slice(payload);
			}
		}

		Ok(())
	}
}

struct Pes<'a> {
	pts: Ticks,
	dts: Option<Ticks>,
	payload: &'a [u8],
}

/// Parse a PES packet header (start code + stream id + optional PTS/DTS),
/// mirroring `build_pes`/`write_timestamp` in the muxer in reverse.
fn parse_pes(data: &[u8]) -> Option<Pes<'_>> {
	if data.len() < 9 || data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
		return None;
	}

	let pts_dts_flags = (data[7] >> 6) & 0x3;
	let header_data_len = data[8] as usize;
	let mut pos = 9;

	let pts = if pts_dts_flags & 0b10 != 0 {
		let ts = read_timestamp(data.get(pos..pos + 5)?)?;
		pos += 5;
		Ticks::new(ts)
	} else {
		Ticks::ZERO
	};

	let dts = if pts_dts_flags == 0b11 {
		let ts = read_timestamp(data.get(pos..pos + 5)?)?;
		pos += 5;
		Some(Ticks::new(ts))
	} else {
		None
	};

	let payload_start = 9 + header_data_len;
	let payload = data.get(payload_start..)?;
	let _ = pos;

	Some(Pes { pts, dts, payload })
}

fn read_timestamp(bytes: &[u8]) -> Option<i64> {
	if bytes.len() != 5 {
		return None;
	}
	let value = (((bytes[0] >> 1) & 0x07) as i64) << 30
		| (bytes[1] as i64) << 22
		| (((bytes[2] >> 1) & 0x7F) as i64) << 15
		| (bytes[3] as i64) << 7
		| (((bytes[4] >> 1) & 0x7F) as i64);
	Some(value)
}

/// Strip the `pointer_field` already handled by the caller and return the
/// PSI section (table through CRC), given the packet payload starting at
/// the section.
fn psi_section(payload: &[u8]) -> Option<&[u8]> {
	if payload.len() < 3 {
		return None;
	}
	let section_length = (u16::from_be_bytes([payload[1], payload[2]]) & 0x0FFF) as usize;
	payload.get(..3 + section_length)
}

/// Sampling-frequency-index lookup from an ADTS header's byte 2, used to
/// derive constant per-frame PTS advancement for AAC batches.
fn adts_sample_rate(data: &[u8]) -> Option<u32> {
	const RATES: [u32; 13] = [
		96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
	];
	let byte2 = *data.get(2)?;
	let index = (byte2 >> 2) & 0x0F;
	RATES.get(index as usize).copied()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn psi_section_respects_length() {
		let mut payload = vec![0x00, 0xB0, 0x03];
		payload.extend_from_slice(&[1, 2, 3]);
		payload.push(0xFF); // trailing junk past the declared section length
		let section = psi_section(&payload).unwrap();
		assert_eq!(section.len(), 6);
	}

	#[test]
	fn timestamp_round_trips() {
		// Build the same bit layout write_timestamp in the muxer produces.
		let value: u64 = 123_456_789 & 0x1_FFFF_FFFF;
		let b0 = (0b0010u8 << 4) | (((value >> 30) & 0x7) as u8) << 1 | 1;
		let b1 = ((value >> 22) & 0xFF) as u8;
		let b2 = (((value >> 15) & 0x7F) as u8) << 1 | 1;
		let b3 = ((value >> 7) & 0xFF) as u8;
		let b4 = (((value & 0x7F) as u8) << 1) | 1;
		let parsed = read_timestamp(&[b0, b1, b2, b3, b4]).unwrap();
		assert_eq!(parsed as u64, value);
	}

	#[test]
	fn adts_sample_rate_known_index() {
		// sampling_freq_index = 3 -> 48000
		assert_eq!(adts_sample_rate(&[0xFF, 0xF1, 0x0C]), Some(48_000));
	}
}
