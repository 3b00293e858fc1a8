use bytes::{BufMut, Bytes, BytesMut};
use mp4_atom::{Encode, Mfhd, Moof, Tfdt, Tfhd, Traf, Trun, TrunEntry};
use tvarr_codec::{av1_obus, is_vp9_keyframe, parse_aac_asc, sequence_header, vp9_frame_size, AudioCodec, ObuType, SequenceHeader, Ticks, VideoCodec};

use crate::error::MuxError;
use crate::mux::InputMuxer;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
const VIDEO_TIMESCALE: u32 = tvarr_codec::TICKS_PER_SECOND as u32;
const DEFAULT_VIDEO_DURATION: u32 = 3000; // ~33ms at 90kHz

struct PendingVideo {
	pts: Ticks,
	dts: Ticks,
	keyframe: bool,
	data: Bytes,
}

struct PendingAudio {
	pts: Ticks,
	data: Bytes,
}

/// fMP4 (CMAF) muxer for VP9/AV1 sources, which MPEG-TS cannot carry. Cannot
/// emit an init segment until a keyframe carrying codec init data is seen;
/// writes before that point are buffered. Fragment (moof+mdat) construction
/// reuses `mp4-atom`'s fragment box types directly; the init segment
/// (ftyp+moov, including vp9C/av1C sample entries) is hand-encoded since
/// `mp4-atom` has no box type for either.
pub struct Fmp4Mux {
	video_codec: VideoCodec,
	audio_codec: AudioCodec,
	initialized: bool,
	width: u32,
	height: u32,
	sample_rate: u32,
	channels: u16,
	sequence_number: u32,
	last_video_pts: Option<Ticks>,
	video_duration: u32,
	pending_video: Vec<PendingVideo>,
	pending_audio: Vec<PendingAudio>,
	av1_seq_header: Option<SequenceHeader>,
	av1_seq_header_obu: Bytes,
}

impl Fmp4Mux {
	pub fn new(video_codec: VideoCodec, audio_codec: AudioCodec) -> Self {
		Self {
			video_codec,
			audio_codec,
			initialized: false,
			width: 0,
			height: 0,
			sample_rate: 48_000,
			channels: 2,
			sequence_number: 0,
			last_video_pts: None,
			video_duration: DEFAULT_VIDEO_DURATION,
			pending_video: Vec::new(),
			pending_audio: Vec::new(),
			av1_seq_header: None,
			av1_seq_header_obu: Bytes::new(),
		}
	}

	/// Parse `TranscodeConfig::audio_init_bytes` for AAC sources, same as
	/// `MpegTsMux::set_audio_init`: an unparseable or absent config keeps the
	/// 48kHz stereo default already set in `new`.
	pub fn set_audio_init(&mut self, audio_init: &[u8]) {
		if self.audio_codec == AudioCodec::Aac {
			if let Some(config) = parse_aac_asc(audio_init) {
				self.sample_rate = config.sample_rate;
				self.channels = config.channels;
			}
		}
	}

	/// Whether `data` (a keyframe access unit) carries the init data this
	/// container's video codec needs before a moov can be built.
	fn keyframe_is_init_eligible(&mut self, data: &[u8]) -> bool {
		match self.video_codec {
			VideoCodec::Vp9 => {
				if !is_vp9_keyframe(data) {
					return false;
				}
				if let Ok((w, h)) = vp9_frame_size(data) {
					self.width = w;
					self.height = h;
					true
				} else {
					false
				}
			}
			VideoCodec::Av1 => {
				let obus = av1_obus(data);
				if let Some(header) = sequence_header(&obus) {
					if header.max_frame_width > 0 && header.max_frame_height > 0 {
						self.width = header.max_frame_width;
						self.height = header.max_frame_height;
					}
					if let Some(obu) = obus.iter().find(|obu| obu.obu_type == ObuType::SequenceHeader) {
						self.av1_seq_header_obu = obu.data.clone();
					}
					self.av1_seq_header = Some(header);
					self.width > 0 && self.height > 0
				} else {
					false
				}
			}
			// Only VP9/AV1 sources ever route through this muxer; H.264/H.265
			// use MPEG-TS instead. See `InputMuxerKind::for_codecs`.
			VideoCodec::H264 | VideoCodec::H265 => false,
		}
	}

	fn video_fourcc(&self) -> [u8; 4] {
		match self.video_codec {
			VideoCodec::Vp9 => *b"vp09",
			VideoCodec::Av1 => *b"av01",
			_ => *b"unkn",
		}
	}

	fn audio_fourcc(&self) -> [u8; 4] {
		match self.audio_codec {
			AudioCodec::Opus => *b"Opus",
			_ => *b"mp4a",
		}
	}

	fn build_init_segment(&self) -> Bytes {
		let mut out = BytesMut::new();
		write_box(&mut out, b"ftyp", |b| {
			b.extend_from_slice(b"iso5");
			b.put_u32(0);
			b.extend_from_slice(b"iso5");
			b.extend_from_slice(b"iso6");
			b.extend_from_slice(b"mp41");
		});
		write_box(&mut out, b"moov", |b| self.write_moov(b));
		out.freeze()
	}

	fn write_moov(&self, out: &mut BytesMut) {
		write_box(out, b"mvhd", |b| {
			b.put_u32(0); // version/flags
			b.put_u64(0); // creation/modification time
			b.put_u32(VIDEO_TIMESCALE);
			b.put_u32(0); // duration unknown (fragmented)
			b.put_u32(0x0001_0000); // rate 1.0
			b.put_u16(0x0100); // volume 1.0
			b.put_u16(0);
			b.put_u64(0);
			write_identity_matrix(b);
			for _ in 0..6 {
				b.put_u32(0);
			}
			b.put_u32(3); // next_track_ID
		});

		self.write_video_trak(out);
		self.write_audio_trak(out);

		write_box(out, b"mvex", |b| {
			write_trex(b, VIDEO_TRACK_ID, self.video_duration);
			write_trex(b, AUDIO_TRACK_ID, 0);
		});
	}

	fn write_video_trak(&self, out: &mut BytesMut) {
		write_box(out, b"trak", |b| {
			write_tkhd(b, VIDEO_TRACK_ID, self.width, self.height, false);
			write_box(b, b"mdia", |b| {
				write_mdhd(b, VIDEO_TIMESCALE);
				write_hdlr(b, b"vide", b"VideoHandler\0");
				write_box(b, b"minf", |b| {
					write_box(b, b"vmhd", |b| {
						b.put_u32(1);
						b.put_u16(0);
						b.put_u64(0);
					});
					write_dinf(b);
					write_box(b, b"stbl", |b| {
						write_box(b, b"stsd", |b| {
							b.put_u32(0);
							b.put_u32(1);
							self.write_video_sample_entry(b);
						});
						write_empty_sample_tables(b);
					});
				});
			});
		});
	}

	fn write_audio_trak(&self, out: &mut BytesMut) {
		write_box(out, b"trak", |b| {
			write_tkhd(b, AUDIO_TRACK_ID, 0, 0, true);
			write_box(b, b"mdia", |b| {
				write_mdhd(b, self.sample_rate);
				write_hdlr(b, b"soun", b"SoundHandler\0");
				write_box(b, b"minf", |b| {
					write_box(b, b"smhd", |b| {
						b.put_u32(0);
						b.put_u16(0);
						b.put_u16(0);
					});
					write_dinf(b);
					write_box(b, b"stbl", |b| {
						write_box(b, b"stsd", |b| {
							b.put_u32(0);
							b.put_u32(1);
							self.write_audio_sample_entry(b);
						});
						write_empty_sample_tables(b);
					});
				});
			});
		});
	}

	fn write_video_sample_entry(&self, out: &mut BytesMut) {
		let fourcc = self.video_fourcc();
		write_box(out, &fourcc, |b| {
			b.put_u48(0); // reserved
			b.put_u16(1); // data_reference_index
			b.put_u16(0); // pre_defined
			b.put_u16(0); // reserved
			for _ in 0..3 {
				b.put_u32(0); // pre_defined
			}
			b.put_u16(self.width as u16);
			b.put_u16(self.height as u16);
			b.put_u32(0x0048_0000); // horizresolution 72dpi
			b.put_u32(0x0048_0000); // vertresolution 72dpi
			b.put_u32(0); // reserved
			b.put_u16(1); // frame_count
			b.put_bytes(0, 32); // compressorname
			b.put_u16(0x0018); // depth
			b.put_i16(-1); // pre_defined

			match self.video_codec {
				VideoCodec::Vp9 => write_box(b, b"vpcC", write_vpcc),
				VideoCodec::Av1 => write_box(b, b"av1C", |b| write_av1c(b, self.av1_seq_header.as_ref(), &self.av1_seq_header_obu)),
				_ => {}
			}
		});
	}

	fn write_audio_sample_entry(&self, out: &mut BytesMut) {
		let fourcc = self.audio_fourcc();
		write_box(out, &fourcc, |b| {
			b.put_u64(0); // reserved
			b.put_u16(self.channels);
			b.put_u16(16); // samplesize
			b.put_u16(0); // pre_defined
			b.put_u16(0); // reserved
			b.put_u32((self.sample_rate as u32) << 16);

			match self.audio_codec {
				AudioCodec::Opus => write_box(b, b"dOps", |b| write_dops(b, self.sample_rate, self.channels)),
				_ => write_box(b, b"esds", |b| write_esds(b, self.sample_rate, self.channels)),
			}
		});
	}

	fn build_fragment(&mut self) -> Bytes {
		let mut mdat_data = BytesMut::new();
		let mut traf_entries = Vec::new();

		if !self.pending_video.is_empty() {
			let mut entries = Vec::new();
			let base_pts = self.pending_video[0].pts;

			for sample in &self.pending_video {
				let duration = match self.last_video_pts {
					Some(prev) => {
						let delta = (sample.pts.as_ticks() - prev.as_ticks()).max(1) as u32;
						self.video_duration = delta;
						delta
					}
					None => self.video_duration,
				};
				self.last_video_pts = Some(sample.pts);

				let cts = (sample.pts.as_ticks() - sample.dts.as_ticks()) as i32;
				entries.push(TrunEntry {
					duration: Some(duration),
					size: Some(sample.data.len() as u32),
					flags: Some(if sample.keyframe { 0x0200_0000 } else { 0x0101_0000 }),
					cts: Some(cts),
				});
				mdat_data.extend_from_slice(&sample.data);
			}

			traf_entries.push((VIDEO_TRACK_ID, base_pts, entries));
		}

		if !self.pending_audio.is_empty() {
			let mut entries = Vec::new();
			let base_pts = self.pending_audio[0].pts;

			for sample in &self.pending_audio {
				entries.push(TrunEntry {
					duration: Some(0),
					size: Some(sample.data.len() as u32),
					flags: Some(0x0200_0000),
					cts: Some(0),
				});
				mdat_data.extend_from_slice(&sample.data);
			}

			traf_entries.push((AUDIO_TRACK_ID, base_pts, entries));
		}

		self.pending_video.clear();
		self.pending_audio.clear();
		self.sequence_number += 1;

		let mut trafs = Vec::new();
		for (track_id, base_pts, entries) in &traf_entries {
			trafs.push(Traf {
				tfhd: Tfhd {
					track_id: *track_id,
					base_data_offset: None,
					sample_description_index: Some(1),
					default_sample_duration: None,
					default_sample_size: None,
					default_sample_flags: None,
				},
				tfdt: Some(Tfdt {
					base_media_decode_time: base_pts.as_ticks().max(0) as u64,
				}),
				trun: vec![Trun {
					data_offset: Some(0), // patched below
					entries: entries.clone(),
				}],
				..Default::default()
			});
		}

		let moof = Moof {
			mfhd: Mfhd {
				sequence_number: self.sequence_number,
			},
			traf: trafs,
		};

		let mut moof_bytes = BytesMut::new();
		moof.encode(&mut moof_bytes).expect("moof encode");
		let moof_size = moof_bytes.len();

		// Patch every trun's data_offset now that the moof's own size is
		// known: samples start right after moof+mdat header, all tracks
		// interleaved in mdat in traf order (single combined mdat).
		let mut moof = moof;
		let mut running = moof_size as i32 + 8;
		for traf in &mut moof.traf {
			for trun in &mut traf.trun {
				trun.data_offset = Some(running);
				let size: u32 = trun.entries.iter().filter_map(|e| e.size).sum();
				running += size as i32;
			}
		}
		let mut moof_bytes = BytesMut::new();
		moof.encode(&mut moof_bytes).expect("moof encode");

		let mut out = BytesMut::new();
		out.extend_from_slice(&moof_bytes);
		out.put_u32(8 + mdat_data.len() as u32);
		out.extend_from_slice(b"mdat");
		out.extend_from_slice(&mdat_data);
		out.freeze()
	}
}

impl InputMuxer for Fmp4Mux {
	fn write_video(&mut self, pts: Ticks, dts: Ticks, data: &[u8], is_keyframe: bool) -> Result<(), MuxError> {
		if !self.initialized && is_keyframe {
			self.keyframe_is_init_eligible(data);
		}
		self.pending_video.push(PendingVideo {
			pts,
			dts,
			keyframe: is_keyframe,
			data: Bytes::copy_from_slice(data),
		});
		Ok(())
	}

	fn write_audio(&mut self, pts: Ticks, data: &[u8]) -> Result<(), MuxError> {
		self.pending_audio.push(PendingAudio {
			pts,
			data: Bytes::copy_from_slice(data),
		});
		Ok(())
	}

	fn flush(&mut self) -> Result<Bytes, MuxError> {
		if !self.initialized {
			let ready = self
				.pending_video
				.iter()
				.find(|s| s.keyframe)
				.map(|s| s.data.clone())
				.map(|data| self.keyframe_is_init_eligible(&data))
				.unwrap_or(false);

			if !ready {
				return Ok(Bytes::new());
			}

			let mut out = BytesMut::new();
			out.extend_from_slice(&self.build_init_segment());
			out.extend_from_slice(&self.build_fragment());
			self.initialized = true;
			return Ok(out.freeze());
		}

		if self.pending_video.is_empty() && self.pending_audio.is_empty() {
			return Ok(Bytes::new());
		}

		Ok(self.build_fragment())
	}

	fn initialize_and_get_header(&mut self) -> Result<Bytes, MuxError> {
		// The init segment can't be produced until a qualifying keyframe has
		// been written, so it rides along with the first `flush()` instead
		// of being available up front.
		Ok(Bytes::new())
	}

	fn format(&self) -> &'static str {
		"mp4"
	}
}

fn write_box(out: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
	let mut b = BytesMut::new();
	body(&mut b);
	out.put_u32(8 + b.len() as u32);
	out.extend_from_slice(fourcc);
	out.extend_from_slice(&b);
}

fn write_identity_matrix(out: &mut BytesMut) {
	const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];
	for v in MATRIX {
		out.put_u32(v);
	}
}

fn write_tkhd(out: &mut BytesMut, track_id: u32, width: u32, height: u32, audio: bool) {
	write_box(out, b"tkhd", |b| {
		b.put_u32(0x0000_0007); // version 0, flags: enabled|in_movie|in_preview
		b.put_u64(0);
		b.put_u32(track_id);
		b.put_u32(0);
		b.put_u64(0);
		b.put_u16(0); // layer
		b.put_u16(0); // alternate_group
		b.put_u16(if audio { 0x0100 } else { 0 }); // volume
		b.put_u16(0);
		write_identity_matrix(b);
		b.put_u32(width << 16);
		b.put_u32(height << 16);
	});
}

fn write_mdhd(out: &mut BytesMut, timescale: u32) {
	write_box(out, b"mdhd", |b| {
		b.put_u32(0);
		b.put_u64(0);
		b.put_u32(timescale);
		b.put_u32(0); // duration unknown
		b.put_u16(0x55C4); // language "und"
		b.put_u16(0);
	});
}

fn write_hdlr(out: &mut BytesMut, handler_type: &[u8; 4], name: &[u8]) {
	write_box(out, b"hdlr", |b| {
		b.put_u32(0);
		b.put_u32(0); // pre_defined
		b.extend_from_slice(handler_type);
		b.put_u32(0);
		b.put_u32(0);
		b.put_u32(0);
		b.extend_from_slice(name);
	});
}

fn write_dinf(out: &mut BytesMut) {
	write_box(out, b"dinf", |b| {
		write_box(b, b"dref", |b| {
			b.put_u32(0);
			b.put_u32(1);
			write_box(b, b"url ", |b| {
				b.put_u32(1); // flags: self-contained
			});
		});
	});
}

fn write_empty_sample_tables(out: &mut BytesMut) {
	write_box(out, b"stts", |b| {
		b.put_u32(0);
		b.put_u32(0);
	});
	write_box(out, b"stsc", |b| {
		b.put_u32(0);
		b.put_u32(0);
	});
	write_box(out, b"stsz", |b| {
		b.put_u32(0);
		b.put_u32(0);
		b.put_u32(0);
	});
	write_box(out, b"stco", |b| {
		b.put_u32(0);
		b.put_u32(0);
	});
}

fn write_trex(out: &mut BytesMut, track_id: u32, default_duration: u32) {
	write_box(out, b"trex", |b| {
		b.put_u32(0);
		b.put_u32(track_id);
		b.put_u32(1); // default_sample_description_index
		b.put_u32(default_duration);
		b.put_u32(0); // default_sample_size
		b.put_u32(0); // default_sample_flags
	});
}

/// VP9 codec configuration box (`vpcC`). Color metadata fields default to
/// unspecified since `tvarr_codec::vp9` only parses dimensions and keyframe
/// status from the uncompressed header, not full color config.
fn write_vpcc(out: &mut BytesMut) {
	out.put_u32(1 << 24); // version 1, flags 0
	out.put_u8(0); // profile
	out.put_u8(0); // level (unconstrained)
	out.put_u8(0x80); // bit_depth=8(4 bits), chroma_subsampling=0, full_range=0
	out.put_u8(2); // colour_primaries unspecified
	out.put_u8(2); // transfer_characteristics unspecified
	out.put_u8(2); // matrix_coefficients unspecified
	out.put_u16(0); // codecIntializationDataSize
}

/// AV1 codec configuration box (`av1C`, ISO/IEC 14496-15 §5.3.2), populated
/// from the parsed sequence header when available; the sequence header OBU
/// itself rides along as `configOBUs` so a demuxer has it without waiting
/// for the first sample. Falls back to all-zero fields (profile 0, level 0,
/// 8-bit, no configOBUs) if no sequence header was parsed yet, which should
/// only happen for a malformed stream since `keyframe_is_init_eligible`
/// gates init-segment emission on a parsed header.
fn write_av1c(out: &mut BytesMut, header: Option<&SequenceHeader>, seq_header_obu: &[u8]) {
	out.put_u8(0x81); // marker=1, version=1

	let Some(header) = header else {
		out.put_u8(0);
		out.put_u8(0);
		out.put_u8(0);
		return;
	};

	out.put_u8((header.profile << 5) | (header.level & 0x1F));

	let (high_bitdepth, twelve_bit) = match header.bit_depth {
		12 => (true, true),
		10 => (true, false),
		_ => (false, false),
	};
	let mut byte2 = (header.tier as u8) << 7;
	byte2 |= (high_bitdepth as u8) << 6;
	byte2 |= (twelve_bit as u8) << 5;
	byte2 |= (header.mono_chrome as u8) << 4;
	byte2 |= (header.subsampling_x as u8) << 3;
	byte2 |= (header.subsampling_y as u8) << 2;
	byte2 |= header.chroma_sample_position & 0x03;
	out.put_u8(byte2);

	out.put_u8(0); // reserved | initial_presentation_delay_present=0 | reserved

	out.extend_from_slice(seq_header_obu);
}

fn write_dops(out: &mut BytesMut, sample_rate: u32, channels: u16) {
	out.put_u8(0); // version
	out.put_u8(channels as u8);
	out.put_u16(0); // pre_skip
	out.put_u32(sample_rate);
	out.put_i16(0); // output_gain
	out.put_u8(0); // channel_mapping_family
}

/// Minimal MPEG-4 `esds` box wrapping an AudioSpecificConfig, enough to
/// signal AAC-LC at a given sample rate/channel count to a demuxer.
fn write_esds(out: &mut BytesMut, sample_rate: u32, channels: u16) {
	out.put_u32(0); // version/flags

	let freq_index = aac_sample_rate_index(sample_rate);
	let asc = [
		(2 << 3) | (freq_index >> 1), // object_type=2 (AAC LC), freq_index high bits
		((freq_index & 1) << 7) | ((channels as u8) << 3),
	];

	out.put_u8(0x03); // ES_DescrTag
	out.put_u8(3 + 5 + 2 + 2 + asc.len() as u8);
	out.put_u16(0); // ES_ID
	out.put_u8(0); // flags

	out.put_u8(0x04); // DecoderConfigDescrTag
	out.put_u8(13 + 2 + asc.len() as u8);
	out.put_u8(0x40); // objectTypeIndication: AAC
	out.put_u8(0x15); // streamType=audio, upStream=0, reserved=1
	out.put_u8(0);
	out.put_u16(0); // bufferSizeDB
	out.put_u32(0); // maxBitrate
	out.put_u32(0); // avgBitrate

	out.put_u8(0x05); // DecSpecificInfoTag
	out.put_u8(asc.len() as u8);
	out.extend_from_slice(&asc);
}

fn aac_sample_rate_index(sample_rate: u32) -> u8 {
	const RATES: [u32; 13] = [
		96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
	];
	RATES.iter().position(|&r| r == sample_rate).map(|i| i as u8).unwrap_or(3)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffers_until_init_eligible() {
		let mut mux = Fmp4Mux::new(VideoCodec::Vp9, AudioCodec::Opus);
		// Not a valid VP9 header: init segment withheld.
		mux.write_video(Ticks::ZERO, Ticks::ZERO, &[0x00, 0x00], true).unwrap();
		let out = mux.flush().unwrap();
		assert!(out.is_empty());
		assert!(!mux.initialized);
	}

	#[test]
	fn sample_rate_index_known_rate() {
		assert_eq!(aac_sample_rate_index(48_000), 3);
		assert_eq!(aac_sample_rate_index(44_100), 4);
	}

	#[test]
	fn av1c_encodes_parsed_sequence_header() {
		let header = SequenceHeader {
			profile: 1,
			level: 9,
			tier: true,
			bit_depth: 10,
			mono_chrome: false,
			subsampling_x: true,
			subsampling_y: true,
			chroma_sample_position: 2,
			color_primaries: 1,
			transfer_characteristics: 1,
			matrix_coefficients: 1,
			full_range: false,
			max_frame_width: 1920,
			max_frame_height: 1080,
		};
		let seq_header_obu = [0xAA, 0xBB, 0xCC];

		let mut out = BytesMut::new();
		write_av1c(&mut out, Some(&header), &seq_header_obu);

		assert_eq!(out[0], 0x81);
		assert_eq!(out[1], (1 << 5) | 9); // profile 1, level 9
		assert_eq!(out[2] & 0x80, 0x80); // tier
		assert_eq!(out[2] & 0x40, 0x40); // high_bitdepth (10-bit)
		assert_eq!(out[2] & 0x20, 0); // not twelve_bit
		assert_eq!(out[2] & 0x0C, 0x0C); // subsampling_x and subsampling_y both set
		assert_eq!(out[2] & 0x03, 2); // chroma_sample_position
		assert_eq!(&out[4..], &seq_header_obu);
	}

	#[test]
	fn av1c_falls_back_to_zeros_without_sequence_header() {
		let mut out = BytesMut::new();
		write_av1c(&mut out, None, &[]);
		assert_eq!(&out[..], &[0x81, 0x00, 0x00, 0x00]);
	}
}
