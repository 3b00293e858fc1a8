use bytes::{BufMut, Bytes, BytesMut};
use mp4_atom::{Any, Codec, DecodeMaybe, Mdat, Moof, Moov};
use tvarr_codec::{avcc_param_sets, classify, hvcc_param_sets, split_length_prefixed, NalKind, AudioCodec, VideoCodec};

use crate::demux::{OnAudio, OnVideo, OutputDemuxer};
use crate::error::DemuxError;

/// fMP4 (CMAF) demuxer, symmetric to [`crate::mux::Fmp4Mux`]: `moof`+`mdat`
/// pairing, a `trun` entry walk, and tfdt+cts PTS/DTS computation. Unlike an
/// importer that only ever sees the codecs its own encoder wrote, this
/// demuxer also has to cope with an explicit output-container override
/// putting H.264/H.265 into fMP4, so it still carries the length-prefixed
/// to Annex-B conversion and parameter-set recovery that path needs.
pub struct Fmp4Demux<'a> {
	video_codec: VideoCodec,
	is_hevc: bool,
	on_video: Box<OnVideo<'a>>,
	on_audio: Box<OnAudio<'a>>,
	buf: BytesMut,
	moov: Option<Moov>,
	pending_moof: Option<(Moof, usize)>,
	video_track_id: Option<u32>,
	audio_track_id: Option<u32>,
	video_timescale: u32,
	audio_timescale: u32,
	length_size: usize,
	param_sets: Vec<Bytes>,
}

impl<'a> Fmp4Demux<'a> {
	pub fn new(video_codec: VideoCodec, _audio_codec: AudioCodec, on_video: Box<OnVideo<'a>>, on_audio: Box<OnAudio<'a>>) -> Self {
		Self {
			video_codec,
			is_hevc: matches!(video_codec, VideoCodec::H265),
			on_video,
			on_audio,
			buf: BytesMut::new(),
			moov: None,
			pending_moof: None,
			video_track_id: None,
			audio_track_id: None,
			video_timescale: tvarr_codec::TICKS_PER_SECOND as u32,
			audio_timescale: 48_000,
			length_size: 4,
			param_sets: Vec::new(),
		}
	}

	fn init(&mut self, moov: Moov) -> Result<(), DemuxError> {
		for trak in &moov.trak {
			let track_id = trak.tkhd.track_id;
			let handler = &trak.mdia.hdlr.handler;
			let stsd = &trak.mdia.minf.stbl.stsd;
			let Some(codec) = stsd.codecs.first() else { continue };

			if handler.as_ref() == b"vide" {
				self.video_track_id = Some(track_id);
				self.video_timescale = trak.mdia.mdhd.timescale;
				self.extract_video_param_sets(codec)?;
			} else if handler.as_ref() == b"soun" {
				self.audio_track_id = Some(track_id);
				self.audio_timescale = trak.mdia.mdhd.timescale;
			}
		}

		self.moov = Some(moov);
		Ok(())
	}

	fn extract_video_param_sets(&mut self, codec: &Codec) -> Result<(), DemuxError> {
		use mp4_atom::Encode;

		match codec {
			Codec::Avc1(avc1) if matches!(self.video_codec, VideoCodec::H264) => {
				let mut raw = BytesMut::new();
				avc1.avcc.encode_body(&mut raw)?;
				self.length_size = (raw.get(4).copied().unwrap_or(0xFF) & 0x03) as usize + 1;
				self.param_sets = avcc_param_sets(&raw);
			}
			Codec::Hev1(hev1) if matches!(self.video_codec, VideoCodec::H265) => {
				let mut raw = BytesMut::new();
				hev1.hvcc.encode_body(&mut raw)?;
				self.length_size = (raw.get(21).copied().unwrap_or(0xFF) & 0x03) as usize + 1;
				self.param_sets = hvcc_param_sets(&raw);
			}
			Codec::Hvc1(hvc1) if matches!(self.video_codec, VideoCodec::H265) => {
				let mut raw = BytesMut::new();
				hvc1.hvcc.encode_body(&mut raw)?;
				self.length_size = (raw.get(21).copied().unwrap_or(0xFF) & 0x03) as usize + 1;
				self.param_sets = hvcc_param_sets(&raw);
			}
			// VP9/AV1 carry no out-of-band parameter sets; every frame is self-contained.
			_ => {}
		}
		Ok(())
	}

	fn to_annex_b(&self, payload: &Bytes, keyframe: bool) -> Bytes {
		if !matches!(self.video_codec, VideoCodec::H264 | VideoCodec::H265) {
			return payload.clone();
		}

		let mut nalus = split_length_prefixed(payload, self.length_size);
		let has_param_set = nalus
			.iter()
			.any(|nal| classify(nal, self.is_hevc) == NalKind::ParameterSet);

		if keyframe && !has_param_set && !self.param_sets.is_empty() {
			let mut with_params = self.param_sets.clone();
			with_params.append(&mut nalus);
			nalus = with_params;
		}

		let mut out = BytesMut::new();
		for nal in &nalus {
			out.put_u8(0x00);
			out.put_u8(0x00);
			out.put_u8(0x01);
			out.extend_from_slice(nal);
		}
		out.freeze()
	}

	fn extract(&mut self, mdat: Mdat, header_size: usize) -> Result<(), DemuxError> {
		let mdat_data = Bytes::from(mdat.data);
		let moov = self.moov.as_ref().ok_or(DemuxError::MissingInit)?;
		let (moof, moof_size) = self.pending_moof.take().ok_or(DemuxError::MissingInit)?;

		for traf in &moof.traf {
			let track_id = traf.tfhd.track_id;
			let is_video = Some(track_id) == self.video_track_id;
			let is_audio = Some(track_id) == self.audio_track_id;
			if !is_video && !is_audio {
				continue;
			}

			let trex = moov
				.mvex
				.as_ref()
				.and_then(|mvex| mvex.trex.iter().find(|trex| trex.track_id == track_id));
			let default_duration = trex.map(|t| t.default_sample_duration).unwrap_or_default();
			let default_size = trex.map(|t| t.default_sample_size).unwrap_or_default();
			let default_flags = trex.map(|t| t.default_sample_flags).unwrap_or_default();

			let tfdt = traf.tfdt.as_ref().ok_or(DemuxError::MissingInit)?;
			let mut dts: i64 = tfdt.base_media_decode_time as i64;
			let timescale = if is_video { self.video_timescale } else { self.audio_timescale };

			let mut offset: i64 = traf.tfhd.base_data_offset.unwrap_or_default();
			let mut first_sample = true;

			for trun in &traf.trun {
				if let Some(data_offset) = trun.data_offset {
					let base = traf.tfhd.base_data_offset.unwrap_or_default();
					offset = base + data_offset as i64 - moof_size as i64 - header_size as i64;
				}

				for entry in &trun.entries {
					let flags = entry
						.flags
						.unwrap_or(traf.tfhd.default_sample_flags.unwrap_or(default_flags));
					let duration = entry
						.duration
						.unwrap_or(traf.tfhd.default_sample_duration.unwrap_or(default_duration));
					let size = entry
						.size
						.unwrap_or(traf.tfhd.default_sample_size.unwrap_or(default_size)) as i64;
					let cts = entry.cts.unwrap_or_default() as i64;

					if offset < 0 || (offset + size) as usize > mdat_data.len() {
						return Err(DemuxError::Truncated {
							expected: size as usize,
							actual: mdat_data.len().saturating_sub(offset.max(0) as usize),
						});
					}

					let payload = mdat_data.slice(offset as usize..(offset + size) as usize);
					let pts_ticks = scale_to_ticks(dts + cts, timescale);
					let dts_ticks = scale_to_ticks(dts, timescale);

					if is_video {
						// kSampleDependsOnNoOther / kSampleIsNonSyncSample, Chromium's
						// track_run_iterator.cc naming for these same trun sample flag bits.
						let flagged_keyframe = (flags >> 24) & 0x3 == 0x2 && (flags >> 16) & 0x1 != 1;
						// Fragmented-keyframe mode emits one keyframe per fragment but
						// may not set the sync flag on it: fall back to "first sample
						// of the fragment is a keyframe" when the flag says otherwise.
						let keyframe = flagged_keyframe || first_sample;
						let annex_b = self.to_annex_b(&payload, keyframe);
						(self.on_video)(pts_ticks, dts_ticks, &annex_b, keyframe);
					} else {
						(self.on_audio)(pts_ticks, &payload);
					}

					dts += duration as i64;
					offset += size;
					first_sample = false;
				}
			}
		}

		Ok(())
	}
}

fn scale_to_ticks(value: i64, timescale: u32) -> tvarr_codec::Ticks {
	if timescale == 0 {
		return tvarr_codec::Ticks::ZERO;
	}
	let ticks = (value as i128 * tvarr_codec::TICKS_PER_SECOND as i128) / timescale as i128;
	tvarr_codec::Ticks::new(ticks as i64)
}

impl OutputDemuxer for Fmp4Demux<'_> {
	fn write(&mut self, data: &[u8]) -> Result<(), DemuxError> {
		// `Any::decode_maybe` needs a cursor over the accumulated bytes, but
		// that cursor can't borrow `self.buf` directly: the loop body calls
		// back into `&mut self` (`init`/`extract`) while still walking it.
		// Detach the pending bytes into a standalone buffer for the duration
		// of the scan and restore whatever's left unconsumed afterwards.
		self.buf.extend_from_slice(data);
		let local = self.buf.split().freeze();
		let mut cursor = std::io::Cursor::new(local.as_ref());
		let mut position = 0usize;

		let result = (|| -> Result<(), DemuxError> {
			loop {
				match Any::decode_maybe(&mut cursor) {
					Ok(Some(atom)) => {
						let size = cursor.position() as usize - position;
						position = cursor.position() as usize;

						match atom {
							Any::Moov(moov) => self.init(moov)?,
							Any::Moof(moof) => self.pending_moof = Some((moof, size)),
							Any::Mdat(mdat) => {
								let header_size = size - mdat.data.len();
								self.extract(mdat, header_size)?;
							}
							_ => {}
						}
					}
					Ok(None) => break,
					Err(err) => return Err(err.into()),
				}
			}
			Ok(())
		})();

		self.buf.extend_from_slice(&local[position..]);
		result
	}

	fn close(&mut self) -> Result<(), DemuxError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_write_does_not_error() {
		let mut demux = Fmp4Demux::new(VideoCodec::H264, AudioCodec::Aac, Box::new(|_, _, _, _| {}), Box::new(|_, _| {}));
		// A truncated ftyp box header: not enough bytes to decode anything yet.
		assert!(demux.write(&[0, 0, 0]).is_ok());
		assert_eq!(demux.buf.len(), 3);
	}
}
