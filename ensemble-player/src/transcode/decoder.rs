//! Symphonia-backed transcoding context
//!
//! Decodes any supported container/codec to the engine's fixed stream
//! format: 16-bit LE signed stereo at 44.1 kHz. Decoded chunks are
//! converted to stereo f32, resampled when the source rate differs, then
//! quantized to i16 bytes held in a pending buffer that `fill()` drains.

use super::resample::resample_to_stream_rate;
use super::Transcode;
use crate::error::{Error, Result};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use tracing::debug;

pub struct SymphoniaTranscoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    native_rate: u32,
    /// Converted stream-format bytes not yet handed to the pump
    pending: VecDeque<u8>,
    eof: bool,
}

impl SymphoniaTranscoder {
    /// Open `path` and prepare the default audio track for decoding.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Transcode(format!("{}: probe failed: {}", path.display(), e)))?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| Error::Transcode(format!("{}: no audio track", path.display())))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let time_base = codec_params.time_base;
        let native_rate = codec_params.sample_rate.unwrap_or(44_100);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Transcode(format!("{}: unsupported codec: {}", path.display(), e)))?;

        debug!("Opened {} ({} Hz native)", path.display(), native_rate);

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base,
            native_rate,
            pending: VecDeque::new(),
            eof: false,
        })
    }

    /// Decode packets until the pending buffer is non-empty or EOF.
    fn refill_pending(&mut self) -> Result<()> {
        while self.pending.is_empty() && !self.eof {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(Error::Transcode(format!("read failed: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Recoverable corruption: skip the packet
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Transcode(format!("decode failed: {}", e))),
            };

            let stereo = convert_to_stereo_f32(&decoded)?;
            let resampled = resample_to_stream_rate(stereo, self.native_rate)?;

            self.pending.reserve(resampled.len() * 2);
            for sample in resampled {
                let q = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                self.pending.extend(q.to_le_bytes());
            }
        }

        Ok(())
    }
}

impl Transcode for SymphoniaTranscoder {
    fn fill(&mut self, out: &mut Vec<u8>, max_bytes: usize) -> Result<usize> {
        self.refill_pending()?;

        let n = max_bytes.min(self.pending.len());
        out.extend(self.pending.drain(..n));
        Ok(n)
    }

    fn seek(&mut self, ms: u32) -> Result<u32> {
        let time = Time::new(u64::from(ms) / 1000, f64::from(ms % 1000) / 1000.0);

        let seeked = self
            .format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Transcode(format!("seek failed: {}", e)))?;

        self.decoder.reset();
        self.pending.clear();
        self.eof = false;

        let actual_ms = match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(seeked.actual_ts);
                (t.seconds * 1000) as u32 + (t.frac * 1000.0) as u32
            }
            None => ms,
        };

        Ok(actual_ms)
    }
}

/// Convert a decoded buffer to interleaved stereo f32.
///
/// Mono is duplicated, stereo interleaved, multi-channel downmixed by
/// alternating channels into left/right.
fn convert_to_stereo_f32(buffer: &AudioBufferRef) -> Result<Vec<f32>> {
    match buffer {
        AudioBufferRef::F32(buf) => {
            let channels = buf.spec().channels.count();
            Ok(mix_channels(buf.frames(), channels, |ch, i| buf.chan(ch)[i]))
        }
        AudioBufferRef::S16(buf) => {
            let channels = buf.spec().channels.count();
            Ok(mix_channels(buf.frames(), channels, |ch, i| {
                f32::from(buf.chan(ch)[i]) / 32_768.0
            }))
        }
        AudioBufferRef::S32(buf) => {
            let channels = buf.spec().channels.count();
            Ok(mix_channels(buf.frames(), channels, |ch, i| {
                buf.chan(ch)[i] as f32 / 2_147_483_648.0
            }))
        }
        _ => Err(Error::Transcode(
            "unsupported decoded sample format".to_string(),
        )),
    }
}

fn mix_channels<F: Fn(usize, usize) -> f32>(frames: usize, channels: usize, sample: F) -> Vec<f32> {
    let mut stereo = Vec::with_capacity(frames * 2);

    match channels {
        0 => {}
        1 => {
            for i in 0..frames {
                let s = sample(0, i);
                stereo.push(s);
                stereo.push(s);
            }
        }
        2 => {
            for i in 0..frames {
                stereo.push(sample(0, i));
                stereo.push(sample(1, i));
            }
        }
        n => {
            for i in 0..frames {
                let mut left = 0.0f32;
                let mut right = 0.0f32;
                for ch in 0..n {
                    if ch % 2 == 0 {
                        left += sample(ch, i);
                    } else {
                        right += sample(ch, i);
                    }
                }
                let half = n as f32 / 2.0;
                stereo.push(left / half);
                stereo.push(right / half);
            }
        }
    }

    stereo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_nonexistent_file() {
        assert!(SymphoniaTranscoder::open("/nonexistent/file.mp3").is_err());
    }

    #[test]
    fn test_mix_channels_mono_duplicates() {
        let samples = [0.5f32, -0.25];
        let stereo = mix_channels(2, 1, |_, i| samples[i]);
        assert_eq!(stereo, vec![0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn test_mix_channels_stereo_interleaves() {
        let left = [1.0f32, 3.0];
        let right = [2.0f32, 4.0];
        let stereo = mix_channels(2, 2, |ch, i| if ch == 0 { left[i] } else { right[i] });
        assert_eq!(stereo, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
