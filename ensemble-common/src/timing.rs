//! Sample-accurate timing for the playback stream
//!
//! The engine's sole timebase is the *sample index* (rtptime): a count of
//! 44.1 kHz stereo frames since the playback stream origin. This module
//! holds the framing constants and the conversions between sample indices,
//! milliseconds, and PCM byte counts.
//!
//! # Framing
//!
//! Packets are fanned out to all outputs at a fixed granularity of
//! [`PACKET_SAMPLES`] frames. One packet therefore spans
//! [`STREAM_PERIOD_NS`] nanoseconds of wallclock, and the pump timer runs
//! at exactly that period. Remote receivers are given a fixed
//! [`OUTPUT_LEAD_SAMPLES`] head start (2 seconds) to fill their buffers
//! before an item is reported as "now playing".

use std::time::Duration;

/// Stream sample rate in Hz. All transcoded audio is normalized to this.
pub const SAMPLE_RATE: u32 = 44_100;

/// Samples (stereo frames) per fan-out packet.
pub const PACKET_SAMPLES: u64 = 352;

/// Bytes per packet: stereo, 16-bit.
pub const PACKET_BYTES: usize = (PACKET_SAMPLES as usize) * 2 * 2;

/// Bytes per stereo 16-bit frame.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Pump tick period: the wallclock duration of one packet.
///
/// 352 / 44100 s, kept in nanoseconds so absolute deadlines do not drift.
pub const STREAM_PERIOD_NS: u64 = 7_981_859;

/// Pump tick period as a [`Duration`].
pub const STREAM_PERIOD: Duration = Duration::from_nanos(STREAM_PERIOD_NS);

/// Output lead: samples between stream start and "now playing" promotion.
///
/// Two seconds of buffering headroom for networked receivers.
pub const OUTPUT_LEAD_SAMPLES: u64 = 2 * SAMPLE_RATE as u64;

/// Convert a PCM byte count to a sample (frame) count.
pub fn bytes_to_samples(bytes: usize) -> u64 {
    (bytes / BYTES_PER_SAMPLE) as u64
}

/// Convert a sample count to a PCM byte count.
pub fn samples_to_bytes(samples: u64) -> usize {
    (samples as usize) * BYTES_PER_SAMPLE
}

/// Convert milliseconds to samples (truncating).
pub fn ms_to_samples(ms: u64) -> u64 {
    (ms * SAMPLE_RATE as u64) / 1000
}

/// Convert samples to milliseconds (truncating).
pub fn samples_to_ms(samples: u64) -> u64 {
    (samples * 1000) / SAMPLE_RATE as u64
}

/// Convert a monotonic-clock delta in microseconds to samples (truncating).
pub fn us_to_samples(us: u64) -> u64 {
    (us * SAMPLE_RATE as u64) / 1_000_000
}
