//! Playback clock
//!
//! Derives "current stream position" for the pump. Two sync sources share
//! one contract: report `(pos, ts)` and optionally commit them as the new
//! anchor pair.
//!
//! - **Wallclock**: extrapolate from the committed `(pb_pos,
//!   pb_pos_stamp)` anchor at 44.1 kHz.
//! - **Local audio**: the sound card's emitted-sample counter is the
//!   position; the monotonic timestamp is taken separately.
//!
//! The local sink's state drives source switching: Running selects local
//! audio; on the way back to wallclock the caller must commit once under
//! the local source so the anchor pair is seamless.

use ensemble_common::timing::{us_to_samples, OUTPUT_LEAD_SAMPLES, PACKET_SAMPLES};
use tokio::time::Instant;

/// Which clock derives the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    Clock,
    LocalAudio,
}

/// Sample-index clock state for the audio pump.
#[derive(Debug)]
pub struct PumpClock {
    /// Committed position anchor (sample index)
    pub pb_pos: u64,
    /// Monotonic stamp taken when `pb_pos` was committed
    pub pb_pos_stamp: Instant,
    pub sync_source: SyncSource,
    /// One past the last packet handed to outputs
    pub last_rtptime: u64,
}

impl PumpClock {
    /// Create a clock with a randomized stream origin.
    pub fn new(initial_rtptime: u64) -> Self {
        Self {
            pb_pos: 0,
            pb_pos_stamp: Instant::now(),
            sync_source: SyncSource::Clock,
            last_rtptime: initial_rtptime,
        }
    }

    /// Stream index of the next packet to be produced.
    pub fn next_pkt(&self) -> u64 {
        self.last_rtptime + PACKET_SAMPLES
    }

    /// Set the pre-roll anchor for playback start: position trails the
    /// first packet by the 2-second output lead.
    pub fn set_preroll_anchor(&mut self) {
        self.pb_pos = self.next_pkt() - OUTPUT_LEAD_SAMPLES;
    }

    /// Current position under the wallclock source.
    pub fn pos_clock(&mut self, commit: bool) -> (u64, Instant) {
        let ts = Instant::now();
        let delta_us = ts.duration_since(self.pb_pos_stamp).as_micros() as u64;
        let pos = self.pb_pos + us_to_samples(delta_us);

        if commit {
            self.pb_pos = pos;
            self.pb_pos_stamp = ts;
        }

        (pos, ts)
    }

    /// Current position under the local-audio source, given the sink's
    /// emitted-sample index.
    pub fn pos_laudio(&mut self, sink_pos: u64, commit: bool) -> (u64, Instant) {
        let ts = Instant::now();

        if commit {
            self.pb_pos = sink_pos;
            self.pb_pos_stamp = ts;
        }

        (sink_pos, ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_common::timing::SAMPLE_RATE;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_source_extrapolates() {
        let mut clock = PumpClock::new(1000);
        clock.pb_pos = 5000;
        clock.pb_pos_stamp = Instant::now();

        tokio::time::advance(Duration::from_secs(1)).await;

        let (pos, _) = clock.pos_clock(false);
        assert_eq!(pos, 5000 + SAMPLE_RATE as u64);

        // No commit: anchor unchanged, a second read keeps extrapolating
        tokio::time::advance(Duration::from_secs(1)).await;
        let (pos, _) = clock.pos_clock(false);
        assert_eq!(pos, 5000 + 2 * SAMPLE_RATE as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_commit_moves_anchor() {
        let mut clock = PumpClock::new(0);
        clock.pb_pos = 0;
        clock.pb_pos_stamp = Instant::now();

        tokio::time::advance(Duration::from_millis(500)).await;
        let (pos, _) = clock.pos_clock(true);
        assert_eq!(pos, 22_050);
        assert_eq!(clock.pb_pos, 22_050);

        tokio::time::advance(Duration::from_millis(500)).await;
        let (pos, _) = clock.pos_clock(false);
        assert_eq!(pos, 44_100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_laudio_commit_installs_sink_position() {
        let mut clock = PumpClock::new(0);
        clock.sync_source = SyncSource::LocalAudio;

        let (pos, _) = clock.pos_laudio(77_000, true);
        assert_eq!(pos, 77_000);
        assert_eq!(clock.pb_pos, 77_000);

        // Seamless handover: wallclock continues from the committed pair
        clock.sync_source = SyncSource::Clock;
        tokio::time::advance(Duration::from_secs(1)).await;
        let (pos, _) = clock.pos_clock(false);
        assert_eq!(pos, 77_000 + SAMPLE_RATE as u64);
    }

    #[test]
    fn test_preroll_anchor() {
        let mut clock = PumpClock::new(100_000);
        clock.set_preroll_anchor();
        assert_eq!(clock.pb_pos, 100_000 + PACKET_SAMPLES - OUTPUT_LEAD_SAMPLES);
    }
}
