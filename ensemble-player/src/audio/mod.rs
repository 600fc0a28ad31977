//! Local audio output
//!
//! The engine writes the same timestamped packets to the local sound card
//! that it fans out to remote receivers. [`LocalSink`] is the sink
//! contract; [`CpalSink`] is the shipped implementation.
//!
//! # State model
//!
//! ```text
//! Closed -> Open -> Started -> Running -> Stopping -> Open
//!                      \________________/     |
//!                            Failed <---------+
//! ```
//!
//! Player-initiated transitions (open, start, stop, close) are applied by
//! the output coordinator as it makes the calls; sink-initiated
//! transitions (Running once the device consumes audio, Failed on stream
//! errors) arrive on the sink event channel and are handled on the player
//! thread. On stop the coordinator commits the playback position from the
//! sink *before* the device winds down, so the wallclock source can take
//! over without a seam.

mod cpal_sink;

pub use cpal_sink::CpalSink;

use crate::error::Result;
use tokio::sync::mpsc;

/// Local sink lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Closed,
    Open,
    Started,
    Running,
    Stopping,
    Failed,
}

impl SinkState {
    /// True while the sink should be handed packets.
    pub fn is_started(self) -> bool {
        matches!(self, SinkState::Started | SinkState::Running)
    }
}

/// Sink-initiated state notifications, delivered on the player thread.
pub type SinkEventSender = mpsc::UnboundedSender<SinkState>;

/// Blocking, stateful PCM writer for the local sound card.
pub trait LocalSink {
    /// Acquire the output device.
    fn open(&mut self) -> Result<()>;

    /// Begin playback. `pb_pos` anchors the sink's position counter in the
    /// stream timeline; `next_rtptime` is the index of the first packet
    /// that will be written.
    fn start(&mut self, pb_pos: u64, next_rtptime: u64) -> Result<()>;

    /// Queue one packet of 16-bit LE stereo PCM tagged with its rtptime.
    fn write(&mut self, pcm: &[u8], rtptime: u64) -> Result<()>;

    /// Stop playback, discarding queued audio. The device stays open.
    fn stop(&mut self);

    /// Release the output device.
    fn close(&mut self);

    /// Set output volume (0-100).
    fn set_volume(&mut self, volume: u8);

    /// Current emitted-sample index in the stream timeline.
    fn pos(&self) -> u64;
}
