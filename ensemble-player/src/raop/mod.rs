//! Remote receiver driver contract
//!
//! Remote network audio receivers (RAOP speakers) are driven through
//! [`RaopBackend`]. The wire protocol lives behind the trait; the engine
//! only depends on the session lifecycle: start/probe/stop per device,
//! stream-wide flush/volume/packet fan-out, and per-session status events
//! delivered on the player thread.

use crate::error::Result;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Remote device identifier (from the discovery advertisement).
pub type DeviceId = u64;

/// Opaque handle for an active receiver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Session status reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is up (connected / streaming)
    Connected,
    /// Session ended cleanly
    Stopped,
    /// Session failed
    Failed,
    /// Device rejected our credentials
    Password,
}

/// One session status notification.
///
/// The driver must deliver these on the player thread's event channel;
/// the engine routes each to the handler registered for the device's
/// in-flight operation.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub device_id: DeviceId,
    pub session: SessionId,
    pub status: SessionStatus,
}

/// Channel the driver emits [`SessionEvent`]s on.
pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// Connection parameters for one remote device.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub id: DeviceId,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub password: Option<String>,
}

/// Driver for remote network audio receivers.
///
/// Methods that launch asynchronous work (`device_start`, `device_probe`,
/// `device_stop`, `flush`, `set_volume`) complete later via
/// [`SessionEvent`]s; `flush` and `set_volume` return how many sessions
/// will report.
pub trait RaopBackend: Send + Sync {
    /// Open a session to `dev` and prepare it to stream starting at
    /// `start_rtptime`. Completion arrives as a session event.
    fn device_start(&self, dev: &RemoteSpec, start_rtptime: u64) -> Result<()>;

    /// Handshake-only check of `dev` (no streaming). Completion arrives as
    /// a session event.
    fn device_probe(&self, dev: &RemoteSpec) -> Result<()>;

    /// Tear down a session. Completion arrives as a session event.
    fn device_stop(&self, session: SessionId);

    /// Flush all sessions up to `rtptime`. Returns the number of sessions
    /// that will report completion.
    fn flush(&self, rtptime: u64) -> u32;

    /// Fan volume out to all sessions. Returns the number of sessions
    /// that will report completion.
    fn set_volume(&self, volume: u8) -> u32;

    /// Announce stream start to all sessions: the first packet index and
    /// its wallclock stamp.
    fn playback_start(&self, next_rtptime: u64, stamp: Instant);

    /// Announce stream stop to all sessions.
    fn playback_stop(&self);

    /// Fan one PCM packet out to all streaming sessions.
    fn write(&self, pcm: &[u8], rtptime: u64);
}

/// Backend for deployments without a remote streaming driver.
///
/// Never opens sessions; flush/volume report nothing pending.
pub struct NullBackend;

impl RaopBackend for NullBackend {
    fn device_start(&self, dev: &RemoteSpec, _start_rtptime: u64) -> Result<()> {
        tracing::warn!("No remote streaming backend; cannot start {}", dev.name);
        Err(crate::error::Error::OutputFailed)
    }

    fn device_probe(&self, dev: &RemoteSpec) -> Result<()> {
        tracing::warn!("No remote streaming backend; cannot probe {}", dev.name);
        Err(crate::error::Error::OutputFailed)
    }

    fn device_stop(&self, _session: SessionId) {}

    fn flush(&self, _rtptime: u64) -> u32 {
        0
    }

    fn set_volume(&self, _volume: u8) -> u32 {
        0
    }

    fn playback_start(&self, _next_rtptime: u64, _stamp: Instant) {}

    fn playback_stop(&self) {}

    fn write(&self, _pcm: &[u8], _rtptime: u64) {}
}
