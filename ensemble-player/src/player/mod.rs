//! Player facade
//!
//! The engine runs on a dedicated player thread that owns every piece of
//! mutable playback state; [`Player`] is the handle control code talks to.
//! Each API call marshals one command to the player thread and waits for
//! its completion, which may be deferred until outstanding remote-device
//! operations have reported back.

pub mod clock;
mod core;
pub mod queue;
pub mod registry;

use crate::audio::{LocalSink, SinkEventSender};
use crate::db;
use crate::error::{Error, Result};
use crate::raop::{RaopBackend, SessionEvent};
use crate::transcode::TranscodeFactory;
use ensemble_common::events::{EventBus, PlayerEvent, PlayerState, RepeatMode};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use registry::DeviceRegistry;
use serde::Serialize;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

/// Reserved output id addressing the local sound card in `speaker_set`.
pub const LOCAL_OUTPUT_ID: u64 = 0;

/// Full player status snapshot for the control frontend.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    /// Last commanded volume (0-100)
    pub volume: u8,
    /// Current item's media id, if any
    pub id: Option<u32>,
    /// Position within the current item in milliseconds
    pub pos_ms: u64,
    /// Playlist index of the current item
    pub pos_pl: Option<usize>,
}

/// One enumerated output for the speaker picker.
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerInfo {
    /// Output id; [`LOCAL_OUTPUT_ID`] is the local sound card
    pub id: u64,
    pub name: String,
    pub selected: bool,
    pub needs_password: bool,
}

/// Commands executed on the player thread.
pub(crate) enum CommandOp {
    GetStatus,
    NowPlaying,
    Start { idx: Option<u32> },
    Stop,
    Pause,
    Seek { ms: u32 },
    Next,
    Prev,
    SpeakerEnumerate,
    SpeakerSet { ids: Vec<u64> },
    VolumeSet { volume: u8 },
    RepeatSet { mode: RepeatMode },
    ShuffleSet { enable: bool },
    QueueAdd { ids: Vec<u32> },
    QueueClear,
    Shutdown,
}

/// Command reply payloads.
pub(crate) enum Reply {
    None,
    Status(PlayerStatus),
    NowPlaying(u32),
    Started(Option<u32>),
    Speakers(Vec<SpeakerInfo>),
}

pub(crate) struct CommandMsg {
    pub(crate) op: CommandOp,
    pub(crate) done: oneshot::Sender<Result<Reply>>,
}

/// Constructs the local sink on the player thread.
///
/// The sink is built there because audio stream handles must stay on the
/// thread that owns them.
pub type SinkFactory = Box<dyn FnOnce(SinkEventSender) -> Box<dyn LocalSink> + Send>;

/// Everything needed to bring the engine up.
pub struct PlayerConfig {
    pub db: SqlitePool,
    pub registry: Arc<DeviceRegistry>,
    pub backend: Arc<dyn RaopBackend>,
    /// Session status events from the remote driver
    pub session_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub sink_factory: SinkFactory,
    pub transcode: Arc<dyn TranscodeFactory>,
    /// Display name for the local output in speaker enumeration
    pub local_name: String,
}

/// Handle to a running player.
pub struct Player {
    cmd_tx: mpsc::Sender<CommandMsg>,
    bus: EventBus,
    registry: Arc<DeviceRegistry>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Player {
    /// Launch the engine on its own dedicated thread.
    pub fn launch(cfg: PlayerConfig) -> Result<Player> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let bus = EventBus::new(100);
        let registry = Arc::clone(&cfg.registry);

        let thread_bus = bus.clone();
        let thread = std::thread::Builder::new()
            .name("player".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Could not create player runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async move {
                    match make_core(cfg, cmd_rx, thread_bus).await {
                        Ok(core) => core.run().await,
                        Err(e) => error!("Player init failed: {}", e),
                    }
                });
            })?;

        info!("Player thread launched");

        Ok(Player {
            cmd_tx,
            bus,
            registry,
            thread: Some(thread),
        })
    }

    /// Build the engine for the current thread's runtime.
    ///
    /// Returns the handle and the engine future; the caller drives the
    /// future (e.g. on a `LocalSet`). Used for embedding and tests.
    pub async fn build_local(cfg: PlayerConfig) -> Result<(Player, impl Future<Output = ()>)> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let bus = EventBus::new(100);
        let registry = Arc::clone(&cfg.registry);

        let core = make_core(cfg, cmd_rx, bus.clone()).await?;

        let player = Player {
            cmd_tx,
            bus,
            registry,
            thread: None,
        };

        Ok((player, core.run()))
    }

    async fn command(&self, op: CommandOp) -> Result<Reply> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandMsg { op, done })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Full status snapshot.
    pub async fn get_status(&self) -> Result<PlayerStatus> {
        match self.command(CommandOp::GetStatus).await? {
            Reply::Status(status) => Ok(status),
            _ => Err(Error::InvalidState("unexpected reply".to_string())),
        }
    }

    /// Media id of the current item; fails when nothing is queued up.
    pub async fn now_playing(&self) -> Result<u32> {
        match self.command(CommandOp::NowPlaying).await? {
            Reply::NowPlaying(id) => Ok(id),
            _ => Err(Error::InvalidState("unexpected reply".to_string())),
        }
    }

    /// Start (or resume) playback.
    ///
    /// With `idx` the cursor jumps to that playlist position first; the
    /// chosen item's media id is returned when a jump (or an
    /// already-playing no-op) resolves one.
    pub async fn playback_start(&self, idx: Option<u32>) -> Result<Option<u32>> {
        match self.command(CommandOp::Start { idx }).await? {
            Reply::Started(id) => Ok(id),
            _ => Err(Error::InvalidState("unexpected reply".to_string())),
        }
    }

    pub async fn playback_stop(&self) -> Result<()> {
        self.command(CommandOp::Stop).await.map(|_| ())
    }

    pub async fn playback_pause(&self) -> Result<()> {
        self.command(CommandOp::Pause).await.map(|_| ())
    }

    /// Seek within the current item. Leaves the player Paused; issue
    /// `playback_start` to resume.
    pub async fn playback_seek(&self, ms: u32) -> Result<()> {
        self.command(CommandOp::Seek { ms }).await.map(|_| ())
    }

    /// Skip to the next item. Leaves the player Paused; issue
    /// `playback_start` to resume.
    pub async fn playback_next(&self) -> Result<()> {
        self.command(CommandOp::Next).await.map(|_| ())
    }

    /// Skip to the previous item. Leaves the player Paused; issue
    /// `playback_start` to resume.
    pub async fn playback_prev(&self) -> Result<()> {
        self.command(CommandOp::Prev).await.map(|_| ())
    }

    /// Enumerate known outputs (local first, then advertised devices).
    pub async fn speaker_enumerate(&self) -> Result<Vec<SpeakerInfo>> {
        match self.command(CommandOp::SpeakerEnumerate).await? {
            Reply::Speakers(speakers) => Ok(speakers),
            _ => Err(Error::InvalidState("unexpected reply".to_string())),
        }
    }

    /// Reconcile the active output set against `ids`.
    ///
    /// Returns [`Error::PasswordRequired`] when at least one requested
    /// device lacks a stored password; activations that already succeeded
    /// are *not* rolled back in that case, so other outputs keep playing.
    pub async fn speaker_set(&self, ids: &[u64]) -> Result<()> {
        self.command(CommandOp::SpeakerSet { ids: ids.to_vec() })
            .await
            .map(|_| ())
    }

    /// Set volume on every active output and persist it (0-100).
    pub async fn volume_set(&self, volume: u8) -> Result<()> {
        self.command(CommandOp::VolumeSet { volume }).await.map(|_| ())
    }

    pub async fn repeat_set(&self, mode: RepeatMode) -> Result<()> {
        self.command(CommandOp::RepeatSet { mode }).await.map(|_| ())
    }

    /// Toggle shuffle. Only the off-to-on edge reshuffles.
    pub async fn shuffle_set(&self, enable: bool) -> Result<()> {
        self.command(CommandOp::ShuffleSet { enable })
            .await
            .map(|_| ())
    }

    /// Append media ids (e.g. from [`crate::db::media::query_ids`]) to the
    /// play queue.
    pub async fn queue_add(&self, ids: Vec<u32>) -> Result<()> {
        self.command(CommandOp::QueueAdd { ids }).await.map(|_| ())
    }

    /// Drop the entire queue. Stops playback first when necessary.
    pub async fn queue_clear(&self) -> Result<()> {
        self.command(CommandOp::QueueClear).await.map(|_| ())
    }

    /// Subscribe to status-change notifications (one edge per transition).
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.bus.subscribe()
    }

    /// The event bus, for wiring collaborators such as discovery.
    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    /// The shared device registry.
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stop the engine and wait for the player thread to exit.
    pub async fn shutdown(mut self) {
        if self.command(CommandOp::Shutdown).await.is_err() {
            warn!("Player was already gone at shutdown");
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Player thread panicked");
            }
        }
    }
}

/// Construct the engine core (runs on the player thread / local runtime).
async fn make_core(
    cfg: PlayerConfig,
    cmd_rx: mpsc::Receiver<CommandMsg>,
    bus: EventBus,
) -> Result<core::PlayerCore> {
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let sink = (cfg.sink_factory)(sink_tx);

    let volume = match db::settings::get_volume(&cfg.db).await {
        Ok(volume) => volume,
        Err(e) => {
            warn!("Could not fetch last volume setting: {}", e);
            db::settings::DEFAULT_VOLUME
        }
    };

    let mut rng = SmallRng::from_entropy();
    // Random stream origin
    let initial_rtptime = (1u64 << 32) | u64::from(rng.next_u32());

    Ok(core::PlayerCore::new(core::CoreParams {
        db: cfg.db,
        bus,
        registry: cfg.registry,
        backend: cfg.backend,
        transcode: cfg.transcode,
        sink,
        sink_rx,
        session_rx: cfg.session_events,
        cmd_rx,
        local_name: cfg.local_name,
        volume,
        initial_rtptime,
        rng,
    }))
}
