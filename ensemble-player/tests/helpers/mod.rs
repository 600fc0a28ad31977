#![allow(dead_code)]

//! Test harness for playback engine integration tests
//!
//! Provides an engine rig with:
//! - In-memory SQLite database for isolation
//! - Mock local sink, remote driver, and transcoder with call recording
//! - Event-wait helpers with timeout guards
//!
//! Tests run on a paused-clock current-thread runtime; the pump's
//! absolute-deadline timer auto-advances, so seconds of stream time pass
//! in milliseconds of wall time.

use ensemble_common::events::{PlayerEvent, PlayerState};
use ensemble_player::audio::{LocalSink, SinkEventSender, SinkState};
use ensemble_player::db::media::MediaFile;
use ensemble_player::error::{Error, Result};
use ensemble_player::player::registry::DeviceRegistry;
use ensemble_player::raop::{
    RaopBackend, RemoteSpec, SessionEvent, SessionEventSender, SessionId, SessionStatus,
};
use ensemble_player::transcode::{Transcode, TranscodeFactory};
use ensemble_player::{Player, PlayerConfig};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(30);

// ======================================================================
// Database

/// In-memory database seeded with media files `ids` (path derived from
/// the id, nothing disabled).
pub async fn test_db(ids: &[u32]) -> SqlitePool {
    let pool = ensemble_common::db::init_memory().await.unwrap();
    for &id in ids {
        insert_file(&pool, id, false).await;
    }
    pool
}

pub async fn insert_file(pool: &SqlitePool, id: u32, disabled: bool) {
    sqlx::query(
        "INSERT INTO files (id, path, title, artist, album, disabled) VALUES (?, ?, ?, '', '', ?)",
    )
    .bind(id)
    .bind(format!("/music/{}.flac", id))
    .bind(format!("Track {}", id))
    .bind(disabled)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn set_disabled(pool: &SqlitePool, id: u32, disabled: bool) {
    sqlx::query("UPDATE files SET disabled = ? WHERE id = ?")
        .bind(disabled)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

// ======================================================================
// Mock local sink

#[derive(Default)]
pub struct SinkRecord {
    pub opened: bool,
    pub started: bool,
    pub base_pos: u64,
    pub played_frames: u64,
    /// (rtptime, byte length) per written packet
    pub writes: Vec<(u64, usize)>,
    /// All written PCM, concatenated
    pub pcm: Vec<u8>,
    pub volume: Option<u8>,
    /// When set, the next write fails
    pub fail_next_write: bool,
}

#[derive(Clone)]
pub struct SinkHandle(pub Arc<Mutex<SinkRecord>>);

impl SinkHandle {
    pub fn new() -> Self {
        SinkHandle(Arc::new(Mutex::new(SinkRecord::default())))
    }

    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.0.lock().unwrap().writes.clone()
    }

    pub fn pcm(&self) -> Vec<u8> {
        self.0.lock().unwrap().pcm.clone()
    }

    pub fn fail_next_write(&self) {
        self.0.lock().unwrap().fail_next_write = true;
    }
}

/// Local sink double: every written frame counts as played immediately,
/// so the position counter runs exactly as far as the pump has written.
pub struct MockSink {
    record: Arc<Mutex<SinkRecord>>,
    events: SinkEventSender,
}

impl MockSink {
    pub fn new(handle: &SinkHandle, events: SinkEventSender) -> Self {
        Self {
            record: Arc::clone(&handle.0),
            events,
        }
    }
}

impl LocalSink for MockSink {
    fn open(&mut self) -> Result<()> {
        self.record.lock().unwrap().opened = true;
        Ok(())
    }

    fn start(&mut self, pb_pos: u64, _next_rtptime: u64) -> Result<()> {
        {
            let mut rec = self.record.lock().unwrap();
            rec.started = true;
            rec.base_pos = pb_pos;
            rec.played_frames = 0;
        }
        // The device consumes audio right away
        let _ = self.events.send(SinkState::Running);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8], rtptime: u64) -> Result<()> {
        let mut rec = self.record.lock().unwrap();
        if rec.fail_next_write {
            rec.fail_next_write = false;
            return Err(Error::LocalAudio("injected write failure".to_string()));
        }
        rec.writes.push((rtptime, pcm.len()));
        rec.pcm.extend_from_slice(pcm);
        rec.played_frames += (pcm.len() / 4) as u64;
        Ok(())
    }

    fn stop(&mut self) {
        self.record.lock().unwrap().started = false;
    }

    fn close(&mut self) {
        let mut rec = self.record.lock().unwrap();
        rec.started = false;
        rec.opened = false;
    }

    fn set_volume(&mut self, volume: u8) {
        self.record.lock().unwrap().volume = Some(volume);
    }

    fn pos(&self) -> u64 {
        let rec = self.record.lock().unwrap();
        rec.base_pos + rec.played_frames
    }
}

// ======================================================================
// Mock remote driver

#[derive(Default)]
pub struct BackendRecord {
    pub start_calls: Vec<(u64, u64)>,
    pub probe_calls: Vec<u64>,
    pub stop_calls: Vec<SessionId>,
    pub flush_calls: Vec<u64>,
    pub volume_calls: Vec<u8>,
    pub playback_starts: Vec<u64>,
    pub playback_stops: u32,
    pub packets: Vec<(u64, usize)>,
    /// Live sessions by device id
    pub live: HashMap<u64, SessionId>,
    /// Scripted response per device id for start/probe
    pub responses: HashMap<u64, SessionStatus>,
}

/// Remote driver double. `device_start`/`device_probe` immediately emit
/// the scripted status event; flush/volume emit one completion per live
/// session.
pub struct MockBackend {
    record: Arc<Mutex<BackendRecord>>,
    events: SessionEventSender,
    next_session: AtomicU64,
}

#[derive(Clone)]
pub struct BackendHandle(pub Arc<Mutex<BackendRecord>>);

impl BackendHandle {
    pub fn live_sessions(&self) -> usize {
        self.0.lock().unwrap().live.len()
    }

    pub fn packets(&self) -> Vec<(u64, usize)> {
        self.0.lock().unwrap().packets.clone()
    }
}

impl MockBackend {
    pub fn new(events: SessionEventSender) -> (Arc<Self>, BackendHandle) {
        let record = Arc::new(Mutex::new(BackendRecord::default()));
        let backend = Arc::new(Self {
            record: Arc::clone(&record),
            events,
            next_session: AtomicU64::new(1),
        });
        (backend, BackendHandle(record))
    }

    /// Script the status a device answers start/probe with.
    pub fn respond_with(&self, device_id: u64, status: SessionStatus) {
        self.record
            .lock()
            .unwrap()
            .responses
            .insert(device_id, status);
    }

    /// Emit a spontaneous streaming-state event for a live session.
    pub fn emit_streaming(&self, device_id: u64, status: SessionStatus) {
        let session = self.record.lock().unwrap().live[&device_id];
        if status != SessionStatus::Connected {
            self.record.lock().unwrap().live.remove(&device_id);
        }
        let _ = self.events.send(SessionEvent {
            device_id,
            session,
            status,
        });
    }

    fn respond(&self, device_id: u64, register_on_ok: bool) {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let status = {
            let mut rec = self.record.lock().unwrap();
            let status = rec
                .responses
                .get(&device_id)
                .copied()
                .unwrap_or(SessionStatus::Connected);
            if register_on_ok && status == SessionStatus::Connected {
                rec.live.insert(device_id, session);
            }
            status
        };
        let _ = self.events.send(SessionEvent {
            device_id,
            session,
            status,
        });
    }
}

impl RaopBackend for MockBackend {
    fn device_start(&self, dev: &RemoteSpec, start_rtptime: u64) -> Result<()> {
        self.record
            .lock()
            .unwrap()
            .start_calls
            .push((dev.id, start_rtptime));
        self.respond(dev.id, true);
        Ok(())
    }

    fn device_probe(&self, dev: &RemoteSpec) -> Result<()> {
        self.record.lock().unwrap().probe_calls.push(dev.id);
        self.respond(dev.id, false);
        Ok(())
    }

    fn device_stop(&self, session: SessionId) {
        let device_id = {
            let mut rec = self.record.lock().unwrap();
            rec.stop_calls.push(session);
            let device_id = rec
                .live
                .iter()
                .find(|(_, &s)| s == session)
                .map(|(&d, _)| d);
            if let Some(d) = device_id {
                rec.live.remove(&d);
            }
            device_id
        };

        if let Some(device_id) = device_id {
            let _ = self.events.send(SessionEvent {
                device_id,
                session,
                status: SessionStatus::Stopped,
            });
        }
    }

    fn flush(&self, rtptime: u64) -> u32 {
        let mut rec = self.record.lock().unwrap();
        rec.flush_calls.push(rtptime);
        for (&device_id, &session) in rec.live.iter() {
            let _ = self.events.send(SessionEvent {
                device_id,
                session,
                status: SessionStatus::Connected,
            });
        }
        rec.live.len() as u32
    }

    fn set_volume(&self, volume: u8) -> u32 {
        let mut rec = self.record.lock().unwrap();
        rec.volume_calls.push(volume);
        for (&device_id, &session) in rec.live.iter() {
            let _ = self.events.send(SessionEvent {
                device_id,
                session,
                status: SessionStatus::Connected,
            });
        }
        rec.live.len() as u32
    }

    fn playback_start(&self, next_rtptime: u64, _stamp: tokio::time::Instant) {
        self.record.lock().unwrap().playback_starts.push(next_rtptime);
    }

    fn playback_stop(&self) {
        self.record.lock().unwrap().playback_stops += 1;
    }

    fn write(&self, pcm: &[u8], rtptime: u64) {
        self.record.lock().unwrap().packets.push((rtptime, pcm.len()));
    }
}

// ======================================================================
// Mock transcoder

#[derive(Default)]
pub struct TranscodeRecord {
    pub opens: Vec<u32>,
    /// (media id, requested ms) per seek
    pub seeks: Vec<(u32, u32)>,
}

#[derive(Clone)]
pub struct TranscodeHandle(pub Arc<Mutex<TranscodeRecord>>);

impl TranscodeHandle {
    pub fn opens(&self) -> Vec<u32> {
        self.0.lock().unwrap().opens.clone()
    }

    pub fn seeks(&self) -> Vec<(u32, u32)> {
        self.0.lock().unwrap().seeks.clone()
    }
}

/// Transcoder double: each item yields `total_bytes` of PCM filled with
/// the low byte of its media id, then EOF. Seeks land exactly on the
/// requested millisecond.
pub struct MockTranscodeFactory {
    record: Arc<Mutex<TranscodeRecord>>,
    /// Bytes of PCM per media id (default when absent)
    sizes: Mutex<HashMap<u32, usize>>,
    default_size: usize,
}

impl MockTranscodeFactory {
    pub fn new(default_size: usize) -> (Arc<Self>, TranscodeHandle) {
        let record = Arc::new(Mutex::new(TranscodeRecord::default()));
        let factory = Arc::new(Self {
            record: Arc::clone(&record),
            sizes: Mutex::new(HashMap::new()),
            default_size,
        });
        (factory, TranscodeHandle(record))
    }

    pub fn set_size(&self, id: u32, bytes: usize) {
        self.sizes.lock().unwrap().insert(id, bytes);
    }
}

impl TranscodeFactory for MockTranscodeFactory {
    fn open(&self, mfi: &MediaFile) -> Result<Box<dyn Transcode>> {
        self.record.lock().unwrap().opens.push(mfi.id);
        let total = self
            .sizes
            .lock()
            .unwrap()
            .get(&mfi.id)
            .copied()
            .unwrap_or(self.default_size);
        Ok(Box::new(MockSource {
            id: mfi.id,
            total,
            produced: 0,
            record: Arc::clone(&self.record),
        }))
    }
}

struct MockSource {
    id: u32,
    total: usize,
    produced: usize,
    record: Arc<Mutex<TranscodeRecord>>,
}

impl Transcode for MockSource {
    fn fill(&mut self, out: &mut Vec<u8>, max_bytes: usize) -> Result<usize> {
        let n = max_bytes.min(self.total - self.produced);
        out.extend(std::iter::repeat(self.id as u8).take(n));
        self.produced += n;
        Ok(n)
    }

    fn seek(&mut self, ms: u32) -> Result<u32> {
        self.record.lock().unwrap().seeks.push((self.id, ms));
        let byte_pos = (ms as usize * 44_100 / 1000) * 4;
        self.produced = byte_pos.min(self.total);
        Ok(ms)
    }
}

// ======================================================================
// Engine rig

pub struct TestRig {
    pub player: Player,
    pub db: SqlitePool,
    pub registry: Arc<DeviceRegistry>,
    pub sink: SinkHandle,
    pub backend: Arc<MockBackend>,
    pub backend_handle: BackendHandle,
    pub transcode: Arc<MockTranscodeFactory>,
    pub transcode_handle: TranscodeHandle,
    pub events: broadcast::Receiver<PlayerEvent>,
    /// Kept alive so the session event channel never closes
    pub session_tx: SessionEventSender,
}

impl TestRig {
    /// Build an engine over `ids` with per-item PCM size `item_bytes`,
    /// returning the rig and the engine future to spawn on a LocalSet.
    pub async fn new(ids: &[u32], item_bytes: usize) -> (TestRig, impl Future<Output = ()>) {
        let db = test_db(ids).await;
        TestRig::build(db, item_bytes).await
    }

    /// Build an engine over a pre-seeded database.
    pub async fn new_with_db(db: SqlitePool) -> (TestRig, impl Future<Output = ()>) {
        TestRig::build(db, 4000 * 1408).await
    }

    async fn build(db: SqlitePool, item_bytes: usize) -> (TestRig, impl Future<Output = ()>) {
        let registry = Arc::new(DeviceRegistry::new());

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (backend, backend_handle) = MockBackend::new(session_tx.clone());
        let (transcode, transcode_handle) = MockTranscodeFactory::new(item_bytes);

        let sink = SinkHandle::new();
        let sink_for_factory = sink.clone();

        let (player, engine) = Player::build_local(PlayerConfig {
            db: db.clone(),
            registry: Arc::clone(&registry),
            backend: Arc::clone(&backend) as Arc<dyn RaopBackend>,
            session_events: session_rx,
            sink_factory: Box::new(move |events| {
                Box::new(MockSink::new(&sink_for_factory, events))
            }),
            transcode: Arc::clone(&transcode) as Arc<dyn TranscodeFactory>,
            local_name: "Test Output".to_string(),
        })
        .await
        .unwrap();

        let events = player.subscribe();

        let rig = TestRig {
            player,
            db,
            registry,
            sink,
            backend,
            backend_handle,
            transcode,
            transcode_handle,
            events,
            session_tx,
        };

        (rig, engine)
    }

    /// Register a remote device as if discovery had advertised it.
    pub fn add_device(&self, id: u64, name: &str, has_password: bool, password: Option<&str>) {
        self.registry.upsert_advertised(
            id,
            name.to_string(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, (id & 0xff) as u8)),
            5000,
            has_password,
            password.map(|p| p.to_string()),
        );
    }

    /// Wait for the next status edge matching `state`.
    pub async fn wait_for_state(&mut self, state: PlayerState) {
        timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(PlayerEvent::StatusUpdate { state: s, .. }) if s == state => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {:?}", state));
    }

    /// Wait until `now_playing` reports `id`.
    pub async fn wait_for_track(&self, id: u32) {
        timeout(WAIT, async {
            loop {
                if self.player.now_playing().await.ok() == Some(id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for track {}", id));
    }
}
