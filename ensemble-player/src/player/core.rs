//! Player core: the single-threaded engine
//!
//! One task owns every piece of mutable playback state and multiplexes
//! four event sources: the command channel, the absolute-deadline pump
//! timer, local-sink state events, and remote-session status events.
//!
//! # Command completion
//!
//! Commands complete synchronously unless their front half launched
//! remote-device operations. In that case a pending record holds the
//! outstanding-operation count, the prepared reply, and an optional
//! bottom half; the last device callback to report runs the bottom half
//! and releases the caller. Only one command is in flight at a time (the
//! command channel is not polled while a pending record exists).
//!
//! # The pump
//!
//! Every stream period the pump checks for item boundary crossings,
//! advances `last_rtptime`, zeroes the packet, fills it from the
//! transcoder, and fans it out to the started local sink and any remote
//! sessions. The next deadline is scheduled absolutely so ticks never
//! drift.

use super::clock::{PumpClock, SyncSource};
use super::queue::{Advance, CheckOutcome, SourceOpen, SourceQueue};
use super::registry::DeviceRegistry;
use super::{CommandMsg, CommandOp, Reply};
use super::{PlayerStatus, SpeakerInfo, LOCAL_OUTPUT_ID};
use crate::audio::{LocalSink, SinkState};
use crate::db;
use crate::error::{Error, Result};
use crate::raop::{DeviceId, RaopBackend, RemoteSpec, SessionEvent, SessionId, SessionStatus};
use crate::transcode::{Transcode, TranscodeFactory};
use ensemble_common::events::{EventBus, PlayerEvent, PlayerState, RepeatMode};
use ensemble_common::timing::{
    bytes_to_samples, ms_to_samples, samples_to_ms, PACKET_BYTES, PACKET_SAMPLES, STREAM_PERIOD,
};
use rand::rngs::SmallRng;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Opens queue items: media lookup plus transcoder setup.
pub(crate) struct SourceOpener {
    db: SqlitePool,
    factory: Arc<dyn TranscodeFactory>,
}

impl SourceOpen for SourceOpener {
    fn open<'a>(
        &'a self,
        id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Transcode>>> + 'a>> {
        Box::pin(async move {
            let mfi = db::media::fetch_by_id(&self.db, id).await?;

            if mfi.disabled {
                debug!("File id {} is disabled, skipping", id);
                return Err(Error::MediaUnavailable(id));
            }

            debug!("Opening {}", mfi.path);
            self.factory.open(&mfi)
        })
    }
}

/// Aggregate result of a command's device operations.
///
/// Password-required is sticky: it is never downgraded to a generic
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed,
    Password,
}

impl Outcome {
    fn record_failure(&mut self) {
        if *self != Outcome::Password {
            *self = Outcome::Failed;
        }
    }

    fn record_password(&mut self) {
        *self = Outcome::Password;
    }

    fn into_result(self, reply: Reply) -> Result<Reply> {
        match self {
            Outcome::Success => Ok(reply),
            Outcome::Failed => Err(Error::OutputFailed),
            Outcome::Password => Err(Error::PasswordRequired),
        }
    }
}

/// Continuation of an async command.
#[derive(Debug, Clone, Copy)]
enum BottomHalf {
    Start,
    Pause,
    Seek { ms: u32 },
    Next,
    Prev,
}

/// The single in-flight asynchronous command.
struct PendingCommand {
    /// Outstanding device callbacks before completion
    remaining: u32,
    outcome: Outcome,
    reply: Reply,
    bottom_half: Option<BottomHalf>,
    done: oneshot::Sender<Result<Reply>>,
}

/// How a command's front half finished.
enum Disposition {
    Done(Reply),
    Pending {
        reply: Reply,
        bottom_half: Option<BottomHalf>,
    },
}

/// Handler registered for a device's next session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionCb {
    /// Steady-state streaming notifications
    Streaming,
    /// Completion of a flush/volume fan-out
    Command,
    /// speaker_set activation while playing
    Activate,
    /// speaker_set activation while stopped (handshake only)
    Probe,
    /// Session start launched by playback_start
    Restart,
    /// speaker_set deactivation
    Shutdown,
    /// Device vanished mid-operation; session being torn down
    Lost,
}

pub(crate) struct CoreParams {
    pub db: SqlitePool,
    pub bus: EventBus,
    pub registry: Arc<DeviceRegistry>,
    pub backend: Arc<dyn RaopBackend>,
    pub transcode: Arc<dyn TranscodeFactory>,
    pub sink: Box<dyn LocalSink>,
    pub sink_rx: mpsc::UnboundedReceiver<SinkState>,
    pub session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    pub cmd_rx: mpsc::Receiver<CommandMsg>,
    pub local_name: String,
    pub volume: u8,
    pub initial_rtptime: u64,
    pub rng: SmallRng,
}

pub(crate) struct PlayerCore {
    db: SqlitePool,
    bus: EventBus,
    registry: Arc<DeviceRegistry>,
    backend: Arc<dyn RaopBackend>,
    opener: SourceOpener,

    state: PlayerState,
    repeat: RepeatMode,
    shuffle: bool,
    volume: u8,

    queue: SourceQueue,
    clock: PumpClock,
    rng: SmallRng,

    sink: Box<dyn LocalSink>,
    sink_rx: mpsc::UnboundedReceiver<SinkState>,
    laudio_status: SinkState,
    laudio_selected: bool,
    local_name: String,

    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    session_cbs: HashMap<DeviceId, SessionCb>,
    raop_sessions: u32,

    /// Transcoder output not yet packed into a packet
    stream_buf: Vec<u8>,
    /// One fan-out packet, reused every tick
    packet: [u8; PACKET_BYTES],

    timer_armed: bool,
    next_tick: Instant,

    cmd_rx: mpsc::Receiver<CommandMsg>,
    pending: Option<PendingCommand>,
    /// Device operations launched by the running front half
    launched_ops: u32,
    /// Aggregate outcome of the running front half
    cmd_outcome: Outcome,
    exiting: bool,
}

impl PlayerCore {
    pub(crate) fn new(params: CoreParams) -> Self {
        // Push the restored volume out to the driver; with no sessions up
        // yet this reports nothing pending.
        let _ = params.backend.set_volume(params.volume);

        Self {
            opener: SourceOpener {
                db: params.db.clone(),
                factory: params.transcode,
            },
            db: params.db,
            bus: params.bus,
            registry: params.registry,
            backend: params.backend,
            state: PlayerState::Stopped,
            repeat: RepeatMode::Off,
            shuffle: false,
            volume: params.volume,
            queue: SourceQueue::new(),
            clock: PumpClock::new(params.initial_rtptime),
            rng: params.rng,
            sink: params.sink,
            sink_rx: params.sink_rx,
            laudio_status: SinkState::Closed,
            laudio_selected: false,
            local_name: params.local_name,
            session_rx: params.session_rx,
            session_cbs: HashMap::new(),
            raop_sessions: 0,
            stream_buf: Vec::new(),
            packet: [0u8; PACKET_BYTES],
            timer_armed: false,
            next_tick: Instant::now(),
            cmd_rx: params.cmd_rx,
            pending: None,
            launched_ops: 0,
            cmd_outcome: Outcome::Success,
            exiting: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Player event loop running");

        loop {
            tokio::select! {
                biased;

                Some(ev) = self.session_rx.recv() => {
                    self.handle_session_event(ev).await;
                }

                Some(st) = self.sink_rx.recv() => {
                    self.handle_sink_event(st);
                }

                msg = self.cmd_rx.recv(), if self.pending.is_none() => {
                    match msg {
                        Some(msg) => {
                            self.handle_command(msg).await;
                            if self.exiting {
                                break;
                            }
                        }
                        // All handles dropped
                        None => break,
                    }
                }

                _ = sleep_until(self.next_tick), if self.timer_armed => {
                    self.tick().await;
                }
            }
        }

        debug!("Player event loop exited");
    }

    // ------------------------------------------------------------------
    // Command dispatch

    async fn handle_command(&mut self, msg: CommandMsg) {
        let CommandMsg { op, done } = msg;

        self.launched_ops = 0;
        self.cmd_outcome = Outcome::Success;

        let result = match op {
            CommandOp::GetStatus => Ok(Disposition::Done(Reply::Status(self.get_status()))),
            CommandOp::NowPlaying => self.now_playing(),
            CommandOp::Start { idx } => self.playback_start(idx).await,
            CommandOp::Stop => {
                self.playback_stop();
                Ok(Disposition::Done(Reply::None))
            }
            CommandOp::Pause => self.pause_front(BottomHalf::Pause).await,
            CommandOp::Seek { ms } => self.pause_front(BottomHalf::Seek { ms }).await,
            CommandOp::Next => self.pause_front(BottomHalf::Next).await,
            CommandOp::Prev => self.pause_front(BottomHalf::Prev).await,
            CommandOp::SpeakerEnumerate => {
                Ok(Disposition::Done(Reply::Speakers(self.speaker_enumerate())))
            }
            CommandOp::SpeakerSet { ids } => self.speaker_set(ids),
            CommandOp::VolumeSet { volume } => self.volume_set(volume).await,
            CommandOp::RepeatSet { mode } => {
                self.repeat = mode;
                Ok(Disposition::Done(Reply::None))
            }
            CommandOp::ShuffleSet { enable } => {
                // Only the off-to-on edge reshuffles
                if enable && !self.shuffle {
                    self.queue.reshuffle(&mut self.rng);
                }
                self.shuffle = enable;
                Ok(Disposition::Done(Reply::None))
            }
            CommandOp::QueueAdd { ids } => {
                self.queue.append(&ids, &mut self.rng);
                Ok(Disposition::Done(Reply::None))
            }
            CommandOp::QueueClear => {
                if self.state != PlayerState::Stopped {
                    self.playback_stop();
                }
                self.queue.clear();
                Ok(Disposition::Done(Reply::None))
            }
            CommandOp::Shutdown => {
                self.exiting = true;
                Ok(Disposition::Done(Reply::None))
            }
        };

        match result {
            Err(e) => {
                let _ = done.send(Err(e));
            }
            Ok(Disposition::Done(reply)) => {
                let _ = done.send(self.cmd_outcome.into_result(reply));
            }
            Ok(Disposition::Pending { reply, bottom_half }) => {
                self.pending = Some(PendingCommand {
                    remaining: self.launched_ops,
                    outcome: self.cmd_outcome,
                    reply,
                    bottom_half,
                    done,
                });
            }
        }
    }

    /// Count one completed device operation; at zero, finish the command.
    async fn complete_pending_op(&mut self) {
        let finished = match self.pending.as_mut() {
            Some(p) => {
                p.remaining = p.remaining.saturating_sub(1);
                p.remaining == 0
            }
            None => false,
        };

        if finished {
            let p = self.pending.take().unwrap();
            let result = match p.bottom_half {
                // When a bottom half exists its result is the command's
                Some(bh) => self.run_bottom_half(bh).await.map(|_| p.reply),
                None => p.outcome.into_result(p.reply),
            };
            let _ = p.done.send(result);
        }
    }

    async fn run_bottom_half(&mut self, bh: BottomHalf) -> Result<()> {
        match bh {
            BottomHalf::Start => self.playback_start_bh().await,
            BottomHalf::Pause => self.playback_pause_bh(),
            BottomHalf::Seek { ms } => self.playback_seek_bh(ms),
            BottomHalf::Next => self.playback_next_bh().await,
            BottomHalf::Prev => self.playback_prev_bh().await,
        }
    }

    fn pending_outcome_mut(&mut self) -> Option<&mut Outcome> {
        self.pending.as_mut().map(|p| &mut p.outcome)
    }

    // ------------------------------------------------------------------
    // Clock

    fn current_pos(&mut self, commit: bool) -> (u64, Instant) {
        match self.clock.sync_source {
            SyncSource::Clock => self.clock.pos_clock(commit),
            SyncSource::LocalAudio => {
                let sink_pos = self.sink.pos();
                self.clock.pos_laudio(sink_pos, commit)
            }
        }
    }

    // ------------------------------------------------------------------
    // Status

    fn status_update(&mut self, state: PlayerState) {
        self.state = state;
        self.bus.emit_lossy(PlayerEvent::StatusUpdate {
            state,
            timestamp: chrono::Utc::now(),
        });
    }

    fn get_status(&mut self) -> PlayerStatus {
        let mut status = PlayerStatus {
            state: self.state,
            shuffle: self.shuffle,
            repeat: self.repeat,
            volume: self.volume,
            id: None,
            pos_ms: 0,
            pos_pl: None,
        };

        match self.state {
            PlayerState::Stopped => {
                debug!("Player status: stopped");
            }

            PlayerState::Paused => {
                debug!("Player status: paused");
                if let Some(cs) = self.queue.cur_streaming() {
                    let next_pkt = self.clock.next_pkt();
                    let item = self.queue.item(cs);
                    status.id = Some(item.id);
                    status.pos_ms = samples_to_ms(next_pkt.saturating_sub(item.stream_start));
                    status.pos_pl = Some(self.queue.position(cs));
                }
            }

            PlayerState::Playing => {
                if let Some(cp) = self.queue.cur_playing() {
                    debug!("Player status: playing");
                    let (pos, _) = self.current_pos(false);
                    let item = self.queue.item(cp);
                    status.id = Some(item.id);
                    status.pos_ms = samples_to_ms(pos.saturating_sub(item.stream_start));
                    status.pos_pl = Some(self.queue.position(cp));
                } else if let Some(cs) = self.queue.cur_streaming() {
                    debug!("Player status: playing (buffering)");
                    // Pre-roll: report paused at the scheduled position so
                    // clients do not see a 2-second jump backward
                    status.state = PlayerState::Paused;
                    let item = self.queue.item(cs);
                    status.id = Some(item.id);
                    status.pos_ms = samples_to_ms(item.output_start - item.stream_start);
                    status.pos_pl = Some(self.queue.position(cs));
                }
            }
        }

        status
    }

    fn now_playing(&mut self) -> Result<Disposition> {
        let idx = self
            .queue
            .cur_playing()
            .or_else(|| self.queue.cur_streaming())
            .ok_or_else(|| Error::InvalidState("nothing playing".to_string()))?;

        Ok(Disposition::Done(Reply::NowPlaying(self.queue.item(idx).id)))
    }

    // ------------------------------------------------------------------
    // Audio pump

    async fn tick(&mut self) {
        self.playback_write().await;

        // Stop may have fired during the write
        if self.state == PlayerState::Stopped {
            return;
        }

        // Absolute rescheduling keeps the packet cadence drift-free
        self.next_tick += STREAM_PERIOD;
    }

    async fn playback_write(&mut self) {
        self.source_check();
        if self.state == PlayerState::Stopped {
            return;
        }

        self.clock.last_rtptime += PACKET_SAMPLES;

        // Zero up front: whatever source_read cannot fill fans out as
        // silence
        self.packet.fill(0);

        self.source_read(self.clock.last_rtptime).await;

        if self.laudio_status.is_started() {
            if let Err(e) = self.sink.write(&self.packet, self.clock.last_rtptime) {
                error!("Local audio write failed: {}", e);
                self.local_audio_failed();
                if self.state == PlayerState::Stopped {
                    return;
                }
            }
        }

        if self.raop_sessions > 0 {
            self.backend.write(&self.packet, self.clock.last_rtptime);
        }
    }

    /// Advance the audible cursor over any boundaries the clock has
    /// crossed. Returns the current position (0 when idle/unavailable).
    fn source_check(&mut self) -> u64 {
        if self.queue.cur_streaming().is_none() {
            return 0;
        }

        let (pos, _) = self.current_pos(false);

        match self.queue.check(pos, self.repeat, self.shuffle) {
            CheckOutcome::Idle => {}
            CheckOutcome::NowPlaying => self.status_update(PlayerState::Playing),
            CheckOutcome::Stop => self.playback_stop(),
        }

        pos
    }

    /// Fill the packet from the transcoder, crossing item boundaries as
    /// needed. On EOF the ended item's last sample index is recorded and
    /// the next item opens mid-packet; when nothing more opens, the
    /// remainder stays silent.
    async fn source_read(&mut self, rtptime: u64) {
        if self.queue.cur_streaming().is_none() {
            return;
        }

        let len = PACKET_BYTES;
        let mut nbytes = 0usize;
        let mut open_next = false;

        while nbytes < len {
            if open_next {
                debug!("New file");
                open_next = false;

                match self
                    .queue
                    .next(false, self.repeat, self.shuffle, &mut self.rng, &self.opener)
                    .await
                {
                    Ok(Advance::Advanced) => {}
                    Ok(Advance::EndOfQueue) | Err(_) => return,
                }
            }

            if self.stream_buf.is_empty() {
                let cs = self.queue.cur_streaming().unwrap();
                let want = len - nbytes;
                let filled = match self.queue.item_mut(cs).ctx.as_mut() {
                    Some(ctx) => ctx.fill(&mut self.stream_buf, want),
                    None => Ok(0),
                };

                match filled {
                    Ok(n) if n > 0 => {}
                    // EOF or decode error: the item ends at the last byte
                    // emitted so far
                    _ => {
                        self.queue.item_mut(cs).end = rtptime + bytes_to_samples(nbytes) - 1;
                        open_next = true;
                        continue;
                    }
                }
            }

            let take = self.stream_buf.len().min(len - nbytes);
            self.packet[nbytes..nbytes + take].copy_from_slice(&self.stream_buf[..take]);
            self.stream_buf.drain(..take);
            nbytes += take;
        }
    }

    // ------------------------------------------------------------------
    // Local audio coordination

    fn handle_sink_event(&mut self, st: SinkState) {
        match st {
            SinkState::Running => {
                debug!("Local audio running");
                self.laudio_status = SinkState::Running;
                self.clock.sync_source = SyncSource::LocalAudio;
            }
            SinkState::Stopping => {
                debug!("Local audio stopping");
                // Synchronize the anchor pair before the sink stops
                // entirely, then fall back to the wallclock source
                self.laudio_status = SinkState::Stopping;
                if self.clock.sync_source == SyncSource::LocalAudio {
                    let sink_pos = self.sink.pos();
                    self.clock.pos_laudio(sink_pos, true);
                }
                self.clock.sync_source = SyncSource::Clock;
            }
            SinkState::Failed => {
                debug!("Local audio failed");
                self.local_audio_failed();
            }
            other => {
                self.laudio_status = other;
            }
        }
    }

    /// Stop the local sink. The position is committed under the local
    /// source first so the wallclock source resumes without a seam.
    fn local_audio_stop(&mut self) {
        if self.clock.sync_source == SyncSource::LocalAudio {
            let sink_pos = self.sink.pos();
            self.clock.pos_laudio(sink_pos, true);
        }
        self.clock.sync_source = SyncSource::Clock;

        self.laudio_status = SinkState::Stopping;
        self.sink.stop();
        self.laudio_status = SinkState::Open;
    }

    fn local_audio_failed(&mut self) {
        self.clock.sync_source = SyncSource::Clock;
        self.sink.close();
        self.laudio_status = SinkState::Closed;

        if self.raop_sessions == 0 {
            self.playback_stop();
        }

        self.laudio_selected = false;
    }

    // ------------------------------------------------------------------
    // Player state machine

    fn playback_stop(&mut self) {
        if self.laudio_status != SinkState::Closed {
            self.clock.sync_source = SyncSource::Clock;
            self.sink.close();
            self.laudio_status = SinkState::Closed;
        }

        if self.raop_sessions > 0 {
            self.backend.playback_stop();
        }

        self.timer_armed = false;

        let chain = self.queue.cur_playing().or_else(|| self.queue.cur_streaming());
        self.queue.stop_chain(chain);
        self.queue.set_cur_playing(None);
        self.queue.set_cur_streaming(None);

        self.stream_buf.clear();

        self.status_update(PlayerState::Stopped);
    }

    async fn playback_start(&mut self, idx: Option<u32>) -> Result<Disposition> {
        if self.queue.is_empty() {
            info!("Nothing to play!");
            return Err(Error::QueueEmpty);
        }

        if self.state == PlayerState::Playing {
            let id = self
                .queue
                .cur_playing()
                .or_else(|| self.queue.cur_streaming())
                .map(|i| self.queue.item(i).id);

            self.status_update(self.state);
            return Ok(Disposition::Done(Reply::Started(id)));
        }

        self.clock.set_preroll_anchor();

        let mut chosen = None;

        if let Some(steps) = idx {
            // Replace the cursor with the requested playlist position
            let chain = self.queue.cur_playing().or_else(|| self.queue.cur_streaming());
            self.queue.stop_chain(chain);
            self.queue.set_cur_playing(None);
            self.queue.set_cur_streaming(None);

            let target = if self.shuffle && steps == 0 {
                self.queue.reshuffle(&mut self.rng);
                self.queue.shuffle_head().unwrap()
            } else {
                let target = self.queue.walk_from_head(steps).unwrap();
                if self.shuffle {
                    self.queue.reshuffle(&mut self.rng);
                    self.queue.set_shuffle_head(Some(target));
                }
                target
            };

            if let Err(e) = self.queue.open_item(target, &self.opener).await {
                error!("Couldn't jump to queue position {}: {}", steps, e);
                return Err(e);
            }

            self.queue.set_cur_streaming(Some(target));
            chosen = Some(self.queue.item(target).id);

            let next_pkt = self.clock.next_pkt();
            let item = self.queue.item_mut(target);
            item.stream_start = next_pkt;
            item.output_start = next_pkt;
        } else if self.queue.cur_streaming().is_none() {
            if self.shuffle {
                self.queue.reshuffle(&mut self.rng);
            }

            match self
                .queue
                .next(false, self.repeat, self.shuffle, &mut self.rng, &self.opener)
                .await
            {
                Ok(Advance::Advanced) => {}
                Ok(Advance::EndOfQueue) | Err(_) => {
                    error!("Couldn't find anything to play!");
                    return Err(Error::QueueExhausted);
                }
            }

            let next_pkt = self.clock.next_pkt();
            let cs = self.queue.cur_streaming().unwrap();
            let item = self.queue.item_mut(cs);
            item.stream_start = next_pkt;
            item.output_start = next_pkt;
        }

        // Open local audio if the user has it selected
        if self.laudio_selected && self.laudio_status == SinkState::Closed {
            match self.sink.open() {
                Ok(()) => self.laudio_status = SinkState::Open,
                Err(e) => {
                    error!("Could not open local audio: {}", e);
                    return Err(e);
                }
            }
        }

        // Start sessions on selected remote devices
        for dev_id in self.registry.device_ids() {
            let spec = self.registry.with(|devs| {
                devs.get(&dev_id)
                    .filter(|d| d.selected && d.session.is_none())
                    .map(|d| d.spec())
            });

            if let Some(spec) = spec {
                match self.backend.device_start(&spec, self.clock.next_pkt()) {
                    Ok(()) => {
                        self.session_cbs.insert(dev_id, SessionCb::Restart);
                        self.launched_ops += 1;
                    }
                    Err(e) => {
                        warn!("Could not start selected device {}: {}", spec.name, e);
                    }
                }
            }
        }

        if self.laudio_status == SinkState::Closed
            && self.launched_ops == 0
            && self.raop_sessions == 0
        {
            error!("Could not start playback: no output selected or no output could start");
            return Err(Error::OutputFailed);
        }

        if self.launched_ops > 0 {
            return Ok(Disposition::Pending {
                reply: Reply::Started(chosen),
                bottom_half: Some(BottomHalf::Start),
            });
        }

        self.playback_start_bh().await?;
        Ok(Disposition::Done(Reply::Started(chosen)))
    }

    /// Playback startup bottom half: start local audio, stamp the clock,
    /// arm the pump timer, announce stream start to remote sessions.
    async fn playback_start_bh(&mut self) -> Result<()> {
        if self.laudio_status == SinkState::Closed && self.raop_sessions == 0 {
            error!("Cannot start playback: no output started");
            self.playback_stop();
            return Err(Error::OutputFailed);
        }

        // Local audio first: it can fail, and is easy to stop if the rest
        // of startup goes wrong
        if self.laudio_status == SinkState::Open {
            self.sink.set_volume(self.volume);

            match self.sink.start(self.clock.pb_pos, self.clock.next_pkt()) {
                Ok(()) => self.laudio_status = SinkState::Started,
                Err(e) => {
                    error!("Local audio failed to start: {}", e);
                    self.playback_stop();
                    return Err(e);
                }
            }
        }

        let now = Instant::now();
        self.clock.pb_pos_stamp = now;

        // First tick fires immediately; every later deadline is absolute
        self.next_tick = now;
        self.timer_armed = true;

        if self.raop_sessions > 0 {
            self.backend.playback_start(self.clock.next_pkt(), now);
        }

        self.status_update(PlayerState::Playing);

        Ok(())
    }

    /// Shared front half of pause/seek/next/prev.
    async fn pause_front(&mut self, bh: BottomHalf) -> Result<Disposition> {
        let pos = self.source_check();
        if pos == 0 {
            warn!("Could not retrieve current position for pause");
            self.playback_stop();
            return Ok(Disposition::Done(Reply::None));
        }

        // source_check may have stopped playback
        if self.state == PlayerState::Stopped {
            return Err(Error::InvalidState("stopped".to_string()));
        }

        let ps = self
            .queue
            .cur_playing()
            .or_else(|| self.queue.cur_streaming())
            .ok_or_else(|| Error::InvalidState("no current item".to_string()))?;

        // Store the pause position
        self.queue.item_mut(ps).end = pos;

        self.launched_ops = self.backend.flush(self.clock.next_pkt());
        if self.launched_ops > 0 {
            self.set_session_cbs(SessionCb::Command);
        }

        if self.laudio_status != SinkState::Closed {
            self.local_audio_stop();
        }

        self.timer_armed = false;

        let successors = self.queue.item(ps).play_next;
        self.queue.stop_chain(successors);

        self.queue.set_cur_playing(None);
        self.queue.set_cur_streaming(Some(ps));
        self.queue.item_mut(ps).play_next = None;

        self.stream_buf.clear();

        if self.launched_ops > 0 {
            return Ok(Disposition::Pending {
                reply: Reply::None,
                bottom_half: Some(bh),
            });
        }

        self.run_bottom_half(bh).await?;
        Ok(Disposition::Done(Reply::None))
    }

    fn playback_pause_bh(&mut self) -> Result<()> {
        let Some(ps) = self
            .queue
            .cur_playing()
            .or_else(|| self.queue.cur_streaming())
        else {
            return Err(Error::InvalidState("no current item".to_string()));
        };

        let next_pkt = self.clock.next_pkt();

        // Seek back to the position captured at pause
        let seek_result = {
            let item = self.queue.item_mut(ps);
            let pause_pos = item.end;
            item.end = 0;

            let ms = samples_to_ms(pause_pos.saturating_sub(item.stream_start)) as u32;
            match item.ctx.as_mut() {
                Some(ctx) => ctx.seek(ms),
                None => Err(Error::InvalidState("item has no open context".to_string())),
            }
        };

        let actual_ms = match seek_result {
            Ok(ms) => ms,
            Err(e) => {
                self.playback_stop();
                return Err(e);
            }
        };

        let item = self.queue.item_mut(ps);
        item.stream_start = next_pkt - ms_to_samples(u64::from(actual_ms));
        item.output_start = next_pkt;

        self.queue.set_cur_streaming(Some(ps));
        self.queue.set_cur_playing(None);

        self.status_update(PlayerState::Paused);

        Ok(())
    }

    fn playback_seek_bh(&mut self, ms: u32) -> Result<()> {
        let Some(ps) = self
            .queue
            .cur_playing()
            .or_else(|| self.queue.cur_streaming())
        else {
            return Err(Error::InvalidState("no current item".to_string()));
        };

        let next_pkt = self.clock.next_pkt();

        let seek_result = {
            let item = self.queue.item_mut(ps);
            item.end = 0;
            match item.ctx.as_mut() {
                Some(ctx) => ctx.seek(ms),
                None => Err(Error::InvalidState("item has no open context".to_string())),
            }
        };

        let actual_ms = match seek_result {
            Ok(ms) => ms,
            Err(e) => {
                self.playback_stop();
                return Err(e);
            }
        };

        let item = self.queue.item_mut(ps);
        item.stream_start = next_pkt - ms_to_samples(u64::from(actual_ms));
        item.output_start = next_pkt;

        self.queue.set_cur_streaming(Some(ps));
        self.queue.set_cur_playing(None);

        // Silent state change; the following start sends the real update
        self.state = PlayerState::Paused;

        Ok(())
    }

    async fn playback_next_bh(&mut self) -> Result<()> {
        let chain = self.queue.cur_playing().or_else(|| self.queue.cur_streaming());
        self.queue.stop_chain(chain);

        match self
            .queue
            .next(true, self.repeat, self.shuffle, &mut self.rng, &self.opener)
            .await
        {
            Ok(Advance::Advanced) => {}
            Ok(Advance::EndOfQueue) => {
                self.playback_stop();
                return Err(Error::InvalidState("end of playlist".to_string()));
            }
            Err(e) => {
                self.playback_stop();
                return Err(e);
            }
        }

        self.reposition_after_skip();
        Ok(())
    }

    async fn playback_prev_bh(&mut self) -> Result<()> {
        let chain = self.queue.cur_playing().or_else(|| self.queue.cur_streaming());
        self.queue.stop_chain(chain);

        match self.queue.prev(self.repeat, self.shuffle, &self.opener).await {
            Ok(Advance::Advanced) => {}
            Ok(Advance::EndOfQueue) => {
                self.playback_stop();
                return Err(Error::InvalidState("start of playlist".to_string()));
            }
            Err(e) => {
                self.playback_stop();
                return Err(e);
            }
        }

        self.reposition_after_skip();
        Ok(())
    }

    /// Common tail of next/prev: schedule the new item and leave the
    /// player silently Paused for the frontend's restart.
    fn reposition_after_skip(&mut self) {
        let next_pkt = self.clock.next_pkt();
        if let Some(cs) = self.queue.cur_streaming() {
            let item = self.queue.item_mut(cs);
            item.stream_start = next_pkt;
            item.output_start = next_pkt;
        }

        self.queue.set_cur_playing(None);
        self.state = PlayerState::Paused;
    }

    // ------------------------------------------------------------------
    // Output coordination

    fn speaker_enumerate(&mut self) -> Vec<SpeakerInfo> {
        // Auto-select local audio when no remote devices are known
        if self.registry.is_empty() {
            self.laudio_selected = true;
        }

        let mut speakers = vec![SpeakerInfo {
            id: LOCAL_OUTPUT_ID,
            name: self.local_name.clone(),
            selected: self.laudio_selected,
            needs_password: false,
        }];

        for dev in self.registry.snapshot() {
            if dev.advertised {
                speakers.push(SpeakerInfo {
                    id: dev.id,
                    name: dev.name,
                    selected: dev.selected,
                    needs_password: dev.has_password,
                });
            }
        }

        speakers
    }

    fn speaker_set(&mut self, ids: Vec<u64>) -> Result<Disposition> {
        debug!("Speaker set: {} outputs", ids.len());

        enum DeviceAction {
            None,
            Password,
            Activate(RemoteSpec),
            Deactivate(SessionId),
        }

        for dev_id in self.registry.device_ids() {
            let wanted = ids.contains(&dev_id);

            // Decide under the lock, act after dropping it
            let action = self.registry.with(|devs| {
                let Some(dev) = devs.get_mut(&dev_id) else {
                    return DeviceAction::None;
                };

                if wanted {
                    if dev.has_password && dev.password.is_none() {
                        info!(
                            "Device {} is password-protected, but we have no password",
                            dev.name
                        );
                        return DeviceAction::Password;
                    }

                    debug!("Device {} selected", dev.name);
                    dev.selected = true;

                    match dev.session {
                        None => DeviceAction::Activate(dev.spec()),
                        Some(_) => DeviceAction::None,
                    }
                } else {
                    debug!("Device {} not selected", dev.name);
                    dev.selected = false;

                    match dev.session {
                        Some(session) => DeviceAction::Deactivate(session),
                        None => DeviceAction::None,
                    }
                }
            });

            match action {
                DeviceAction::None => {}
                DeviceAction::Password => self.cmd_outcome.record_password(),
                DeviceAction::Activate(spec) => {
                    if self.speaker_activate_remote(&spec).is_err() {
                        error!("Could not activate device {}", spec.name);
                        self.registry.with(|devs| {
                            if let Some(dev) = devs.get_mut(&dev_id) {
                                dev.selected = false;
                            }
                        });
                        self.cmd_outcome.record_failure();
                    }
                }
                DeviceAction::Deactivate(session) => {
                    self.speaker_deactivate_remote(dev_id, session);
                }
            }
        }

        // Local output, reserved id 0
        if ids.contains(&LOCAL_OUTPUT_ID) {
            debug!("Local audio selected");
            self.laudio_selected = true;

            if !self.laudio_status.is_started() {
                if let Err(e) = self.speaker_activate_local() {
                    error!("Could not activate local audio output: {}", e);
                    self.laudio_selected = false;
                    self.cmd_outcome.record_failure();
                }
            }
        } else {
            debug!("Local audio not selected");
            self.laudio_selected = false;

            if self.laudio_status != SinkState::Closed {
                self.speaker_deactivate_local();
            }
        }

        if self.launched_ops > 0 {
            return Ok(Disposition::Pending {
                reply: Reply::None,
                bottom_half: None,
            });
        }

        Ok(Disposition::Done(Reply::None))
    }

    fn speaker_activate_remote(&mut self, spec: &RemoteSpec) -> Result<()> {
        if self.state == PlayerState::Playing {
            debug!("Activating remote device {}", spec.name);
            self.backend.device_start(spec, self.clock.next_pkt())?;
            self.session_cbs.insert(spec.id, SessionCb::Activate);
        } else {
            debug!("Probing remote device {}", spec.name);
            self.backend.device_probe(spec)?;
            self.session_cbs.insert(spec.id, SessionCb::Probe);
        }

        self.launched_ops += 1;
        Ok(())
    }

    fn speaker_deactivate_remote(&mut self, dev_id: DeviceId, session: SessionId) {
        debug!("Deactivating remote device {:x}", dev_id);
        self.session_cbs.insert(dev_id, SessionCb::Shutdown);
        self.backend.device_stop(session);
        self.launched_ops += 1;
    }

    fn speaker_activate_local(&mut self) -> Result<()> {
        debug!("Activating local audio");

        if self.laudio_status == SinkState::Closed {
            self.sink.open()?;
            self.laudio_status = SinkState::Open;
        }

        if self.state == PlayerState::Playing {
            self.sink.set_volume(self.volume);

            let (pos, _) = self.current_pos(false);
            if let Err(e) = self.sink.start(pos, self.clock.next_pkt()) {
                error!("Local playback failed to start: {}", e);
                self.sink.close();
                self.laudio_status = SinkState::Closed;
                return Err(e);
            }
            self.laudio_status = SinkState::Started;
        }

        Ok(())
    }

    fn speaker_deactivate_local(&mut self) {
        debug!("Deactivating local audio");

        if self.laudio_status == SinkState::Closed {
            return;
        }

        if self.laudio_status.is_started() {
            self.local_audio_stop();
        }

        self.sink.close();
        self.laudio_status = SinkState::Closed;
    }

    async fn volume_set(&mut self, volume: u8) -> Result<Disposition> {
        self.volume = volume.min(100);

        self.launched_ops = self.backend.set_volume(self.volume);
        if self.launched_ops > 0 {
            self.set_session_cbs(SessionCb::Command);
        }

        self.sink.set_volume(self.volume);

        if let Err(e) = db::settings::save_volume(&self.db, self.volume).await {
            warn!("Could not save volume setting to database: {}", e);
        }

        if self.launched_ops > 0 {
            return Ok(Disposition::Pending {
                reply: Reply::None,
                bottom_half: None,
            });
        }

        Ok(Disposition::Done(Reply::None))
    }

    /// Register `cb` for every device with an active session.
    fn set_session_cbs(&mut self, cb: SessionCb) {
        let ids = self.registry.with(|devs| {
            devs.values()
                .filter(|d| d.session.is_some())
                .map(|d| d.id)
                .collect::<Vec<_>>()
        });

        for id in ids {
            self.session_cbs.insert(id, cb);
        }
    }

    // ------------------------------------------------------------------
    // Remote session callbacks (player thread)

    async fn handle_session_event(&mut self, ev: SessionEvent) {
        let cb = self
            .session_cbs
            .get(&ev.device_id)
            .copied()
            .unwrap_or(SessionCb::Streaming);

        match cb {
            SessionCb::Streaming => self.device_streaming_cb(ev),
            SessionCb::Command => self.device_command_cb(ev).await,
            SessionCb::Activate => self.device_activate_cb(ev).await,
            SessionCb::Probe => self.device_probe_cb(ev).await,
            SessionCb::Restart => self.device_restart_cb(ev).await,
            SessionCb::Shutdown => self.device_shutdown_cb(ev).await,
            SessionCb::Lost => self.device_lost_cb(ev),
        }
    }

    fn device_streaming_cb(&mut self, ev: SessionEvent) {
        match ev.status {
            SessionStatus::Failed => {
                self.raop_sessions = self.raop_sessions.saturating_sub(1);

                if !self.registry.contains(ev.device_id) {
                    warn!("Remote device disappeared during streaming!");
                    return;
                }

                error!("Remote device {:x} failed", ev.device_id);

                let playing = self.state == PlayerState::Playing;
                self.registry.with(|devs| {
                    if let Some(dev) = devs.get_mut(&ev.device_id) {
                        if playing {
                            dev.selected = false;
                        }
                        dev.session = None;
                    }
                });
                self.registry.remove_if_defunct(ev.device_id);
                self.session_cbs.remove(&ev.device_id);
            }

            SessionStatus::Stopped => {
                self.raop_sessions = self.raop_sessions.saturating_sub(1);

                if !self.registry.contains(ev.device_id) {
                    warn!("Remote device disappeared during streaming!");
                    return;
                }

                info!("Remote device {:x} stopped", ev.device_id);

                self.registry.with(|devs| {
                    if let Some(dev) = devs.get_mut(&ev.device_id) {
                        dev.session = None;
                    }
                });
                self.registry.remove_if_defunct(ev.device_id);
                self.session_cbs.remove(&ev.device_id);
            }

            _ => {}
        }
    }

    /// Completion of a flush/volume fan-out for one session.
    async fn device_command_cb(&mut self, ev: SessionEvent) {
        self.session_cbs.insert(ev.device_id, SessionCb::Streaming);

        if ev.status == SessionStatus::Failed {
            self.device_streaming_cb(ev);
        }

        self.complete_pending_op().await;
    }

    async fn device_shutdown_cb(&mut self, ev: SessionEvent) {
        if self.raop_sessions > 0 {
            self.raop_sessions -= 1;
        }

        if !self.registry.contains(ev.device_id) {
            warn!("Remote device disappeared before shutdown completion!");
            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_failure();
            }
        } else {
            self.registry.with(|devs| {
                if let Some(dev) = devs.get_mut(&ev.device_id) {
                    dev.session = None;
                }
            });
            self.registry.remove_if_defunct(ev.device_id);
        }

        self.session_cbs.remove(&ev.device_id);
        self.complete_pending_op().await;
    }

    async fn device_activate_cb(&mut self, ev: SessionEvent) {
        let mut status = ev.status;

        if !self.registry.contains(ev.device_id) {
            warn!("Remote device disappeared during startup!");
            self.session_cbs.insert(ev.device_id, SessionCb::Lost);
            self.backend.device_stop(ev.session);

            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_failure();
            }
            self.complete_pending_op().await;
            return;
        }

        if status == SessionStatus::Password {
            status = SessionStatus::Failed;
            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_password();
            }
        }

        if status == SessionStatus::Failed {
            self.registry.with(|devs| {
                if let Some(dev) = devs.get_mut(&ev.device_id) {
                    dev.selected = false;
                }
            });
            self.registry.remove_if_defunct(ev.device_id);
            self.session_cbs.remove(&ev.device_id);

            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_failure();
            }
            self.complete_pending_op().await;
            return;
        }

        self.registry.with(|devs| {
            if let Some(dev) = devs.get_mut(&ev.device_id) {
                dev.session = Some(ev.session);
            }
        });
        self.raop_sessions += 1;

        // First session joining live playback gets the stream anchor now
        if self.state == PlayerState::Playing && self.raop_sessions == 1 {
            self.backend.playback_start(self.clock.next_pkt(), Instant::now());
        }

        self.session_cbs.insert(ev.device_id, SessionCb::Streaming);
        self.complete_pending_op().await;
    }

    async fn device_probe_cb(&mut self, ev: SessionEvent) {
        let mut status = ev.status;

        if !self.registry.contains(ev.device_id) {
            warn!("Remote device disappeared during probe!");
            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_failure();
            }
            self.session_cbs.remove(&ev.device_id);
            self.complete_pending_op().await;
            return;
        }

        if status == SessionStatus::Password {
            status = SessionStatus::Failed;
            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_password();
            }
        }

        if status == SessionStatus::Failed {
            self.registry.with(|devs| {
                if let Some(dev) = devs.get_mut(&ev.device_id) {
                    dev.selected = false;
                }
            });
            self.registry.remove_if_defunct(ev.device_id);

            if let Some(outcome) = self.pending_outcome_mut() {
                outcome.record_failure();
            }
        }

        self.session_cbs.remove(&ev.device_id);
        self.complete_pending_op().await;
    }

    /// Session start launched by playback_start; failures are tolerated
    /// as long as some output comes up (the bottom half decides).
    async fn device_restart_cb(&mut self, ev: SessionEvent) {
        if !self.registry.contains(ev.device_id) {
            warn!("Remote device disappeared during restart!");
            self.session_cbs.insert(ev.device_id, SessionCb::Lost);
            self.backend.device_stop(ev.session);
            self.complete_pending_op().await;
            return;
        }

        if matches!(ev.status, SessionStatus::Failed | SessionStatus::Password) {
            self.registry.with(|devs| {
                if let Some(dev) = devs.get_mut(&ev.device_id) {
                    dev.selected = false;
                }
            });
            self.registry.remove_if_defunct(ev.device_id);
            self.session_cbs.remove(&ev.device_id);
            self.complete_pending_op().await;
            return;
        }

        self.registry.with(|devs| {
            if let Some(dev) = devs.get_mut(&ev.device_id) {
                dev.session = Some(ev.session);
            }
        });
        self.raop_sessions += 1;
        self.session_cbs.insert(ev.device_id, SessionCb::Streaming);
        self.complete_pending_op().await;
    }

    /// A device that vanished mid-operation finally reported back.
    fn device_lost_cb(&mut self, ev: SessionEvent) {
        if ev.status == SessionStatus::Failed {
            warn!("Failed to stop lost device");
        } else {
            info!("Lost device stopped properly");
        }
        self.session_cbs.remove(&ev.device_id);
    }
}
