//! Source queue
//!
//! The play queue is one set of items threaded onto two independent
//! cyclic rings: playlist order and shuffle order. Nodes live in an
//! arena (a Vec indexed by position) and carry neighbor indices for both
//! rings, so there is exactly one owner for every item no matter how many
//! orders it participates in.
//!
//! Two cursors walk the rings. `cur_streaming` is the item currently
//! being transcoded; `cur_playing` is the item currently audible at the
//! outputs. During the pre-roll window the streaming cursor runs ahead of
//! the playing cursor across item boundaries; the transient `play_next`
//! chain links the two so crossovers replay in emission order.

use crate::error::{Error, Result};
use crate::transcode::Transcode;
use ensemble_common::events::RepeatMode;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Arena index of a queue item.
pub type ItemIdx = usize;

/// Opens a transcoding context for a media id.
///
/// Failure (unknown id, disabled file, codec error) makes the caller skip
/// to the next candidate.
pub trait SourceOpen {
    fn open<'a>(
        &'a self,
        id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Transcode>>> + 'a>>;
}

/// One queue entry.
pub struct SourceItem {
    /// Media identifier
    pub id: u32,
    /// Sample index at which this item's first sample was scheduled
    pub stream_start: u64,
    /// Sample index at which this item becomes "now playing"
    pub output_start: u64,
    /// Sample index of the item's last emitted sample; 0 = not yet ended
    pub end: u64,
    /// Open transcoder context (present iff the item is open)
    pub ctx: Option<Box<dyn Transcode>>,
    /// Scheduled successor while a crossover is mid-flight
    pub play_next: Option<ItemIdx>,

    pl_prev: ItemIdx,
    pl_next: ItemIdx,
    sh_prev: ItemIdx,
    sh_next: ItemIdx,
}

/// Result of a cursor move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The streaming cursor moved (or the current item was restarted)
    Advanced,
    /// End of queue under repeat-off; the caller must stop playback
    EndOfQueue,
}

/// Result of a source check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Nothing crossed a boundary
    Idle,
    /// The audible item changed (promotion or crossover); emit Playing
    NowPlaying,
    /// Playback ran off the end of the queue; the caller must stop
    Stop,
}

/// The play queue: one arena, two rings, two cursors.
#[derive(Default)]
pub struct SourceQueue {
    items: Vec<SourceItem>,
    /// Playlist ring wrap point
    head: Option<ItemIdx>,
    /// Shuffle ring wrap point
    shuffle_head: Option<ItemIdx>,
    /// Item currently audible at the outputs
    cur_playing: Option<ItemIdx>,
    /// Item currently being transcoded
    cur_streaming: Option<ItemIdx>,
}

impl SourceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when the playlist ring has exactly one item.
    pub fn single_item(&self) -> bool {
        self.head
            .is_some_and(|head| self.items[head].pl_next == head)
    }

    pub fn head(&self) -> Option<ItemIdx> {
        self.head
    }

    pub fn shuffle_head(&self) -> Option<ItemIdx> {
        self.shuffle_head
    }

    pub fn set_shuffle_head(&mut self, idx: Option<ItemIdx>) {
        self.shuffle_head = idx;
    }

    pub fn cur_playing(&self) -> Option<ItemIdx> {
        self.cur_playing
    }

    pub fn cur_streaming(&self) -> Option<ItemIdx> {
        self.cur_streaming
    }

    pub fn set_cur_playing(&mut self, idx: Option<ItemIdx>) {
        self.cur_playing = idx;
    }

    pub fn set_cur_streaming(&mut self, idx: Option<ItemIdx>) {
        self.cur_streaming = idx;
    }

    pub fn item(&self, idx: ItemIdx) -> &SourceItem {
        &self.items[idx]
    }

    pub fn item_mut(&mut self, idx: ItemIdx) -> &mut SourceItem {
        &mut self.items[idx]
    }

    /// Append a batch of media ids.
    ///
    /// Playlist order follows the slice; the batch's shuffle order is an
    /// independent Fisher-Yates permutation drawn from `rng`. Both
    /// sub-rings are spliced in front of their respective heads; an empty
    /// queue adopts the batch outright.
    pub fn append(&mut self, ids: &[u32], rng: &mut SmallRng) {
        if ids.is_empty() {
            return;
        }

        let first = self.items.len();
        for &id in ids {
            let idx = self.items.len();
            self.items.push(SourceItem {
                id,
                stream_start: 0,
                output_start: 0,
                end: 0,
                ctx: None,
                play_next: None,
                pl_prev: idx,
                pl_next: idx,
                sh_prev: idx,
                sh_next: idx,
            });
        }
        let batch: Vec<ItemIdx> = (first..self.items.len()).collect();

        // Cyclic playlist sub-ring in slice order
        self.link_ring(&batch, false);

        // Independent shuffle order for the new items
        let mut shuffled = batch.clone();
        shuffled.shuffle(rng);
        self.link_ring(&shuffled, true);

        match (self.head, self.shuffle_head) {
            (Some(head), Some(shead)) => {
                self.splice_before(head, batch[0], false);
                self.splice_before(shead, shuffled[0], true);
            }
            _ => {
                self.head = Some(batch[0]);
                self.shuffle_head = Some(shuffled[0]);
            }
        }

        debug!("Queue now holds {} items", self.items.len());
    }

    /// Link `order` into a cyclic ring on the playlist or shuffle links.
    fn link_ring(&mut self, order: &[ItemIdx], shuffle: bool) {
        let n = order.len();
        for (i, &idx) in order.iter().enumerate() {
            let prev = order[(i + n - 1) % n];
            let next = order[(i + 1) % n];
            let item = &mut self.items[idx];
            if shuffle {
                item.sh_prev = prev;
                item.sh_next = next;
            } else {
                item.pl_prev = prev;
                item.pl_next = next;
            }
        }
    }

    /// Splice the cyclic sub-ring starting at `sub` in front of `at`.
    fn splice_before(&mut self, at: ItemIdx, sub: ItemIdx, shuffle: bool) {
        if shuffle {
            let tail = self.items[at].sh_prev;
            let sub_tail = self.items[sub].sh_prev;

            self.items[tail].sh_next = sub;
            self.items[sub].sh_prev = tail;
            self.items[sub_tail].sh_next = at;
            self.items[at].sh_prev = sub_tail;
        } else {
            let tail = self.items[at].pl_prev;
            let sub_tail = self.items[sub].pl_prev;

            self.items[tail].pl_next = sub;
            self.items[sub].pl_prev = tail;
            self.items[sub_tail].pl_next = at;
            self.items[at].pl_prev = sub_tail;
        }
    }

    /// Drop every item, closing any open transcoder contexts, and reset
    /// heads and cursors.
    pub fn clear(&mut self) {
        self.items.clear();
        self.head = None;
        self.shuffle_head = None;
        self.cur_playing = None;
        self.cur_streaming = None;
    }

    /// Rebuild the shuffle ring with a fresh Fisher-Yates permutation of
    /// the playlist ring. The new shuffle head is the streaming item when
    /// one exists, else the permutation's first element.
    pub fn reshuffle(&mut self, rng: &mut SmallRng) {
        let Some(_) = self.head else { return };

        let mut order = self.playlist_indices();
        order.shuffle(rng);
        self.link_ring(&order, true);

        self.shuffle_head = self.cur_streaming.or(Some(order[0]));
    }

    /// Arena indices in playlist-ring order starting at the head.
    pub fn playlist_indices(&self) -> Vec<ItemIdx> {
        let mut order = Vec::with_capacity(self.items.len());
        let Some(head) = self.head else { return order };

        let mut idx = head;
        loop {
            order.push(idx);
            idx = self.items[idx].pl_next;
            if idx == head {
                break;
            }
        }
        order
    }

    /// Arena indices in shuffle-ring order starting at the shuffle head.
    pub fn shuffle_indices(&self) -> Vec<ItemIdx> {
        let mut order = Vec::with_capacity(self.items.len());
        let Some(head) = self.shuffle_head else { return order };

        let mut idx = head;
        loop {
            order.push(idx);
            idx = self.items[idx].sh_next;
            if idx == head {
                break;
            }
        }
        order
    }

    /// Position of `target` along the playlist ring from the head.
    pub fn position(&self, target: ItemIdx) -> usize {
        let mut count = 0;
        let Some(head) = self.head else { return 0 };

        let mut idx = head;
        while idx != target {
            count += 1;
            idx = self.items[idx].pl_next;
            if idx == head {
                break;
            }
        }
        count
    }

    /// Walk `steps` along the playlist ring from the head.
    pub fn walk_from_head(&self, steps: u32) -> Option<ItemIdx> {
        let mut idx = self.head?;
        for _ in 0..steps {
            idx = self.items[idx].pl_next;
        }
        Some(idx)
    }

    /// Close contexts along the `play_next` chain starting at `start`,
    /// clearing the chain links.
    pub fn stop_chain(&mut self, start: Option<ItemIdx>) {
        let mut cur = start;
        while let Some(idx) = cur {
            let item = &mut self.items[idx];
            item.ctx = None;
            cur = item.play_next.take();
        }
    }

    /// Open `idx` for streaming, resetting its scheduling fields.
    pub async fn open_item(&mut self, idx: ItemIdx, opener: &dyn SourceOpen) -> Result<()> {
        let id = {
            let item = &mut self.items[idx];
            item.stream_start = 0;
            item.output_start = 0;
            item.end = 0;
            item.play_next = None;
            item.id
        };

        let ctx = opener.open(id).await?;
        self.items[idx].ctx = Some(ctx);
        Ok(())
    }

    /// Move the streaming cursor to the next item.
    ///
    /// `force` marks a user action (skip) as opposed to natural
    /// end-of-item advance; it flips Song repeat into All and arms the
    /// repeat-off end-of-playlist stop.
    pub async fn next(
        &mut self,
        force: bool,
        repeat: RepeatMode,
        shuffle: bool,
        rng: &mut SmallRng,
        opener: &dyn SourceOpen,
    ) -> Result<Advance> {
        let head = if shuffle { self.shuffle_head } else { self.head };
        let Some(head) = head else {
            return Err(Error::QueueEmpty);
        };

        let mut r_mode = repeat;

        // Force repeat mode at user request
        if force && r_mode == RepeatMode::Song {
            r_mode = RepeatMode::All;
        }

        // Single-item queue: All behaves as Song; under repeat-off a
        // natural advance also restarts the item so the next source check
        // observes end-of-queue and stops.
        if r_mode == RepeatMode::All && self.single_item() {
            r_mode = RepeatMode::Song;
        } else if !force && r_mode == RepeatMode::Off && self.single_item() {
            r_mode = RepeatMode::Song;
        }

        let mut ps = match self.cur_streaming {
            None => head,
            Some(cur) => {
                if shuffle {
                    self.items[cur].sh_next
                } else {
                    self.items[cur].pl_next
                }
            }
        };

        let limit;
        match r_mode {
            RepeatMode::Song => {
                if let Some(cur) = self.cur_streaming {
                    if self.items[cur].ctx.is_some() {
                        self.items[cur]
                            .ctx
                            .as_mut()
                            .unwrap()
                            .seek(0)
                            .map_err(|e| {
                                debug!("Failed to restart song for song repeat: {}", e);
                                e
                            })?;
                    } else {
                        self.open_item(cur, opener).await?;
                    }
                    return Ok(Advance::Advanced);
                }
                // No cursor yet: open from the head
                limit = head;
            }

            RepeatMode::All => {
                if !shuffle {
                    limit = ps;
                } else {
                    // Reshuffle before repeating the playlist
                    if self.cur_streaming.is_some() && Some(ps) == self.shuffle_head {
                        self.reshuffle(rng);
                        ps = self.shuffle_head.unwrap();
                    }
                    limit = self.shuffle_head.unwrap();
                }
            }

            RepeatMode::Off => {
                limit = head;
                if force && ps == limit {
                    debug!("End of playlist reached and repeat is off");
                    return Ok(Advance::EndOfQueue);
                }
            }
        }

        // Try candidates in order, skipping failed opens, until the wrap
        // limit comes around again.
        loop {
            match self.open_item(ps, opener).await {
                Ok(()) => break,
                Err(_) => {
                    ps = if shuffle {
                        self.items[ps].sh_next
                    } else {
                        self.items[ps].pl_next
                    };
                    if ps == limit {
                        return Err(Error::QueueExhausted);
                    }
                }
            }
        }

        if !force {
            if let Some(cur) = self.cur_streaming {
                self.items[cur].play_next = Some(ps);
            }
        }
        self.cur_streaming = Some(ps);

        Ok(Advance::Advanced)
    }

    /// Move the streaming cursor to the previous item.
    ///
    /// Never reshuffles; repeat-off at the head stops playback.
    pub async fn prev(
        &mut self,
        repeat: RepeatMode,
        shuffle: bool,
        opener: &dyn SourceOpen,
    ) -> Result<Advance> {
        let Some(cur) = self.cur_streaming else {
            return Err(Error::InvalidState("no streaming item".to_string()));
        };

        let head = if shuffle { self.shuffle_head } else { self.head }.unwrap();

        if repeat == RepeatMode::Off && cur == head {
            debug!("Start of playlist reached and repeat is off");
            return Ok(Advance::EndOfQueue);
        }

        let mut ps = if shuffle {
            self.items[cur].sh_prev
        } else {
            self.items[cur].pl_prev
        };
        let limit = ps;

        loop {
            match self.open_item(ps, opener).await {
                Ok(()) => break,
                Err(_) => {
                    ps = if shuffle {
                        self.items[ps].sh_prev
                    } else {
                        self.items[ps].pl_prev
                    };
                    if ps == limit {
                        return Err(Error::QueueExhausted);
                    }
                }
            }
        }

        self.cur_streaming = Some(ps);

        Ok(Advance::Advanced)
    }

    /// Advance the audible cursor past any item boundaries `pos` has
    /// crossed.
    ///
    /// Handles the pre-roll promotion of the streaming item, repeat-song
    /// restarts (including a repeat toggled inside the final pre-roll
    /// window), and multi-item crossovers along the `play_next` chain.
    pub fn check(&mut self, pos: u64, repeat: RepeatMode, shuffle: bool) -> CheckOutcome {
        let Some(streaming) = self.cur_streaming else {
            return CheckOutcome::Idle;
        };

        let Some(playing) = self.cur_playing else {
            if pos >= self.items[streaming].output_start {
                self.cur_playing = Some(streaming);
                return CheckOutcome::NowPlaying;
            }
            return CheckOutcome::Idle;
        };

        if self.items[playing].end == 0 || pos < self.items[playing].end {
            return CheckOutcome::Idle;
        }

        let mut r_mode = repeat;
        if r_mode == RepeatMode::All && self.single_item() {
            r_mode = RepeatMode::Song;
        }

        if r_mode == RepeatMode::Song {
            let ps = playing;
            let old_end = self.items[ps].end;

            // Repeat was toggled inside the final pre-roll window and the
            // streaming cursor already moved on; follow it.
            if let Some(next) = self.items[ps].play_next {
                self.cur_playing = Some(next);
                self.items[ps].ctx = None;
                self.items[ps].play_next = None;
            }

            let cur = self.cur_playing.unwrap();
            self.items[cur].stream_start = old_end + 1;
            self.items[cur].output_start = old_end + 1;

            // The old node resets its end, not the (possibly new) current
            self.items[ps].end = 0;

            return CheckOutcome::NowPlaying;
        }

        let head = if shuffle { self.shuffle_head } else { self.head };
        let mut crossed = false;

        loop {
            let playing = match self.cur_playing {
                Some(idx) => idx,
                None => break,
            };
            let end = self.items[playing].end;
            if end == 0 || pos <= end {
                break;
            }

            let next = self.items[playing].play_next;

            // Stop at the end of the playlist, or on wraparound with
            // repeat off.
            let stop = match next {
                None => true,
                Some(n) => r_mode == RepeatMode::Off && Some(n) == head,
            };
            if stop {
                return CheckOutcome::Stop;
            }

            let next = next.unwrap();
            self.cur_playing = Some(next);
            self.items[next].stream_start = end + 1;
            self.items[next].output_start = end + 1;

            self.items[playing].ctx = None;
            self.items[playing].play_next = None;

            crossed = true;
        }

        if crossed {
            debug!("Playback switched to next song");
            CheckOutcome::NowPlaying
        } else {
            CheckOutcome::Idle
        }
    }
}
