//! Reorders concurrently transformed camera frames into capture order.
//!
//! Frames get a sequence number when they arrive and are transformed on the
//! blocking pool, so they complete in any order. A periodic ticker hands them to
//! the delivery target strictly in sequence order. A frame that never completes
//! can hold up at most `backlog_bound` later frames: past that the ticker skips
//! ahead and the late frame is dropped as stale when it finally shows up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::frame::{CameraFrame, PendingFrame, transform};

#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub tick_period: Duration,
    /// Pending frames allowed to wait behind a gap before the ticker skips it.
    pub backlog_bound: usize,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(50),
            backlog_bound: 3,
        }
    }
}

enum Slot {
    Ready(PendingFrame),
    /// The transform failed, nothing will ever arrive for this number.
    Skipped,
}

/// The pending map and delivery cursor, without any threading.
#[derive(Default)]
pub struct SequencerState {
    pending: BTreeMap<u64, Slot>,
    next_to_deliver: u64,
    closed: bool,
    stale_dropped: u64,
}

impl SequencerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a completed frame. Returns false when it was discarded, either
    /// because the cursor already moved past it or the sequencer is closed.
    pub fn insert(&mut self, frame: PendingFrame) -> bool {
        if self.closed || frame.seq < self.next_to_deliver {
            self.stale_dropped += 1;
            return false;
        }
        self.pending.insert(frame.seq, Slot::Ready(frame));
        true
    }

    /// Mark a sequence number as never arriving.
    pub fn skip(&mut self, seq: u64) -> bool {
        if self.closed || seq < self.next_to_deliver {
            return false;
        }
        self.pending.insert(seq, Slot::Skipped);
        true
    }

    /// Collect the frames that are due, in sequence order.
    pub fn tick(&mut self, backlog_bound: usize) -> Vec<PendingFrame> {
        let mut out = Vec::new();
        self.drain_consecutive(&mut out);
        while self.pending.len() > backlog_bound {
            let Some((seq, slot)) = self.pending.pop_first() else {
                break;
            };
            log::debug!(
                "sequencer backlog over {}, skipping to {}",
                backlog_bound,
                seq
            );
            self.next_to_deliver = seq + 1;
            if let Slot::Ready(frame) = slot {
                out.push(frame);
            }
            self.drain_consecutive(&mut out);
        }
        out
    }

    fn drain_consecutive(&mut self, out: &mut Vec<PendingFrame>) {
        while let Some(slot) = self.pending.remove(&self.next_to_deliver) {
            self.next_to_deliver += 1;
            if let Slot::Ready(frame) = slot {
                out.push(frame);
            }
        }
    }

    /// Stop accepting frames and drop whatever is still pending.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn next_to_deliver(&self) -> u64 {
        self.next_to_deliver
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub type DeliverFn = Arc<dyn Fn(PendingFrame) + Send + Sync>;

pub struct FrameSequencer {
    state: Arc<Mutex<SequencerState>>,
    next_to_assign: AtomicU64,
    settings: SequencerSettings,
    handle: Handle,
    cancel: CancellationToken,
    ticker: JoinHandle<()>,
    deliver: DeliverFn,
}

impl FrameSequencer {
    /// Start the ticker. Must be called from within a tokio runtime; the
    /// delivery target is fixed for the sequencer's lifetime.
    pub fn start(settings: SequencerSettings, deliver: DeliverFn) -> Self {
        let state = Arc::new(Mutex::new(SequencerState::new()));
        let cancel = CancellationToken::new();
        let handle = Handle::current();
        let ticker = handle.spawn(Self::tick_loop(
            state.clone(),
            settings.clone(),
            cancel.clone(),
            deliver.clone(),
        ));
        log::info!(
            "frame sequencer started, tick {:?}, backlog bound {}",
            settings.tick_period,
            settings.backlog_bound
        );
        Self {
            state,
            next_to_assign: AtomicU64::new(0),
            settings,
            handle,
            cancel,
            ticker,
            deliver,
        }
    }

    /// Assign the next sequence number and hand the frame to a transform
    /// worker. Never blocks on the transform.
    pub fn add_frame(&self, frame: CameraFrame) -> u64 {
        let seq = self.next_to_assign.fetch_add(1, Ordering::Relaxed);
        let captured_at = Instant::now();
        let state = self.state.clone();
        self.handle.spawn_blocking(move || match transform(frame, seq, captured_at) {
            Ok(pending) => {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if !state.insert(pending) {
                    log::debug!(
                        "frame {} completed after cursor {}, dropped",
                        seq,
                        state.next_to_deliver()
                    );
                }
            }
            Err(e) => {
                log::warn!("frame {} transform failed: {}", seq, e);
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .skip(seq);
            }
        });
        seq
    }

    pub fn frames_assigned(&self) -> u64 {
        self.next_to_assign.load(Ordering::Relaxed)
    }

    async fn tick_loop(
        state: Arc<Mutex<SequencerState>>,
        settings: SequencerSettings,
        cancel: CancellationToken,
        deliver: DeliverFn,
    ) {
        let mut interval = tokio::time::interval(settings.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let due = state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .tick(settings.backlog_bound);
                    for frame in due {
                        deliver(frame);
                    }
                }
            }
        }
    }

    /// Stop the ticker, deliver what is due one last time, then close. Transforms
    /// still running are discarded when they complete.
    pub async fn shutdown(self) {
        let assigned = self.frames_assigned();
        self.cancel.cancel();
        if let Err(e) = self.ticker.await {
            log::warn!("sequencer ticker ended abnormally: {}", e);
        }
        let (due, dropped, stale) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let due = state.tick(self.settings.backlog_bound);
            let dropped = state.close();
            (due, dropped, state.stale_dropped())
        };
        for frame in due {
            (self.deliver)(frame);
        }
        log::info!(
            "frame sequencer stopped, {} frames assigned, {} pending dropped, {} stale",
            assigned,
            dropped,
            stale
        );
    }
}

#[cfg(test)]
#[path = "sequencer_test.rs"]
mod sequencer_test;
