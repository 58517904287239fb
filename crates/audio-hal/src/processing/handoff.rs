//! Downlink handoff mailbox
//!
//! The echo canceller needs time-aligned downlink and uplink audio, so
//! the playback (producer) and capture (consumer) threads rendezvous
//! through a single-slot mailbox. Every wait is bounded: the producer
//! blocks on a condition variable with a timeout and the consumer uses
//! short sleep-and-retry, so neither path can hang the other forever.
//! An audible glitch is preferred over a deadlock.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::hw::{SharedSinks, SinkId};
use crate::Sample;

/// One published downlink buffer plus the sink the processed audio must
/// eventually reach.
struct Frame {
    data: Vec<Sample>,
    read: usize,
    sinks: SharedSinks,
    sink: SinkId,
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    poisoned: bool,
}

/// Result of one consumer pull
pub struct Pull {
    /// Sink handle of the frame the samples came from, if any data was
    /// available
    pub target: Option<(SharedSinks, SinkId)>,
    /// Sub-frame remainder spilled out when the producer was released
    /// early; the caller carries it into the next processing frame
    pub spill: Vec<Sample>,
}

/// Single-slot bounded producer/consumer mailbox
pub struct DownlinkMailbox {
    slot: Mutex<Slot>,
    drained: Condvar,
}

impl DownlinkMailbox {
    /// An empty mailbox
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            drained: Condvar::new(),
        }
    }

    /// Publish a downlink buffer and block until the consumer drains it
    /// or `timeout` elapses. Returns the number of samples consumed; on
    /// timeout the unconsumed remainder is discarded with a warning so
    /// playback pacing is preserved.
    pub fn publish(
        &self,
        data: Vec<Sample>,
        sinks: SharedSinks,
        sink: SinkId,
        timeout: Duration,
    ) -> usize {
        let total = data.len();
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        slot.poisoned = false;
        slot.frame = Some(Frame {
            data,
            read: 0,
            sinks,
            sink,
        });

        loop {
            if slot.poisoned {
                debug!("downlink mailbox poisoned, releasing producer");
                break;
            }
            let consumed = match &slot.frame {
                None => total,
                Some(f) => f.read,
            };
            if consumed >= total {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("downlink buffer not consumed within {:?}", timeout);
                break;
            }
            if self.drained.wait_until(&mut slot, deadline).timed_out() {
                warn!("downlink buffer not consumed within {:?}", timeout);
                break;
            }
        }

        if slot.poisoned {
            slot.frame = None;
            return 0;
        }
        match slot.frame.take() {
            // fully drained by the consumer
            None => total,
            Some(f) => f.read,
        }
    }

    /// True when a frame is currently published
    pub fn has_frame(&self) -> bool {
        self.slot.lock().frame.is_some()
    }

    /// Pull up to `needed - dst.len()` samples into `dst`.
    ///
    /// When the pull leaves the published frame with less than
    /// `frame_size` samples, the remainder is spilled into the return
    /// value and the producer is released immediately. It must not
    /// stay blocked on a fragment smaller than one processing frame.
    pub fn pull(&self, dst: &mut Vec<Sample>, needed: usize, frame_size: usize) -> Pull {
        let mut slot = self.slot.lock();
        let mut result = Pull {
            target: None,
            spill: Vec::new(),
        };
        let Some(frame) = slot.frame.as_mut() else {
            return result;
        };
        result.target = Some((frame.sinks.clone(), frame.sink));

        let want = needed.saturating_sub(dst.len());
        let avail = frame.data.len() - frame.read;
        let take = want.min(avail);
        dst.extend_from_slice(&frame.data[frame.read..frame.read + take]);
        frame.read += take;

        let remaining = frame.data.len() - frame.read;
        if remaining < frame_size {
            if remaining > 0 {
                result.spill.extend_from_slice(&frame.data[frame.read..]);
                frame.read = frame.data.len();
            }
            slot.frame = None;
            self.drained.notify_all();
        }
        result
    }

    /// Unblock a waiting producer and drop any published frame.
    ///
    /// Used on standby so the playback thread can never stay parked on
    /// a capture path that is going away.
    pub fn poison(&self) {
        let mut slot = self.slot.lock();
        slot.frame = None;
        slot.poisoned = true;
        self.drained.notify_all();
    }
}

impl Default for DownlinkMailbox {
    fn default() -> Self {
        Self::new()
    }
}
