//! Decoded-frame ring queue with keep-last-shown retention.
//!
//! A fixed-capacity circular buffer sitting between a decode driver and a
//! consumer loop. Slots are overwritten in place, payloads are moved in and
//! out rather than copied, and the most recently displayed entry stays
//! addressable as "last" after logical consumption so the refresh scheduler
//! can interpolate durations between consecutive frames.
//!
//! Each frame queue is coupled to the packet queue feeding its decoder:
//! blocking waits observe the packet queue's abort flag, and frame serials
//! are compared against the packet queue's live serial to spot post-flush
//! leftovers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::packet::PacketQueue;

pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SAMPLE_QUEUE_SIZE: usize = 9;

/// A decoded, timestamped frame occupying one queue slot.
#[derive(Debug)]
pub struct Frame<T> {
    pub payload: T,
    /// Presentation timestamp in seconds, NaN when never stamped.
    pub pts: f64,
    /// Estimated duration in seconds.
    pub duration: f64,
    /// Byte position of the frame in the input, -1 when unknown.
    pub pos: i64,
    pub serial: i32,
}

impl<T: Default> Default for Frame<T> {
    fn default() -> Self {
        Self {
            payload: T::default(),
            pts: f64::NAN,
            duration: 0.0,
            pos: -1,
            serial: -1,
        }
    }
}

/// Copyable timing view of a frame, for callers that need to look at two
/// entries at once without holding the queue locked.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
    pub serial: i32,
}

impl<T> Frame<T> {
    fn meta(&self) -> FrameMeta {
        FrameMeta {
            pts: self.pts,
            duration: self.duration,
            pos: self.pos,
            serial: self.serial,
        }
    }
}

struct Ring<T> {
    slots: Vec<Frame<T>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

pub struct FrameQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

impl<T: Default> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, Frame::default);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            pktq,
            max_size,
            keep_last,
        }
    }

    /// Wake all waiters so they can re-check abort or serial state.
    pub fn signal(&self) {
        let _ring = self.ring.lock();
        self.cond.notify_all();
    }

    /// Slot to write the next frame into. Blocks while the queue is full;
    /// returns None once the packet queue is aborted. The written slot is
    /// not visible to readers until [`WritableGuard::push`].
    pub fn peek_writable(&self) -> Option<WritableGuard<'_, T>> {
        let mut ring = self.ring.lock();
        while ring.size >= self.max_size && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        Some(WritableGuard { queue: self, ring })
    }

    /// Current readable frame. Blocks while nothing beyond the shown entry
    /// is queued; returns None once the packet queue is aborted.
    pub fn peek_readable(&self) -> Option<ReadGuard<'_, T>> {
        let mut ring = self.ring.lock();
        while ring.size as isize - ring.rindex_shown as isize <= 0 && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        let index = (ring.rindex + ring.rindex_shown) % self.max_size;
        Some(ReadGuard { ring, index })
    }

    /// Non-blocking view of the current frame. Caller must have checked
    /// [`FrameQueue::nb_remaining`].
    pub fn peek(&self) -> ReadGuard<'_, T> {
        let ring = self.ring.lock();
        let index = (ring.rindex + ring.rindex_shown) % self.max_size;
        ReadGuard { ring, index }
    }

    /// Non-blocking view one past the current frame.
    pub fn peek_next(&self) -> ReadGuard<'_, T> {
        let ring = self.ring.lock();
        let index = (ring.rindex + ring.rindex_shown + 1) % self.max_size;
        ReadGuard { ring, index }
    }

    /// The last-shown frame (frozen by keep-last until the next advance).
    pub fn peek_last(&self) -> ReadGuard<'_, T> {
        let ring = self.ring.lock();
        let index = ring.rindex;
        ReadGuard { ring, index }
    }

    pub fn peek_meta(&self) -> FrameMeta {
        self.peek().meta()
    }

    pub fn peek_next_meta(&self) -> FrameMeta {
        self.peek_next().meta()
    }

    pub fn last_meta(&self) -> FrameMeta {
        self.peek_last().meta()
    }

    /// Advance past the current frame. With keep-last, the first advance
    /// only marks the entry as shown; the slot is released on the next one.
    pub fn next(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = Frame::default();
        ring.rindex = (rindex + 1) % self.max_size;
        ring.size -= 1;
        self.cond.notify_all();
    }

    /// Number of undisplayed frames.
    pub fn nb_remaining(&self) -> usize {
        let ring = self.ring.lock();
        ring.size.saturating_sub(ring.rindex_shown)
    }

    /// Whether a frame has ever been consumed and retained as last-shown.
    pub fn is_last_shown(&self) -> bool {
        self.ring.lock().rindex_shown != 0
    }

    /// Byte position of the last shown frame, or -1 when it is stale or
    /// nothing was shown yet.
    pub fn last_pos(&self) -> i64 {
        let ring = self.ring.lock();
        let frame = &ring.slots[ring.rindex];
        if ring.rindex_shown != 0 && frame.serial == self.pktq.serial() {
            frame.pos
        } else {
            -1
        }
    }
}

/// Write access to the next free slot; committing is explicit.
pub struct WritableGuard<'a, T> {
    queue: &'a FrameQueue<T>,
    ring: MutexGuard<'a, Ring<T>>,
}

impl<T> Deref for WritableGuard<'_, T> {
    type Target = Frame<T>;
    fn deref(&self) -> &Frame<T> {
        let windex = self.ring.windex;
        &self.ring.slots[windex]
    }
}

impl<T> DerefMut for WritableGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Frame<T> {
        let windex = self.ring.windex;
        &mut self.ring.slots[windex]
    }
}

impl<T> WritableGuard<'_, T> {
    /// Commit the slot: advance the write index and wake readers.
    pub fn push(mut self) {
        let max_size = self.queue.max_size;
        self.ring.windex = (self.ring.windex + 1) % max_size;
        self.ring.size += 1;
        let queue = self.queue;
        drop(self.ring);
        queue.cond.notify_all();
    }
}

/// Shared read access to one slot.
pub struct ReadGuard<'a, T> {
    ring: MutexGuard<'a, Ring<T>>,
    index: usize,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = Frame<T>;
    fn deref(&self) -> &Frame<T> {
        &self.ring.slots[self.index]
    }
}

impl<T> ReadGuard<'_, T> {
    pub fn meta(&self) -> FrameMeta {
        self.deref().meta()
    }
}
