//! Drift-corrected playback clocks.
//!
//! Three clocks exist per session (audio, video, external). Each one stores
//! a media timestamp plus the wall time it was taken at, so reads can be
//! projected forward without polling media time continuously. A clock tied
//! to a packet queue goes stale when the queue's serial moves past the one
//! the clock was anchored with; stale reads come back as NaN and callers
//! treat them as "clock not anchored yet".

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// No sync correction is attempted above this A/V difference (seconds).
pub const NOSYNC_THRESHOLD: f64 = 10.0;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic wall time in seconds since process start.
pub fn wall_time() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: f64,
    /// pts minus the wall time the pts was taken at.
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: i32,
    paused: bool,
}

/// A drift-corrected logical time source.
///
/// The full state tuple is copied under one mutex so concurrent readers
/// never observe a half-written pts/drift/serial combination.
pub struct Clock {
    state: Mutex<ClockState>,
    /// Serial counter of the queue this clock tracks. `None` for a
    /// free-running clock (the external clock tracks itself).
    queue_serial: Option<Arc<AtomicI32>>,
}

impl Clock {
    /// Clock slaved to a packet queue's serial counter.
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        let clock = Self::free_running();
        Self {
            queue_serial: Some(queue_serial),
            ..clock
        }
    }

    /// Clock with no queue to go stale against.
    pub fn free_running() -> Self {
        Self {
            state: Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: wall_time(),
                speed: 1.0,
                serial: -1,
                paused: false,
            }),
            queue_serial: None,
        }
    }

    /// Current clock reading, or NaN when the clock is unanchored or its
    /// tracked queue flushed past the serial it was set with.
    pub fn get(&self) -> f64 {
        let state = *self.state.lock();
        if let Some(queue_serial) = &self.queue_serial {
            if queue_serial.load(Ordering::Acquire) != state.serial {
                return f64::NAN;
            }
        }
        if state.paused {
            state.pts
        } else {
            let time = wall_time();
            state.pts_drift + time - (time - state.last_updated) * (1.0 - state.speed)
        }
    }

    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        let mut state = self.state.lock();
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = serial;
    }

    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, wall_time());
    }

    /// Change the rate multiplier without letting the reading jump.
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let serial = self.serial();
        self.set(current, serial);
        self.state.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn serial(&self) -> i32 {
        self.state.lock().serial
    }

    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    /// Wall time of the last anchor point.
    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }

    /// Force this clock onto the slave's reading when the two have drifted
    /// beyond trust, or when this clock has no defined value of its own.
    pub fn sync_to_slave(&self, slave: &Clock) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan() && (clock.is_nan() || (clock - slave_clock).abs() > NOSYNC_THRESHOLD)
        {
            if !clock.is_nan() {
                tracing::warn!(
                    clock,
                    slave = slave_clock,
                    "clock drifted beyond trust, adopting slave"
                );
            }
            self.set(slave_clock, slave.serial());
        }
    }
}
