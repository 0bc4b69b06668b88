//! # Read driver
//!
//! Pulls demuxed packets from a [`MediaSource`] and routes them to the
//! per-stream packet queues. Owns the seek execution, read backpressure,
//! end-of-stream sentinels, and loop/autoexit policy.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::packet::Packet;
use crate::session::{PlaybackSession, SeekTarget};

/// Combined byte ceiling across both packet queues.
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;

/// Bounded park while the queues are full or the stream is over.
const READ_PARK: Duration = Duration::from_millis(10);

/// Wakeup channel for the read driver. Decoders poke it when their queue
/// runs dry; the control surface pokes it on seek and shutdown.
pub struct ContinueRead {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ContinueRead {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn park(&self, timeout: Duration) {
        let mut guard = self.mutex.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

impl Default for ContinueRead {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// One read attempt's outcome.
pub enum Read {
    Packet { kind: StreamKind, packet: Packet },
    /// The source is exhausted (until a seek rewinds it).
    Eof,
    /// Transient; try again shortly.
    Retry,
    Fatal(SourceError),
}

#[derive(Debug, thiserror::Error)]
#[error("media source failed: {0}")]
pub struct SourceError(pub String);

/// Demuxer boundary. Implementations produce interleaved packets and
/// honor position changes.
pub trait MediaSource: Send {
    fn read(&mut self) -> Read;
    fn seek(&mut self, target: &SeekTarget) -> Result<(), SourceError>;
    /// Hint for sources that can suspend delivery while paused.
    fn set_paused(&mut self, _paused: bool) {}
    /// First timestamp of the stream, NaN when unknown.
    fn start_time(&self) -> f64 {
        f64::NAN
    }
}

pub struct ReadDriver<S: MediaSource> {
    session: Arc<PlaybackSession>,
    source: S,
    /// Finished markers published by the decode drivers, used to tell
    /// "queues empty" apart from "everything presented".
    audio_finished: Option<Arc<AtomicI32>>,
    video_finished: Option<Arc<AtomicI32>>,
    eof_sent: bool,
    last_paused: bool,
    loops_left: u32,
}

impl<S: MediaSource> ReadDriver<S> {
    pub fn new(session: Arc<PlaybackSession>, source: S) -> Self {
        let loops_left = session.config().loop_count;
        Self {
            session,
            source,
            audio_finished: None,
            video_finished: None,
            eof_sent: false,
            last_paused: false,
            loops_left,
        }
    }

    pub fn set_audio_finished(&mut self, handle: Arc<AtomicI32>) {
        self.audio_finished = Some(handle);
    }

    pub fn set_video_finished(&mut self, handle: Arc<AtomicI32>) {
        self.video_finished = Some(handle);
    }

    fn stream_done(&self, finished: &Option<Arc<AtomicI32>>, kind: StreamKind) -> bool {
        let session = &self.session;
        let (open, queue, remaining) = match kind {
            StreamKind::Audio => (
                session.has_audio(),
                &session.audioq,
                session.sampq.nb_remaining(),
            ),
            StreamKind::Video => (
                session.has_video(),
                &session.videoq,
                session.pictq.nb_remaining(),
            ),
        };
        if !open {
            return true;
        }
        match finished {
            Some(handle) => handle.load(Ordering::Acquire) == queue.serial() && remaining == 0,
            None => false,
        }
    }

    /// Everything read so far has been decoded and presented.
    fn playback_finished(&self) -> bool {
        !self.session.is_paused()
            && self.stream_done(&self.audio_finished, StreamKind::Audio)
            && self.stream_done(&self.video_finished, StreamKind::Video)
    }

    fn execute_seek(&mut self, target: SeekTarget) {
        let session = &self.session;
        match self.source.seek(&target) {
            Ok(()) => {
                if session.has_audio() {
                    session.audioq.flush();
                }
                if session.has_video() {
                    session.videoq.flush();
                }
                match target {
                    SeekTarget::Bytes { .. } => session.extclk.set(f64::NAN, 0),
                    SeekTarget::Time { pos, .. } => session.extclk.set(pos, 0),
                }
            }
            Err(err) => tracing::error!(%err, "seek failed"),
        }
        self.eof_sent = false;
        session.set_eof(false);
        if session.is_paused() {
            // Land on the target frame instead of a black hold.
            session.step_to_next_frame();
        }
    }

    fn queues_saturated(&self) -> bool {
        let session = &self.session;
        if session.config().infinite_buffer {
            return false;
        }
        if session.audioq.size() + session.videoq.size() > MAX_QUEUE_SIZE {
            return true;
        }
        let audio_enough = !session.has_audio() || session.audioq.has_enough_packets();
        let video_enough = !session.has_video() || session.videoq.has_enough_packets();
        audio_enough && video_enough
    }

    fn send_eos(&mut self) {
        if self.eof_sent {
            return;
        }
        let session = &self.session;
        // One sentinel per open stream drains the decoders.
        let aborted = (session.has_video() && session.videoq.put_eos().is_err())
            || (session.has_audio() && session.audioq.put_eos().is_err());
        if !aborted {
            self.eof_sent = true;
            session.set_eof(true);
        }
    }

    /// Restart from the top, or report that playback should end.
    fn handle_finished(&mut self) -> bool {
        let config = self.session.config();
        let restart = if config.loop_count == 0 {
            true
        } else {
            self.loops_left = self.loops_left.saturating_sub(1);
            self.loops_left > 0
        };
        if restart {
            let start = self.source.start_time();
            let pos = if config.start_time.is_nan() {
                if start.is_nan() {
                    0.0
                } else {
                    start
                }
            } else {
                config.start_time
            };
            self.session.request_seek(SeekTarget::Time { pos, rel: 0.0 });
            false
        } else {
            config.autoexit
        }
    }

    /// Run until shutdown or autoexit. Returns true when playback ended on
    /// its own rather than by request.
    pub fn run(&mut self) -> bool {
        loop {
            if self.session.is_aborted() {
                return false;
            }

            let paused = self.session.is_paused();
            if paused != self.last_paused {
                self.last_paused = paused;
                self.source.set_paused(paused);
            }

            if let Some(target) = self.session.take_seek() {
                self.execute_seek(target);
                continue;
            }

            if self.queues_saturated() {
                self.session.continue_read.park(READ_PARK);
                continue;
            }

            if self.playback_finished() && self.handle_finished() {
                return true;
            }

            match self.source.read() {
                Read::Packet { kind, packet } => {
                    let delivered = match kind {
                        StreamKind::Audio if self.session.has_audio() => {
                            self.session.audioq.put(packet)
                        }
                        StreamKind::Video if self.session.has_video() => {
                            self.session.videoq.put(packet)
                        }
                        _ => Ok(()),
                    };
                    if delivered.is_err() {
                        return false;
                    }
                }
                Read::Eof => {
                    self.send_eos();
                    self.session.continue_read.park(READ_PARK);
                }
                Read::Retry => {
                    self.session.continue_read.park(READ_PARK);
                }
                Read::Fatal(err) => {
                    tracing::error!(%err, "read driver stopping");
                    self.send_eos();
                    return false;
                }
            }
        }
    }
}
