//! # Video refresh scheduler
//!
//! Decides, each wakeup, whether the frame at the head of the picture
//! queue should stay on screen, replace the current one, or be dropped,
//! and tells the caller when to wake up next. The presentation target is
//! derived from the previous frame's duration, corrected toward the
//! master clock within bounded thresholds.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{wall_time, NOSYNC_THRESHOLD};
use crate::decoder::{DecodeOutcome, DecodeSource, Decoder, Picture, VideoTimestamps};
use crate::frame::FrameMeta;
use crate::session::{FrameDrop, PlaybackSession, SyncMode};

/// Nominal polling interval when no earlier deadline exists, in seconds.
pub const REFRESH_RATE: f64 = 0.01;
/// Below this desync the frame is shown as scheduled.
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Above this desync the correction is applied in full.
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are never duplicated to absorb desync.
pub const FRAMEDUP_THRESHOLD: f64 = 0.1;

/// Seconds between status reports.
const STATUS_INTERVAL: f64 = 0.03;

/// Display boundary. Implementations present the picture however they
/// like; failures are theirs to log.
pub trait VideoSink: Send {
    fn display(&mut self, picture: &Picture, meta: FrameMeta);
}

/// Nominal on-screen time of `frame` given its successor. Zero across a
/// generation boundary; the frame's own duration when the pts delta is
/// absent or absurd.
pub fn vp_duration(session: &PlaybackSession, frame: &FrameMeta, next: &FrameMeta) -> f64 {
    if frame.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - frame.pts;
    if duration.is_nan() || duration <= 0.0 || duration > session.max_frame_duration() {
        frame.duration
    } else {
        duration
    }
}

/// Adjust the nominal delay toward the master clock. Identity when video
/// itself is the master or the clocks are too far apart to trust.
pub fn compute_target_delay(session: &PlaybackSession, delay: f64) -> f64 {
    let mut delay = delay;
    if session.master_sync_mode() != SyncMode::Video {
        let diff = session.vidclk.get() - session.master_clock();
        let sync_threshold = SYNC_THRESHOLD_MIN.max(SYNC_THRESHOLD_MAX.min(delay));
        if !diff.is_nan() && diff.abs() < session.max_frame_duration() {
            if diff <= -sync_threshold {
                delay = 0f64.max(delay + diff);
            } else if diff >= sync_threshold && delay > FRAMEDUP_THRESHOLD {
                delay += diff;
            } else if diff >= sync_threshold {
                delay *= 2.0;
            }
        }
        tracing::trace!(delay, diff, "video refresh delay");
    }
    delay
}

fn late_drop_allowed(session: &PlaybackSession) -> bool {
    match session.config().frame_drop {
        FrameDrop::Always => true,
        FrameDrop::Auto => session.master_sync_mode() != SyncMode::Video,
        FrameDrop::Never => false,
    }
}

enum Phase {
    NoFrame,
    FrameReady,
    Waiting,
    Display,
}

pub struct RefreshScheduler {
    session: Arc<PlaybackSession>,
    last_status: f64,
}

impl RefreshScheduler {
    pub fn new(session: Arc<PlaybackSession>) -> Self {
        Self {
            session,
            last_status: f64::NEG_INFINITY,
        }
    }

    /// Run one refresh pass and return how long the caller may sleep.
    pub fn step(&mut self, sink: &mut dyn VideoSink) -> Duration {
        let mut remaining = REFRESH_RATE;
        if self.session.has_video() {
            self.refresh(sink, &mut remaining);
        }
        self.emit_status();
        Duration::from_secs_f64(remaining)
    }

    fn refresh(&mut self, sink: &mut dyn VideoSink, remaining: &mut f64) {
        let session = &self.session;
        let mut phase = if session.pictq.nb_remaining() == 0 {
            Phase::NoFrame
        } else {
            Phase::FrameReady
        };
        loop {
            match phase {
                Phase::NoFrame => phase = Phase::Display,
                Phase::FrameReady => {
                    let last = session.pictq.last_meta();
                    let vp = session.pictq.peek_meta();

                    // Generation correctness first: a frame from a dead
                    // generation is discarded before any timing runs.
                    if vp.serial != session.videoq.serial() {
                        session.pictq.next();
                        phase = if session.pictq.nb_remaining() == 0 {
                            Phase::NoFrame
                        } else {
                            Phase::FrameReady
                        };
                        continue;
                    }
                    if last.serial != vp.serial {
                        session.set_frame_timer(wall_time());
                    }
                    if session.is_paused() {
                        phase = Phase::Display;
                        continue;
                    }

                    let last_duration = vp_duration(session, &last, &vp);
                    let delay = compute_target_delay(session, last_duration);
                    let time = wall_time();
                    let frame_timer = session.frame_timer();
                    if time < frame_timer + delay {
                        *remaining = remaining.min(frame_timer + delay - time);
                        phase = Phase::Waiting;
                        continue;
                    }

                    session.advance_frame_timer(delay);
                    if delay > 0.0 && time - session.frame_timer() > SYNC_THRESHOLD_MAX {
                        // The timer has fallen hopelessly behind; resync
                        // to now instead of playing catch-up for seconds.
                        session.set_frame_timer(time);
                    }

                    if !vp.pts.is_nan() {
                        session.vidclk.set(vp.pts, vp.serial);
                        session.extclk.sync_to_slave(&session.vidclk);
                    }

                    if session.pictq.nb_remaining() > 1 {
                        let next = session.pictq.peek_next_meta();
                        let duration = vp_duration(session, &vp, &next);
                        if !session.is_stepping()
                            && late_drop_allowed(session)
                            && time > session.frame_timer() + duration
                        {
                            session.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                            session.pictq.next();
                            phase = if session.pictq.nb_remaining() == 0 {
                                Phase::NoFrame
                            } else {
                                Phase::FrameReady
                            };
                            continue;
                        }
                    }

                    session.pictq.next();
                    session.force_refresh();
                    if session.is_stepping() && !session.is_paused() {
                        session.toggle_pause();
                    }
                    phase = Phase::Display;
                }
                Phase::Waiting => phase = Phase::Display,
                Phase::Display => {
                    let forced = session.take_force_refresh();
                    if forced && session.pictq.is_last_shown() {
                        let guard = session.pictq.peek_last();
                        sink.display(&guard.payload, guard.meta());
                    }
                    return;
                }
            }
        }
    }

    fn emit_status(&mut self) {
        let now = wall_time();
        if now - self.last_status < STATUS_INTERVAL {
            return;
        }
        self.last_status = now;
        let session = &self.session;
        let av_diff = if session.has_audio() && session.has_video() {
            session.audclk.get() - session.vidclk.get()
        } else if session.has_video() {
            session.master_clock() - session.vidclk.get()
        } else {
            session.master_clock() - session.audclk.get()
        };
        tracing::info!(
            master = session.master_clock(),
            av_diff,
            audioq_bytes = session.audioq.size(),
            videoq_bytes = session.videoq.size(),
            drops_early = session.frame_drops_early.load(Ordering::Relaxed),
            drops_late = session.frame_drops_late.load(Ordering::Relaxed),
            "playback status"
        );
    }
}

/// Drain the video decoder into the picture queue until abort. Frames
/// already behind the master clock are dropped before queueing when the
/// policy allows and the backlog suggests more are coming.
pub fn video_decode_loop<D>(
    session: &Arc<PlaybackSession>,
    decoder: &mut Decoder<D, VideoTimestamps>,
    nominal_duration: f64,
) where
    D: DecodeSource<Frame = Picture>,
{
    loop {
        match decoder.decode_frame() {
            DecodeOutcome::Frame { frame, serial } => {
                if !frame.pts.is_nan() && late_drop_allowed(session) {
                    let diff = frame.pts - session.master_clock();
                    if !diff.is_nan()
                        && diff.abs() < NOSYNC_THRESHOLD
                        && diff < 0.0
                        && serial == session.vidclk.serial()
                        && session.videoq.nb_packets() > 0
                    {
                        session.frame_drops_early.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
                let Some(mut slot) = session.pictq.peek_writable() else {
                    return;
                };
                slot.pts = frame.pts;
                slot.duration = nominal_duration;
                slot.pos = frame.pos;
                slot.serial = serial;
                slot.payload = frame;
                slot.push();
            }
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => return,
        }
    }
}
