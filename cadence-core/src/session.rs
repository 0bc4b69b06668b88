//! # Playback session
//!
//! Shared state for one playback: the three clocks, both queue pairs, the
//! pause/step/seek control surface, and the master clock selection policy.
//! Every worker thread holds an `Arc<PlaybackSession>`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{wall_time, Clock};
use crate::decoder::{AudioBlock, Picture};
use crate::frame::{FrameQueue, SAMPLE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
use crate::packet::PacketQueue;
use crate::reader::{ContinueRead, StreamKind};

/// Default presentation-timestamp ceiling for one frame, in seconds.
/// Sources that cannot produce discontinuous timestamps may raise it.
pub const MAX_FRAME_DURATION_DEFAULT: f64 = 10.0;
/// Ceiling for sources whose timestamps may wrap.
pub const MAX_FRAME_DURATION_WRAPPING: f64 = 3600.0;

/// One volume step, in decibels.
const VOLUME_STEP_DB: f64 = 0.75;

// ============================================================================
// Configuration
// ============================================================================

/// Which clock drives presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Audio,
    Video,
    External,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Audio
    }
}

/// Late-frame dropping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDrop {
    /// Drop only when video is not the master clock.
    Auto,
    Always,
    Never,
}

impl Default for FrameDrop {
    fn default() -> Self {
        FrameDrop::Auto
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sync: SyncMode,
    pub frame_drop: FrameDrop,
    /// Seek in byte offsets instead of seconds.
    pub seek_by_bytes: bool,
    /// Number of full passes through the stream; 0 repeats forever.
    pub loop_count: u32,
    /// Exit once everything has been presented.
    pub autoexit: bool,
    /// Disable read backpressure (realtime sources).
    pub infinite_buffer: bool,
    /// Startup position in seconds, NaN for the stream start.
    pub start_time: f64,
    /// Linear startup volume in 0..=1.
    pub volume: f64,
    pub muted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync: SyncMode::Audio,
            frame_drop: FrameDrop::Auto,
            seek_by_bytes: false,
            loop_count: 1,
            autoexit: false,
            infinite_buffer: false,
            start_time: f64::NAN,
            volume: 1.0,
            muted: false,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A pending seek, consumed by the read driver.
#[derive(Debug, Clone, Copy)]
pub enum SeekTarget {
    Time { pos: f64, rel: f64 },
    Bytes { pos: i64, rel: i64 },
}

struct ControlState {
    paused: bool,
    step: bool,
    seek: Option<SeekTarget>,
    sync: SyncMode,
    volume: f64,
    muted: bool,
    /// Wall-time anchor of the frame currently on screen.
    frame_timer: f64,
    max_frame_duration: f64,
}

pub struct PlaybackSession {
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,

    pub audioq: Arc<PacketQueue>,
    pub videoq: Arc<PacketQueue>,
    pub sampq: Arc<FrameQueue<AudioBlock>>,
    pub pictq: Arc<FrameQueue<Picture>>,

    pub continue_read: Arc<ContinueRead>,

    config: SessionConfig,
    state: Mutex<ControlState>,
    abort: AtomicBool,
    force_refresh: AtomicBool,
    eof: AtomicBool,
    audio_open: AtomicBool,
    video_open: AtomicBool,
    pub frame_drops_early: AtomicUsize,
    pub frame_drops_late: AtomicUsize,
}

impl PlaybackSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let audioq = Arc::new(PacketQueue::new());
        let videoq = Arc::new(PacketQueue::new());
        let sampq = Arc::new(FrameQueue::new(audioq.clone(), SAMPLE_QUEUE_SIZE, true));
        let pictq = Arc::new(FrameQueue::new(videoq.clone(), VIDEO_PICTURE_QUEUE_SIZE, true));

        let audclk = Clock::new(audioq.serial_handle());
        let vidclk = Clock::new(videoq.serial_handle());
        let extclk = Clock::free_running();

        let state = ControlState {
            paused: false,
            step: false,
            seek: None,
            sync: config.sync,
            volume: config.volume.clamp(0.0, 1.0),
            muted: config.muted,
            // NEG_INFINITY, not 0.0: zero aliases the wall-time epoch, and a
            // young process would sit out the first frame delay instead of
            // presenting immediately and resyncing.
            frame_timer: f64::NEG_INFINITY,
            max_frame_duration: MAX_FRAME_DURATION_DEFAULT,
        };

        Arc::new(Self {
            audclk,
            vidclk,
            extclk,
            audioq,
            videoq,
            sampq,
            pictq,
            continue_read: Arc::new(ContinueRead::new()),
            config,
            state: Mutex::new(state),
            abort: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            audio_open: AtomicBool::new(false),
            video_open: AtomicBool::new(false),
            frame_drops_early: AtomicUsize::new(0),
            frame_drops_late: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Stream bookkeeping
    // ------------------------------------------------------------------

    /// Mark the audio path live and re-arm its packet queue.
    pub fn open_audio(&self) {
        self.audioq.start();
        self.audio_open.store(true, Ordering::Release);
    }

    pub fn open_video(&self) {
        self.videoq.start();
        self.video_open.store(true, Ordering::Release);
    }

    pub fn has_audio(&self) -> bool {
        self.audio_open.load(Ordering::Acquire)
    }

    pub fn has_video(&self) -> bool {
        self.video_open.load(Ordering::Acquire)
    }

    /// Disable a live stream or re-arm a disabled one. The read driver
    /// stops routing packets to a disabled stream; its decoder drains
    /// whatever is buffered and goes idle until the next re-arm.
    pub fn cycle_stream(&self, kind: StreamKind) {
        match kind {
            StreamKind::Audio => {
                if self.has_audio() {
                    self.audio_open.store(false, Ordering::Release);
                    self.audioq.flush();
                    self.sampq.signal();
                } else {
                    self.open_audio();
                }
            }
            StreamKind::Video => {
                if self.has_video() {
                    self.video_open.store(false, Ordering::Release);
                    self.videoq.flush();
                    self.pictq.signal();
                } else {
                    self.open_video();
                }
            }
        }
        self.continue_read.notify();
    }

    pub fn set_max_frame_duration(&self, value: f64) {
        self.state.lock().max_frame_duration = value;
    }

    pub fn max_frame_duration(&self) -> f64 {
        self.state.lock().max_frame_duration
    }

    // ------------------------------------------------------------------
    // Master clock selection
    // ------------------------------------------------------------------

    /// Switch the clock driving presentation.
    pub fn set_sync_mode(&self, sync: SyncMode) {
        self.state.lock().sync = sync;
    }

    /// Effective sync mode after falling back from absent streams.
    pub fn master_sync_mode(&self) -> SyncMode {
        match self.state.lock().sync {
            SyncMode::Video => {
                if self.has_video() {
                    SyncMode::Video
                } else {
                    SyncMode::Audio
                }
            }
            SyncMode::Audio => {
                if self.has_audio() {
                    SyncMode::Audio
                } else {
                    SyncMode::External
                }
            }
            SyncMode::External => SyncMode::External,
        }
    }

    /// Current reading of whichever clock drives presentation.
    pub fn master_clock(&self) -> f64 {
        match self.master_sync_mode() {
            SyncMode::Audio => self.audclk.get(),
            SyncMode::Video => self.vidclk.get(),
            SyncMode::External => self.extclk.get(),
        }
    }

    // ------------------------------------------------------------------
    // Pause / step
    // ------------------------------------------------------------------

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn toggle_pause(&self) {
        let mut state = self.state.lock();
        if state.paused {
            // Credit the paused span to the frame timer so the resumed
            // frame does not appear instantly late.
            state.frame_timer += wall_time() - self.vidclk.last_updated();
            self.vidclk.set(self.vidclk.get(), self.vidclk.serial());
        }
        self.extclk.set(self.extclk.get(), self.extclk.serial());
        state.paused = !state.paused;
        state.step = false;
        let paused = state.paused;
        drop(state);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
    }

    /// Advance exactly one frame, pausing again afterwards.
    pub fn step_to_next_frame(&self) {
        if self.is_paused() {
            self.toggle_pause();
        }
        self.state.lock().step = true;
    }

    pub fn is_stepping(&self) -> bool {
        self.state.lock().step
    }

    // ------------------------------------------------------------------
    // Seek
    // ------------------------------------------------------------------

    /// Queue a seek; ignored while a previous one is still pending.
    pub fn request_seek(&self, target: SeekTarget) {
        let mut state = self.state.lock();
        if state.seek.is_none() {
            state.seek = Some(target);
            drop(state);
            self.continue_read.notify();
        }
    }

    /// Queue a seek relative to the current position, honoring the
    /// byte-seek preference.
    pub fn seek_relative(&self, delta: f64) {
        if self.config.seek_by_bytes {
            let mut pos = -1i64;
            if self.has_video() {
                pos = self.pictq.last_pos();
            }
            if pos < 0 && self.has_audio() {
                pos = self.sampq.last_pos();
            }
            if pos < 0 {
                pos = 0;
            }
            // Coarse byte-rate estimate for containers without timestamps.
            let rel = (delta * 180_000.0) as i64;
            self.request_seek(SeekTarget::Bytes { pos: pos + rel, rel });
        } else {
            let mut target = self.master_clock();
            if target.is_nan() {
                target = 0.0;
            }
            self.request_seek(SeekTarget::Time {
                pos: target + delta,
                rel: delta,
            });
        }
    }

    pub(crate) fn take_seek(&self) -> Option<SeekTarget> {
        self.state.lock().seek.take()
    }

    pub fn seek_pending(&self) -> bool {
        self.state.lock().seek.is_some()
    }

    // ------------------------------------------------------------------
    // Speed, volume, refresh flags
    // ------------------------------------------------------------------

    /// Change playback speed on all three clocks; each resnapshots so its
    /// reading stays continuous across the change.
    pub fn set_speed(&self, speed: f64) {
        self.audclk.set_speed(speed);
        self.vidclk.set_speed(speed);
        self.extclk.set_speed(speed);
    }

    pub fn volume(&self) -> f64 {
        self.state.lock().volume
    }

    pub fn set_volume(&self, volume: f64) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    /// Nudge the volume by one step; `sign` picks the direction.
    pub fn update_volume(&self, sign: i32) {
        let mut state = self.state.lock();
        let factor = 10f64.powf(sign as f64 * VOLUME_STEP_DB / 20.0);
        let new = if state.volume > 0.0 {
            state.volume * factor
        } else if sign > 0 {
            // Climbing out of silence needs a floor to multiply from.
            10f64.powf(-60.0 / 20.0)
        } else {
            0.0
        };
        state.volume = new.clamp(0.0, 1.0);
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn toggle_mute(&self) {
        let mut state = self.state.lock();
        state.muted = !state.muted;
    }

    pub fn force_refresh(&self) {
        self.force_refresh.store(true, Ordering::Release);
    }

    pub(crate) fn take_force_refresh(&self) -> bool {
        self.force_refresh.swap(false, Ordering::AcqRel)
    }

    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::Release);
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Frame timer
    // ------------------------------------------------------------------

    pub(crate) fn frame_timer(&self) -> f64 {
        self.state.lock().frame_timer
    }

    pub(crate) fn set_frame_timer(&self, value: f64) {
        self.state.lock().frame_timer = value;
    }

    pub(crate) fn advance_frame_timer(&self, delay: f64) {
        self.state.lock().frame_timer += delay;
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Abort every blocking structure so worker threads unwind.
    pub fn shutdown(&self) {
        self.abort.store(true, Ordering::Release);
        self.audioq.abort();
        self.videoq.abort();
        self.sampq.signal();
        self.pictq.signal();
        self.continue_read.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_falls_back_when_stream_absent() {
        let session = PlaybackSession::new(SessionConfig::default());
        // Audio requested but not open: external drives.
        assert_eq!(session.master_sync_mode(), SyncMode::External);
        session.open_audio();
        assert_eq!(session.master_sync_mode(), SyncMode::Audio);

        let cfg = SessionConfig {
            sync: SyncMode::Video,
            ..SessionConfig::default()
        };
        let session = PlaybackSession::new(cfg);
        session.open_audio();
        assert_eq!(session.master_sync_mode(), SyncMode::Audio);
        session.open_video();
        assert_eq!(session.master_sync_mode(), SyncMode::Video);
    }

    #[test]
    fn sync_mode_can_change_at_runtime() {
        let session = PlaybackSession::new(SessionConfig::default());
        session.open_audio();
        session.open_video();
        assert_eq!(session.master_sync_mode(), SyncMode::Audio);
        session.set_sync_mode(SyncMode::Video);
        assert_eq!(session.master_sync_mode(), SyncMode::Video);
    }

    #[test]
    fn cycling_a_stream_flushes_and_rearms() {
        let session = PlaybackSession::new(SessionConfig::default());
        session.open_audio();
        let serial = session.audioq.serial();
        session.cycle_stream(StreamKind::Audio);
        assert!(!session.has_audio());
        assert_eq!(session.audioq.serial(), serial + 1);
        session.cycle_stream(StreamKind::Audio);
        assert!(session.has_audio());
    }

    #[test]
    fn pause_freezes_clocks_and_resume_reanchors() {
        let session = PlaybackSession::new(SessionConfig::default());
        session.open_video();
        session.vidclk.set(5.0, session.videoq.serial());
        session.toggle_pause();
        assert!(session.is_paused());
        let frozen = session.vidclk.get();
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert_eq!(session.vidclk.get(), frozen);
        session.toggle_pause();
        assert!(!session.is_paused());
        assert!(session.vidclk.get() >= frozen);
    }

    #[test]
    fn step_unpauses_and_arms_single_step() {
        let session = PlaybackSession::new(SessionConfig::default());
        session.toggle_pause();
        session.step_to_next_frame();
        assert!(!session.is_paused());
        assert!(session.is_stepping());
    }

    #[test]
    fn seek_requests_do_not_stack() {
        let session = PlaybackSession::new(SessionConfig::default());
        session.request_seek(SeekTarget::Time { pos: 10.0, rel: 10.0 });
        session.request_seek(SeekTarget::Time { pos: 99.0, rel: 99.0 });
        match session.take_seek() {
            Some(SeekTarget::Time { pos, .. }) => assert_eq!(pos, 10.0),
            other => panic!("unexpected seek state: {other:?}"),
        }
        assert!(session.take_seek().is_none());
    }

    #[test]
    fn relative_seek_honors_byte_preference() {
        let session = PlaybackSession::new(SessionConfig {
            seek_by_bytes: true,
            ..SessionConfig::default()
        });
        session.seek_relative(10.0);
        match session.take_seek() {
            Some(SeekTarget::Bytes { pos, rel }) => {
                assert_eq!(rel, 1_800_000);
                assert_eq!(pos, 1_800_000);
            }
            other => panic!("unexpected seek state: {other:?}"),
        }

        let session = PlaybackSession::new(SessionConfig::default());
        session.open_audio();
        session.audclk.set(30.0, session.audioq.serial());
        session.seek_relative(-10.0);
        match session.take_seek() {
            Some(SeekTarget::Time { pos, rel }) => {
                assert_eq!(rel, -10.0);
                assert!((pos - 20.0).abs() < 0.5);
            }
            other => panic!("unexpected seek state: {other:?}"),
        }
    }

    #[test]
    fn volume_steps_are_logarithmic_and_clamped() {
        let session = PlaybackSession::new(SessionConfig::default());
        assert_eq!(session.volume(), 1.0);
        session.update_volume(1);
        assert_eq!(session.volume(), 1.0);
        session.update_volume(-1);
        let down = session.volume();
        assert!((down - 10f64.powf(-0.75 / 20.0)).abs() < 1e-9);
        session.update_volume(1);
        assert!((session.volume() - 1.0).abs() < 1e-9);
    }
}
