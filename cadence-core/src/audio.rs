//! # Audio render loop
//!
//! The audio device pulls interleaved f32 samples through
//! [`AudioPullPort::fill`]. [`AudioRenderer`] services that pull from the
//! sample frame queue, estimates drift against the master clock with a
//! moving average, and asks its [`SampleConverter`] to stretch or shrink
//! blocks when the average drift is trustworthy.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{wall_time, NOSYNC_THRESHOLD};
use crate::decoder::{AudioBlock, DecodeOutcome, DecodeSource, Decoder, AudioTimestamps};
use crate::session::{PlaybackSession, SyncMode};

/// Samples averaged before drift correction is trusted.
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
/// Maximum per-block correction, in percent of the block length.
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();

/// Output format negotiated with the audio device.
#[derive(Debug, Clone, Copy)]
pub struct AudioParams {
    pub freq: u32,
    pub channels: u16,
}

impl AudioParams {
    pub fn bytes_per_sec(&self) -> usize {
        self.freq as usize * self.channels as usize * BYTES_PER_SAMPLE
    }
}

/// Pull side of the audio device boundary.
pub trait AudioPullPort: Send {
    fn fill(&mut self, out: &mut [f32]);
}

/// Resampling collaborator. `wanted_nb_samples` differs from the block's
/// own length when drift correction asks for a stretch or shrink.
pub trait SampleConverter: Send {
    fn convert(&mut self, block: &AudioBlock, wanted_nb_samples: usize) -> Vec<f32>;
}

pub struct AudioRenderer<C: SampleConverter> {
    session: Arc<PlaybackSession>,
    converter: C,
    target: AudioParams,
    /// One hardware buffer, in bytes.
    hw_buf_size: usize,

    buf: Vec<f32>,
    buf_index: usize,
    /// End pts of the last consumed block, NaN until anchored.
    clock_pts: f64,
    clock_serial: i32,

    diff_cum: f64,
    diff_avg_coef: f64,
    diff_avg_count: u32,
    diff_threshold: f64,
}

impl<C: SampleConverter> AudioRenderer<C> {
    pub fn new(
        session: Arc<PlaybackSession>,
        converter: C,
        target: AudioParams,
        hw_buf_size: usize,
    ) -> Self {
        Self {
            diff_avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            diff_threshold: hw_buf_size as f64 / target.bytes_per_sec() as f64,
            session,
            converter,
            target,
            hw_buf_size,
            buf: Vec::new(),
            buf_index: 0,
            clock_pts: f64::NAN,
            clock_serial: -1,
            diff_cum: 0.0,
            diff_avg_count: 0,
        }
    }

    /// Decide how many samples this block should occupy after conversion.
    /// The correction is expressed in source samples, so it scales with the
    /// block's own rate. Identity when audio is the master clock.
    fn synchronize(&mut self, nb_samples: usize, source_freq: u32) -> usize {
        let mut wanted = nb_samples;
        if self.session.master_sync_mode() == SyncMode::Audio {
            return wanted;
        }
        let diff = self.session.audclk.get() - self.session.master_clock();
        if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
            // Discontinuity; the accumulated average is worthless.
            self.diff_avg_count = 0;
            self.diff_cum = 0.0;
            return wanted;
        }
        self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
        if self.diff_avg_count < AUDIO_DIFF_AVG_NB {
            self.diff_avg_count += 1;
            return wanted;
        }
        let avg_diff = self.diff_cum * (1.0 - self.diff_avg_coef);
        if avg_diff.abs() >= self.diff_threshold {
            let corrected = nb_samples as f64 + diff * source_freq as f64;
            let min = nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100;
            let max = nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100;
            wanted = (corrected as i64).clamp(min as i64, max as i64) as usize;
            tracing::trace!(
                diff,
                avg_diff,
                nb_samples,
                wanted,
                "audio drift correction applied"
            );
        }
        wanted
    }

    /// Pull the next live block from the sample queue and convert it.
    /// Returns false when silence should be emitted instead.
    fn refill(&mut self, callback_time: f64) -> bool {
        if self.session.is_paused() {
            return false;
        }
        // Bounded wait: give the decoder half a hardware buffer of grace
        // before falling back to silence.
        while self.session.sampq.nb_remaining() == 0 {
            let grace =
                self.hw_buf_size as f64 / self.target.bytes_per_sec() as f64 / 2.0;
            if wall_time() - callback_time > grace {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // Advance past blocks from dead generations. next() retains the
        // consumed slot as last-shown, so the survivor stays addressable.
        loop {
            let meta = match self.session.sampq.peek_readable() {
                Some(guard) => guard.meta(),
                None => return false,
            };
            self.session.sampq.next();
            if meta.serial == self.session.audioq.serial() {
                break;
            }
        }

        let sampq = self.session.sampq.clone();
        let guard = sampq.peek_last();
        let block: &AudioBlock = &guard.payload;
        let wanted = self.synchronize(block.nb_samples(), block.sample_rate);
        self.buf = self.converter.convert(block, wanted);
        self.buf_index = 0;
        self.clock_pts = if block.pts.is_nan() {
            f64::NAN
        } else {
            block.pts + block.duration()
        };
        self.clock_serial = guard.serial;
        true
    }
}

impl<C: SampleConverter> AudioPullPort for AudioRenderer<C> {
    fn fill(&mut self, out: &mut [f32]) {
        let callback_time = wall_time();
        let gain = if self.session.is_muted() {
            0.0
        } else {
            self.session.volume() as f32
        };

        let mut offset = 0;
        while offset < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.refill(callback_time) {
                    out[offset..].fill(0.0);
                    break;
                }
            }
            let n = (out.len() - offset).min(self.buf.len() - self.buf_index);
            for (dst, src) in out[offset..offset + n]
                .iter_mut()
                .zip(&self.buf[self.buf_index..self.buf_index + n])
            {
                *dst = src * gain;
            }
            offset += n;
            self.buf_index += n;
        }

        if !self.clock_pts.is_nan() {
            // Anchor behind real time by the samples still queued ahead of
            // the speaker: two hardware buffers plus our own remainder.
            let write_buf = (self.buf.len() - self.buf_index) * BYTES_PER_SAMPLE;
            let latency =
                (2 * self.hw_buf_size + write_buf) as f64 / self.target.bytes_per_sec() as f64;
            self.session
                .audclk
                .set_at(self.clock_pts - latency, self.clock_serial, callback_time);
            self.session.extclk.sync_to_slave(&self.session.audclk);
        }
    }
}

/// Drain the audio decoder into the sample queue until abort.
pub fn audio_decode_loop<D>(session: &Arc<PlaybackSession>, decoder: &mut Decoder<D, AudioTimestamps>)
where
    D: DecodeSource<Frame = AudioBlock>,
{
    loop {
        match decoder.decode_frame() {
            DecodeOutcome::Frame { frame, serial } => {
                let Some(mut slot) = session.sampq.peek_writable() else {
                    return;
                };
                slot.pts = frame.pts;
                slot.duration = frame.duration();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    struct Passthrough;

    impl SampleConverter for Passthrough {
        fn convert(&mut self, block: &AudioBlock, _wanted: usize) -> Vec<f32> {
            block.samples.clone()
        }
    }

    fn target() -> AudioParams {
        AudioParams {
            freq: 48_000,
            channels: 2,
        }
    }

    fn session_with_audio(sync: SyncMode) -> Arc<PlaybackSession> {
        let session = PlaybackSession::new(SessionConfig {
            sync,
            ..SessionConfig::default()
        });
        session.open_audio();
        session
    }

    fn push_block(session: &Arc<PlaybackSession>, pts: f64, value: f32, nb: usize) {
        let mut slot = session.sampq.peek_writable().unwrap();
        let block = AudioBlock {
            samples: vec![value; nb * 2],
            channels: 2,
            sample_rate: 48_000,
            pts,
            pos: -1,
        };
        slot.pts = pts;
        slot.duration = block.duration();
        slot.pos = -1;
        slot.serial = session.audioq.serial();
        slot.payload = block;
        slot.push();
    }

    #[test]
    fn fill_consumes_blocks_and_anchors_clock() {
        let session = session_with_audio(SyncMode::Audio);
        push_block(&session, 1.0, 0.5, 512);
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        let mut out = vec![0.0f32; 1024];
        renderer.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.5));
        // pts 1.0 + 512 samples, minus queued latency: behind 1.0 but set.
        let reading = session.audclk.get();
        assert!(!reading.is_nan());
        assert!(reading < 1.0 + 512.0 / 48_000.0);
    }

    #[test]
    fn paused_session_gets_silence_without_consuming() {
        let session = session_with_audio(SyncMode::Audio);
        push_block(&session, 0.0, 0.7, 256);
        session.toggle_pause();
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        let mut out = vec![1.0f32; 128];
        renderer.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(session.sampq.nb_remaining(), 1);
    }

    #[test]
    fn mute_zeroes_output_but_consumes() {
        let session = session_with_audio(SyncMode::Audio);
        push_block(&session, 0.0, 0.9, 256);
        session.toggle_mute();
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        let mut out = vec![1.0f32; 256];
        renderer.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(session.sampq.nb_remaining(), 0);
    }

    #[test]
    fn stale_generation_blocks_are_skipped() {
        let session = session_with_audio(SyncMode::Audio);
        push_block(&session, 0.0, 0.1, 64);
        session.audioq.flush();
        push_block(&session, 5.0, 0.2, 64);
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        let mut out = vec![0.0f32; 128];
        renderer.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.2));
    }

    #[test]
    fn correction_clamps_to_ten_percent() {
        let session = session_with_audio(SyncMode::External);
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        // Anchor both clocks with a large stable drift.
        session.extclk.set(10.0, 0);
        session.audclk.set(11.0, session.audioq.serial());
        // Warm the average past the trust threshold.
        let mut wanted = 1024;
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            wanted = renderer.synchronize(1024, 48_000);
        }
        // diff ~= +1s would ask for ~48000 extra samples; clamp holds.
        assert_eq!(wanted, 1024 * 110 / 100);
    }

    #[test]
    fn correction_scales_with_source_rate() {
        let session = session_with_audio(SyncMode::External);
        // Small hardware buffer so a 3ms drift clears the trust threshold.
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 256);
        session.extclk.set(10.0, 0);
        session.audclk.set(10.003, session.audioq.serial());
        // A 24kHz block through a 48kHz device: the correction counts
        // source samples, so 3ms is worth ~72 of them, not ~144.
        let mut wanted = 1024;
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            wanted = renderer.synchronize(1024, 24_000);
        }
        assert!((1090..=1100).contains(&wanted), "wanted = {wanted}");
        assert!(wanted < 1024 * 110 / 100);
    }

    #[test]
    fn correction_is_identity_while_average_warms_up() {
        let session = session_with_audio(SyncMode::External);
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        session.extclk.set(10.0, 0);
        session.audclk.set(10.5, session.audioq.serial());
        for _ in 0..(AUDIO_DIFF_AVG_NB - 1) {
            assert_eq!(renderer.synchronize(1024, 48_000), 1024);
        }
    }

    #[test]
    fn discontinuity_resets_the_average() {
        let session = session_with_audio(SyncMode::External);
        let mut renderer =
            AudioRenderer::new(session.clone(), Passthrough, target(), 4096);
        session.extclk.set(10.0, 0);
        session.audclk.set(10.5, session.audioq.serial());
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            renderer.synchronize(1024, 48_000);
        }
        assert!(renderer.diff_avg_count >= AUDIO_DIFF_AVG_NB);
        // Jump past the trust threshold.
        session.audclk.set(100.0, session.audioq.serial());
        renderer.synchronize(1024, 48_000);
        assert_eq!(renderer.diff_avg_count, 0);
        assert_eq!(renderer.diff_cum, 0.0);
    }
}
