//! Decode drivers.
//!
//! A [`Decoder`] pulls compressed units from a [`PacketQueue`], feeds an
//! external [`DecodeSource`], and hands back stamped frames. The actual
//! codec work lives behind the trait; this module owns the serial
//! bookkeeping (discarding pre-flush packets, resetting the source after a
//! seek) and the type-specific timestamp derivation.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::packet::{Got, Packet, PacketQueue};
use crate::reader::ContinueRead;

// ============================================================================
// Decoded payloads
// ============================================================================

/// A decoded video picture. Timestamps are in seconds, NaN when absent.
#[derive(Debug, Default)]
pub struct Picture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Pixel (sample) aspect ratio; 0.0 means unknown, treated as square.
    pub sar: f64,
    pub pts: f64,
    /// Decoder's best-effort presentation estimate.
    pub best_effort_pts: f64,
    /// Decode-order timestamp.
    pub dts: f64,
    /// Byte position of the originating packet, -1 when unknown.
    pub pos: i64,
}

/// A decoded block of interleaved f32 samples.
#[derive(Debug)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    pub pts: f64,
    pub pos: i64,
}

impl Default for AudioBlock {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            channels: 0,
            sample_rate: 0,
            pts: f64::NAN,
            pos: -1,
        }
    }
}

impl AudioBlock {
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Block duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.nb_samples() as f64 / self.sample_rate as f64
        }
    }
}

// ============================================================================
// Decode source contract
// ============================================================================

/// Outcome of handing a packet to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// The source refuses input until its output is drained.
    NeedsDrain,
}

/// Outcome of asking the source for a decoded frame.
pub enum Receive<F> {
    Frame(F),
    /// Nothing buffered; feed another packet.
    NeedMoreInput,
    /// The drain started by an EOS packet has completed.
    EndOfStream,
}

/// External decoder backend - implemented by whatever actually turns
/// compressed units into [`Picture`]s or [`AudioBlock`]s.
pub trait DecodeSource: Send {
    type Frame: Send;

    fn send(&mut self, packet: &Packet) -> SendOutcome;
    fn receive(&mut self) -> Receive<Self::Frame>;
    /// Reset internal buffering; called after a generation change.
    fn flush(&mut self);
    /// Source name for diagnostics.
    fn name(&self) -> &str;
}

// ============================================================================
// Timestamp policies
// ============================================================================

/// Preference between presentation-order and decode-order timestamps when
/// the source reorders frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReorderMode {
    /// Trust the source's best-effort estimate.
    Auto,
    /// Force decode-order timestamps.
    Off,
    /// Keep whatever pts the source stamped.
    On,
}

impl Default for ReorderMode {
    fn default() -> Self {
        ReorderMode::Auto
    }
}

/// Per-stream-type timestamp derivation applied to every decoded frame.
pub trait TimestampPolicy<F>: Send {
    /// Called when a new generation begins; `start_pts` is the stream's
    /// declared start (NaN when unknown).
    fn reset(&mut self, start_pts: f64);
    fn stamp(&mut self, frame: &mut F);
}

pub struct VideoTimestamps {
    pub reorder: ReorderMode,
}

impl TimestampPolicy<Picture> for VideoTimestamps {
    fn reset(&mut self, _start_pts: f64) {}

    fn stamp(&mut self, frame: &mut Picture) {
        match self.reorder {
            ReorderMode::Auto => frame.pts = frame.best_effort_pts,
            ReorderMode::Off => frame.pts = frame.dts,
            ReorderMode::On => {}
        }
    }
}

/// Synthesizes missing audio timestamps by extrapolating from the end of
/// the previous block.
pub struct AudioTimestamps {
    next_pts: f64,
}

impl AudioTimestamps {
    pub fn new() -> Self {
        Self { next_pts: f64::NAN }
    }
}

impl Default for AudioTimestamps {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampPolicy<AudioBlock> for AudioTimestamps {
    fn reset(&mut self, start_pts: f64) {
        self.next_pts = start_pts;
    }

    fn stamp(&mut self, frame: &mut AudioBlock) {
        if frame.pts.is_nan() && !self.next_pts.is_nan() {
            frame.pts = self.next_pts;
        }
        if !frame.pts.is_nan() {
            self.next_pts = frame.pts + frame.duration();
        }
    }
}

// ============================================================================
// Decode driver
// ============================================================================

/// One decoded frame plus the generation it belongs to.
pub enum DecodeOutcome<F> {
    Frame { frame: F, serial: i32 },
    /// Clean end-of-stream for the current generation.
    Finished,
    /// The packet queue was aborted; stop the owning thread.
    Aborted,
}

pub struct Decoder<D: DecodeSource, P: TimestampPolicy<D::Frame>> {
    source: D,
    policy: P,
    queue: Arc<PacketQueue>,
    continue_read: Arc<ContinueRead>,
    /// Generation of the frame a consumer saw last; 0 means "not finished"
    /// because live serials start at 1.
    finished: Arc<AtomicI32>,
    pkt_serial: i32,
    pending: Option<Packet>,
    start_pts: f64,
}

impl<D: DecodeSource, P: TimestampPolicy<D::Frame>> Decoder<D, P> {
    pub fn new(
        source: D,
        policy: P,
        queue: Arc<PacketQueue>,
        continue_read: Arc<ContinueRead>,
    ) -> Self {
        Self {
            source,
            policy,
            queue,
            continue_read,
            finished: Arc::new(AtomicI32::new(0)),
            pkt_serial: -1,
            pending: None,
            start_pts: f64::NAN,
        }
    }

    /// Declared stream start used to seed the timestamp predictor after a
    /// generation change (containers without timestamps).
    pub fn set_start_pts(&mut self, start_pts: f64) {
        self.start_pts = start_pts;
    }

    /// Shared view of the finished marker, observed by the read driver's
    /// end-of-stream detection.
    pub fn finished_handle(&self) -> Arc<AtomicI32> {
        self.finished.clone()
    }

    /// Produce the next decoded frame of the live generation.
    pub fn decode_frame(&mut self) -> DecodeOutcome<D::Frame> {
        loop {
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return DecodeOutcome::Aborted;
                    }
                    match self.source.receive() {
                        Receive::Frame(mut frame) => {
                            self.policy.stamp(&mut frame);
                            return DecodeOutcome::Frame {
                                frame,
                                serial: self.pkt_serial,
                            };
                        }
                        Receive::EndOfStream => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.source.flush();
                            return DecodeOutcome::Finished;
                        }
                        Receive::NeedMoreInput => break,
                    }
                }
            }

            let packet = loop {
                if self.queue.nb_packets() == 0 {
                    // Let the read driver reevaluate its backpressure wait.
                    self.continue_read.notify();
                }
                let packet = if let Some(pending) = self.pending.take() {
                    pending
                } else {
                    match self.queue.get(true) {
                        Got::Packet { packet, serial } => {
                            if serial != self.pkt_serial {
                                self.source.flush();
                                self.finished.store(0, Ordering::Release);
                                self.policy.reset(self.start_pts);
                            }
                            self.pkt_serial = serial;
                            packet
                        }
                        Got::Aborted => return DecodeOutcome::Aborted,
                        Got::WouldBlock => continue,
                    }
                };
                if self.queue.serial() == self.pkt_serial {
                    break packet;
                }
                // Stale generation; the payload is void.
            };

            match self.source.send(&packet) {
                SendOutcome::Accepted => {}
                SendOutcome::NeedsDrain => {
                    // receive() and send() disagreeing is a protocol
                    // violation on the source's side; hold the packet and
                    // retry rather than losing it.
                    tracing::error!(
                        source = self.source.name(),
                        "decode source returned NeedsDrain with no output pending"
                    );
                    self.pending = Some(packet);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Scripted source: one output frame per accepted non-EOS packet, and
    /// optionally one NeedsDrain refusal first.
    struct MockSource {
        buffered: Vec<Picture>,
        draining: bool,
        refuse_next_send: bool,
        flushes: usize,
        accepted: usize,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                buffered: Vec::new(),
                draining: false,
                refuse_next_send: false,
                flushes: 0,
                accepted: 0,
            }
        }
    }

    impl DecodeSource for MockSource {
        type Frame = Picture;

        fn send(&mut self, packet: &Packet) -> SendOutcome {
            if self.refuse_next_send {
                self.refuse_next_send = false;
                return SendOutcome::NeedsDrain;
            }
            if packet.eos {
                self.draining = true;
            } else {
                self.accepted += 1;
                self.buffered.push(Picture {
                    pts: packet.pts,
                    best_effort_pts: packet.pts,
                    dts: packet.pts,
                    pos: packet.pos,
                    ..Picture::default()
                });
            }
            SendOutcome::Accepted
        }

        fn receive(&mut self) -> Receive<Picture> {
            if let Some(frame) = self.buffered.pop() {
                Receive::Frame(frame)
            } else if self.draining {
                self.draining = false;
                Receive::EndOfStream
            } else {
                Receive::NeedMoreInput
            }
        }

        fn flush(&mut self) {
            self.buffered.clear();
            self.draining = false;
            self.flushes += 1;
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn harness() -> (
        Decoder<MockSource, VideoTimestamps>,
        Arc<PacketQueue>,
        Arc<ContinueRead>,
    ) {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let continue_read = Arc::new(ContinueRead::new());
        let decoder = Decoder::new(
            MockSource::new(),
            VideoTimestamps {
                reorder: ReorderMode::Auto,
            },
            queue.clone(),
            continue_read.clone(),
        );
        (decoder, queue, continue_read)
    }

    fn pkt(pts: f64) -> Packet {
        Packet::new(Bytes::from_static(b"unit"), pts, 0.04, -1)
    }

    #[test]
    fn decodes_in_order_with_live_serial() {
        let (mut decoder, queue, _) = harness();
        queue.put(pkt(0.0)).unwrap();
        queue.put(pkt(0.04)).unwrap();
        for expected in [0.0, 0.04] {
            match decoder.decode_frame() {
                DecodeOutcome::Frame { frame, serial } => {
                    assert_eq!(frame.pts, expected);
                    assert_eq!(serial, queue.serial());
                }
                _ => panic!("expected frame"),
            }
        }
    }

    #[test]
    fn eos_sets_finished_marker_for_generation() {
        let (mut decoder, queue, _) = harness();
        queue.put_eos().unwrap();
        let finished = decoder.finished_handle();
        assert!(matches!(decoder.decode_frame(), DecodeOutcome::Finished));
        assert_eq!(finished.load(Ordering::Acquire), queue.serial());
    }

    #[test]
    fn stale_packets_are_discarded_after_flush() {
        let (mut decoder, queue, _) = harness();
        queue.put(pkt(1.0)).unwrap();
        queue.flush();
        queue.put(pkt(9.0)).unwrap();
        match decoder.decode_frame() {
            DecodeOutcome::Frame { frame, serial } => {
                // Only the post-flush packet survives.
                assert_eq!(frame.pts, 9.0);
                assert_eq!(serial, queue.serial());
            }
            _ => panic!("expected frame"),
        }
        // The generation change reset the source.
        assert_eq!(decoder.source.flushes, 1);
    }

    #[test]
    fn needs_drain_anomaly_is_retried_not_fatal() {
        let (mut decoder, queue, _) = harness();
        decoder.source.refuse_next_send = true;
        queue.put(pkt(2.0)).unwrap();
        match decoder.decode_frame() {
            DecodeOutcome::Frame { frame, .. } => assert_eq!(frame.pts, 2.0),
            _ => panic!("expected frame after retry"),
        }
        assert_eq!(decoder.source.accepted, 1);
    }

    #[test]
    fn abort_stops_the_driver() {
        let (mut decoder, queue, _) = harness();
        queue.abort();
        assert!(matches!(decoder.decode_frame(), DecodeOutcome::Aborted));
    }

    #[test]
    fn audio_pts_synthesis_extrapolates() {
        let mut policy = AudioTimestamps::new();
        policy.reset(10.0);
        let mut block = AudioBlock {
            samples: vec![0.0; 960 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: f64::NAN,
            pos: -1,
        };
        policy.stamp(&mut block);
        assert_eq!(block.pts, 10.0);
        let mut second = AudioBlock {
            samples: vec![0.0; 960 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: f64::NAN,
            pos: -1,
        };
        policy.stamp(&mut second);
        assert!((second.pts - 10.02).abs() < 1e-9);
    }

    #[test]
    fn reorder_off_prefers_decode_order() {
        let mut policy = VideoTimestamps {
            reorder: ReorderMode::Off,
        };
        let mut picture = Picture {
            pts: 1.0,
            best_effort_pts: 2.0,
            dts: 3.0,
            ..Picture::default()
        };
        policy.stamp(&mut picture);
        assert_eq!(picture.pts, 3.0);
    }
}
