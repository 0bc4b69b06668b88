//! Serial-tagged packet queue.
//!
//! Bounded-by-convention FIFO of compressed units sitting between the read
//! driver and a decode driver. Every packet is tagged with the serial that
//! was current when it was enqueued; a flush increments the serial and
//! empties the queue, which is how everything downstream (decoders, frame
//! queues, clocks) recognizes pre-seek leftovers and discards them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

/// A queue is considered well-buffered once it holds this many packets.
pub const MIN_FRAMES: usize = 25;

/// A compressed unit handed over by the demuxer, or an end-of-stream
/// sentinel (`eos`) telling the decoder to drain.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    /// Presentation timestamp in seconds, NaN when the container had none.
    pub pts: f64,
    /// Duration in seconds, 0.0 when unknown.
    pub duration: f64,
    /// Byte position in the input, -1 when unknown.
    pub pos: i64,
    pub eos: bool,
}

impl Packet {
    pub fn new(data: Bytes, pts: f64, duration: f64, pos: i64) -> Self {
        Self {
            data,
            pts,
            duration,
            pos,
            eos: false,
        }
    }

    /// Drain sentinel enqueued once per stream when the input runs out.
    pub fn eos() -> Self {
        Self {
            data: Bytes::new(),
            pts: f64::NAN,
            duration: 0.0,
            pos: -1,
            eos: true,
        }
    }
}

/// Result of a [`PacketQueue::get`] call.
#[derive(Debug)]
pub enum Got {
    Packet { packet: Packet, serial: i32 },
    WouldBlock,
    Aborted,
}

#[derive(Debug, thiserror::Error)]
#[error("packet queue aborted")]
pub struct Aborted;

struct Inner {
    list: VecDeque<(Packet, i32)>,
    nb_packets: usize,
    size: usize,
    duration: f64,
    abort_request: bool,
    serial: i32,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    /// Mirror of the serial for lock-free staleness checks by clocks and
    /// frame queues. Written only while `inner` is held.
    serial_cell: Arc<AtomicI32>,
}

impl PacketQueue {
    /// Queues start in the aborted state, matching the lifecycle of the
    /// decode drivers: [`PacketQueue::start`] re-arms them.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                list: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0.0,
                abort_request: true,
                serial: 0,
            }),
            cond: Condvar::new(),
            serial_cell: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Shared handle onto the live serial, for clocks and frame queues.
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        self.serial_cell.clone()
    }

    pub fn serial(&self) -> i32 {
        self.serial_cell.load(Ordering::Acquire)
    }

    pub fn put(&self, packet: Packet) -> Result<(), Aborted> {
        let mut inner = self.inner.lock();
        if inner.abort_request {
            return Err(Aborted);
        }
        let serial = inner.serial;
        inner.nb_packets += 1;
        inner.size += packet.data.len() + std::mem::size_of::<Packet>();
        if packet.duration > 0.0 {
            inner.duration += packet.duration;
        }
        inner.list.push_back((packet, serial));
        self.cond.notify_one();
        Ok(())
    }

    pub fn put_eos(&self) -> Result<(), Aborted> {
        self.put(Packet::eos())
    }

    pub fn get(&self, block: bool) -> Got {
        let mut inner = self.inner.lock();
        loop {
            if inner.abort_request {
                return Got::Aborted;
            }
            if let Some((packet, serial)) = inner.list.pop_front() {
                inner.nb_packets -= 1;
                inner.size -= packet.data.len() + std::mem::size_of::<Packet>();
                if packet.duration > 0.0 {
                    inner.duration -= packet.duration;
                }
                return Got::Packet { packet, serial };
            }
            if !block {
                return Got::WouldBlock;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Discard everything queued and invalidate it for consumers that
    /// already pulled a packet out. Never blocks.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.list.clear();
        inner.nb_packets = 0;
        inner.size = 0;
        inner.duration = 0.0;
        inner.serial += 1;
        self.serial_cell.store(inner.serial, Ordering::Release);
        tracing::debug!(serial = inner.serial, "packet queue flushed");
    }

    /// Wake every blocked waiter permanently; used at teardown.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.abort_request = true;
        self.cond.notify_all();
    }

    /// Re-arm after construction or an abort. Bumps the serial so anything
    /// produced before the restart is recognizably stale.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.abort_request = false;
        inner.serial += 1;
        self.serial_cell.store(inner.serial, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().abort_request
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().nb_packets
    }

    /// Aggregate byte size, consumed by the read driver's ceiling check.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn duration(&self) -> f64 {
        self.inner.lock().duration
    }

    /// Soft "enough buffered" heuristic consumed by the read driver: the
    /// queue holds a comfortable number of packets and, when the container
    /// stamps durations at all, more than a second of media.
    pub fn has_enough_packets(&self) -> bool {
        let inner = self.inner.lock();
        inner.abort_request
            || (inner.nb_packets > MIN_FRAMES && (inner.duration <= 0.0 || inner.duration > 1.0))
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: u8, duration: f64) -> Packet {
        Packet::new(Bytes::from(vec![tag; 64]), tag as f64, duration, tag as i64)
    }

    fn started() -> PacketQueue {
        let q = PacketQueue::new();
        q.start();
        q
    }

    #[test]
    fn fifo_order_with_stable_serial() {
        let q = started();
        for tag in 0..5u8 {
            q.put(packet(tag, 0.04)).unwrap();
        }
        let serial = q.serial();
        for tag in 0..5u8 {
            match q.get(true) {
                Got::Packet { packet, serial: s } => {
                    assert_eq!(packet.data[0], tag);
                    assert_eq!(s, serial);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(q.get(false), Got::WouldBlock));
    }

    #[test]
    fn flush_discards_and_bumps_serial() {
        let q = started();
        q.put(packet(1, 0.0)).unwrap();
        q.put(packet(2, 0.0)).unwrap();
        let before = q.serial();
        q.flush();
        assert_eq!(q.nb_packets(), 0);
        assert!(q.serial() > before);
        assert!(matches!(q.get(false), Got::WouldBlock));
        // Packets enqueued after the flush carry the new serial.
        q.put(packet(3, 0.0)).unwrap();
        match q.get(true) {
            Got::Packet { serial, .. } => assert_eq!(serial, before + 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn double_flush_is_idempotent_on_contents() {
        let q = started();
        q.put(packet(1, 0.0)).unwrap();
        let s0 = q.serial();
        q.flush();
        let s1 = q.serial();
        q.flush();
        let s2 = q.serial();
        assert_eq!(q.nb_packets(), 0);
        assert!(s1 > s0 && s2 > s1);
    }

    #[test]
    fn abort_rejects_put_and_wakes_get() {
        let q = Arc::new(started());
        let waiter = {
            let q = q.clone();
            std::thread::spawn(move || matches!(q.get(true), Got::Aborted))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.abort();
        assert!(waiter.join().unwrap());
        assert!(q.put(packet(1, 0.0)).is_err());
    }

    #[test]
    fn enough_packets_heuristic() {
        let q = started();
        assert!(!q.has_enough_packets());
        for tag in 0..30u8 {
            q.put(packet(tag, 0.04)).unwrap();
        }
        // 30 packets, 1.2s of media.
        assert!(q.has_enough_packets());
    }

    #[test]
    fn size_tracks_payload_bytes() {
        let q = started();
        assert_eq!(q.size(), 0);
        q.put(packet(1, 0.0)).unwrap();
        assert!(q.size() >= 64);
        let _ = q.get(true);
        assert_eq!(q.size(), 0);
    }
}
