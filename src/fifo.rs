//! Timestamped sample ring buffer
//!
//! Samples are kept in packets of a fixed length. Each packet carries the
//! timestamp of its first sample and a set of flags. Storage is a pair of
//! rtrb rings: one holds the samples, the other one header per packet. A
//! packet's samples are always committed before its header, so a consumer
//! that sees a header can read all of its samples.
//!
//! One thread produces and one thread consumes. Waiting for room or data is
//! done on condition variables with a caller supplied timeout, never by
//! spinning.

use std::{
    ops::{BitOr, BitOrAssign},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Condvar, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use num_traits::Zero;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::{lock, Complex16};

/// Shallowest ring, in packets
pub const MIN_PACKETS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// The timestamp is authoritative
    pub const SYNC_TIMESTAMP: PacketFlags = PacketFlags(1);
    /// Last packet of a burst, may be short
    pub const END_BURST: PacketFlags = PacketFlags(1 << 1);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        PacketFlags(bits & 0b11)
    }

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A packet of samples moved in and out of the ring as a whole
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePacket {
    pub samples: Box<[Complex16]>,
    /// Number of valid samples at the front of `samples`
    pub count: usize,
    /// Timestamp of `samples[0]`
    pub timestamp: u64,
    pub flags: PacketFlags,
}

impl SamplePacket {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![Complex16::zero(); capacity].into_boxed_slice(),
            count: 0,
            timestamp: 0,
            flags: PacketFlags::NONE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn filled(&self) -> &[Complex16] {
        &self.samples[..self.count]
    }

    /// Zero every sample and mark the packet full
    pub fn zero_fill(&mut self) {
        self.samples.fill(Complex16::zero());
        self.count = self.samples.len();
    }
}

/// Statistics snapshot, fields are read independently
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoInfo {
    /// Capacity in samples
    pub size: usize,
    /// Samples waiting to be consumed
    pub items_filled: usize,
    pub overflow: u32,
    pub underflow: u32,
}

#[derive(Debug, Clone, Copy)]
struct PacketHeader {
    timestamp: u64,
    count: usize,
    flags: PacketFlags,
}

struct Writer {
    samples: Producer<Complex16>,
    headers: Producer<PacketHeader>,
    packet_len: usize,
    /// Samples collected for the next packet
    pending: Vec<Complex16>,
    pending_timestamp: u64,
    pending_flags: PacketFlags,
}

impl Writer {
    fn has_room(&self) -> bool {
        self.headers.slots() > 0 && self.samples.slots() >= self.packet_len
    }

    /// Commit the samples then the header. Room must have been checked.
    fn publish(&mut self, samples: &[Complex16], header: PacketHeader) -> bool {
        let Ok(mut chunk) = self.samples.write_chunk(samples.len()) else {
            return false;
        };
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&samples[..split]);
        second.copy_from_slice(&samples[split..]);
        chunk.commit_all();
        self.headers.push(header).is_ok()
    }
}

struct Reader {
    samples: Consumer<Complex16>,
    headers: Consumer<PacketHeader>,
    /// Partially consumed packet
    current: Option<PacketHeader>,
}

impl Reader {
    fn has_data(&self) -> bool {
        self.current.is_some() || self.headers.slots() > 0
    }

    fn read_into(&mut self, dst: &mut [Complex16]) {
        if let Ok(chunk) = self.samples.read_chunk(dst.len()) {
            let (first, second) = chunk.as_slices();
            dst[..first.len()].copy_from_slice(first);
            dst[first.len()..].copy_from_slice(second);
            chunk.commit_all();
        }
    }

    fn discard_all(&mut self) {
        let queued = self.samples.slots();
        if let Ok(chunk) = self.samples.read_chunk(queued) {
            chunk.commit_all();
        }
        let queued = self.headers.slots();
        if let Ok(chunk) = self.headers.read_chunk(queued) {
            chunk.commit_all();
        }
        self.current = None;
    }
}

pub struct RingFifo {
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<Reader>>,
    packet_len: AtomicUsize,
    packets: AtomicUsize,
    queued: AtomicUsize,
    overflow: AtomicU32,
    underflow: AtomicU32,
    gate: Mutex<()>,
    readable: Condvar,
    writable: Condvar,
}

impl RingFifo {
    /// An empty ring with no storage, see [`RingFifo::resize`]
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            packet_len: AtomicUsize::new(0),
            packets: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            overflow: AtomicU32::new(0),
            underflow: AtomicU32::new(0),
            gate: Mutex::new(()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn with_capacity(packet_len: usize, packets: usize) -> Self {
        let fifo = Self::new();
        fifo.resize(packet_len, Some(packets));
        fifo
    }

    /// Reallocate for packets of `packet_len` samples, dropping all contents.
    /// Without an explicit packet count the current sample capacity is kept.
    /// The packet count is rounded up to a power of two, at least [`MIN_PACKETS`].
    pub fn resize(&self, packet_len: usize, packets: Option<usize>) {
        let packet_len = packet_len.max(1);
        let mut writer = lock(&self.writer);
        let mut reader = lock(&self.reader);
        let packets = packets
            .unwrap_or_else(|| self.size() / packet_len)
            .max(MIN_PACKETS)
            .next_power_of_two();

        let (sample_tx, sample_rx) = RingBuffer::new(packets * packet_len);
        let (header_tx, header_rx) = RingBuffer::new(packets);
        *writer = Some(Writer {
            samples: sample_tx,
            headers: header_tx,
            packet_len,
            pending: Vec::with_capacity(packet_len),
            pending_timestamp: 0,
            pending_flags: PacketFlags::NONE,
        });
        *reader = Some(Reader {
            samples: sample_rx,
            headers: header_rx,
            current: None,
        });
        self.packet_len.store(packet_len, Ordering::Relaxed);
        self.packets.store(packets, Ordering::Relaxed);
        self.reset_counters();
    }

    /// Drop all queued samples and zero the counters, keeping the storage
    pub fn clear(&self) {
        let mut writer = lock(&self.writer);
        let mut reader = lock(&self.reader);
        if let Some(writer) = writer.as_mut() {
            writer.pending.clear();
        }
        if let Some(reader) = reader.as_mut() {
            reader.discard_all();
        }
        self.reset_counters();
    }

    /// Free the storage. Every push and pop fails until the next resize.
    pub fn release(&self) {
        let mut writer = lock(&self.writer);
        let mut reader = lock(&self.reader);
        *writer = None;
        *reader = None;
        self.packets.store(0, Ordering::Relaxed);
        self.reset_counters();
    }

    fn reset_counters(&self) {
        self.queued.store(0, Ordering::Relaxed);
        self.overflow.store(0, Ordering::Relaxed);
        self.underflow.store(0, Ordering::Relaxed);
    }

    /// Samples per packet
    pub fn packet_len(&self) -> usize {
        self.packet_len.load(Ordering::Relaxed)
    }

    /// Capacity in samples
    pub fn size(&self) -> usize {
        self.packets.load(Ordering::Relaxed) * self.packet_len()
    }

    pub fn info(&self) -> FifoInfo {
        FifoInfo {
            size: self.size(),
            items_filled: self.queued.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            underflow: self.underflow.load(Ordering::Relaxed),
        }
    }

    /// Push samples, the first one stamped `timestamp`. Returns how many were
    /// accepted, which is short when no room frees up before `timeout`.
    /// A trailing partial packet is held back until more samples arrive,
    /// unless `flags` carries [`PacketFlags::END_BURST`].
    pub fn push_samples(
        &self,
        src: &[Complex16],
        timestamp: u64,
        timeout: Duration,
        flags: PacketFlags,
    ) -> usize {
        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return 0;
        };
        let deadline = Instant::now().checked_add(timeout);
        let packet_len = writer.packet_len;
        let mut taken = 0;

        while taken < src.len() {
            if writer.pending.is_empty() {
                // Room for a whole packet is reserved before filling it, so
                // the publish below cannot fail
                if !self.wait_for(&self.writable, deadline, || writer.has_room()) {
                    let refused = src.len() - taken;
                    let dropped = (refused + packet_len - 1) / packet_len;
                    self.overflow.fetch_add(dropped as u32, Ordering::Relaxed);
                    break;
                }
                writer.pending_timestamp = timestamp.wrapping_add(taken as u64);
            }
            let n = (packet_len - writer.pending.len()).min(src.len() - taken);
            writer.pending.extend_from_slice(&src[taken..taken + n]);
            writer.pending_flags = flags;
            taken += n;
            if writer.pending.len() == packet_len {
                self.flush_pending(writer);
            }
        }
        if flags.contains(PacketFlags::END_BURST) && !writer.pending.is_empty() {
            self.flush_pending(writer);
        }
        taken
    }

    fn flush_pending(&self, writer: &mut Writer) {
        let pending = std::mem::take(&mut writer.pending);
        let header = PacketHeader {
            timestamp: writer.pending_timestamp,
            count: pending.len(),
            flags: writer.pending_flags,
        };
        if writer.publish(&pending, header) {
            self.queued.fetch_add(pending.len(), Ordering::Relaxed);
            self.notify(&self.readable);
        }
        writer.pending = pending;
        writer.pending.clear();
    }

    /// Pop up to `dst.len()` samples. Returns the count and the timestamp of
    /// the first sample returned.
    pub fn pop_samples(&self, dst: &mut [Complex16], timeout: Duration) -> (usize, u64) {
        let mut guard = lock(&self.reader);
        let Some(reader) = guard.as_mut() else {
            return (0, 0);
        };
        let deadline = Instant::now().checked_add(timeout);
        let mut filled = 0;
        let mut first_timestamp = None;

        while filled < dst.len() {
            let mut current = match reader.current.take() {
                Some(current) => current,
                None => {
                    if !self.wait_for(&self.readable, deadline, || reader.has_data()) {
                        self.underflow.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    match reader.headers.pop() {
                        Ok(header) => header,
                        Err(_) => continue,
                    }
                }
            };
            let n = current.count.min(dst.len() - filled);
            first_timestamp.get_or_insert(current.timestamp);
            reader.read_into(&mut dst[filled..filled + n]);
            filled += n;
            current.count -= n;
            current.timestamp = current.timestamp.wrapping_add(n as u64);
            if current.count > 0 {
                reader.current = Some(current);
            }
            self.queued.fetch_sub(n, Ordering::Relaxed);
            self.notify(&self.writable);
        }
        (filled, first_timestamp.unwrap_or(0))
    }

    /// Publish one packet. Must not be mixed with [`RingFifo::push_samples`]
    /// on the same ring. Samples beyond the ring's packet length are dropped.
    pub fn push_packet(&self, packet: &SamplePacket, timeout: Duration) -> bool {
        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        let deadline = Instant::now().checked_add(timeout);
        if !self.wait_for(&self.writable, deadline, || writer.has_room()) {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let count = packet.count.min(writer.packet_len);
        let header = PacketHeader {
            timestamp: packet.timestamp,
            count,
            flags: packet.flags,
        };
        if !writer.publish(&packet.samples[..count], header) {
            return false;
        }
        self.queued.fetch_add(count, Ordering::Relaxed);
        self.notify(&self.readable);
        true
    }

    /// Take the next packet into `packet`, at most `packet.capacity()` samples
    pub fn pop_packet(&self, packet: &mut SamplePacket, timeout: Duration) -> bool {
        let mut guard = lock(&self.reader);
        let Some(reader) = guard.as_mut() else {
            return false;
        };
        let deadline = Instant::now().checked_add(timeout);
        let mut current = match reader.current.take() {
            Some(current) => current,
            None => {
                if !self.wait_for(&self.readable, deadline, || reader.has_data()) {
                    self.underflow.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                match reader.headers.pop() {
                    Ok(header) => header,
                    Err(_) => return false,
                }
            }
        };
        let n = current.count.min(packet.capacity());
        reader.read_into(&mut packet.samples[..n]);
        packet.count = n;
        packet.timestamp = current.timestamp;
        packet.flags = current.flags;
        current.count -= n;
        current.timestamp = current.timestamp.wrapping_add(n as u64);
        if current.count > 0 {
            reader.current = Some(current);
        }
        self.queued.fetch_sub(n, Ordering::Relaxed);
        self.notify(&self.writable);
        true
    }

    /// Block on `cv` until `ready` holds or the deadline passes
    fn wait_for(
        &self,
        cv: &Condvar,
        deadline: Option<Instant>,
        mut ready: impl FnMut() -> bool,
    ) -> bool {
        let mut gate = lock(&self.gate);
        loop {
            if ready() {
                return true;
            }
            match deadline {
                None => gate = cv.wait(gate).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    gate = cv
                        .wait_timeout(gate, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn notify(&self, cv: &Condvar) {
        // Taking the gate orders this wake-up after any waiter's check
        let _gate = lock(&self.gate);
        cv.notify_all();
    }
}

impl Default for RingFifo {
    fn default() -> Self {
        Self::new()
    }
}
