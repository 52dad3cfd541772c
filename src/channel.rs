//! One direction of one radio channel, as seen by the application

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    config::{Direction, SampleFormat, StreamConfig},
    convert,
    error::{Result, StreamError},
    fifo::{PacketFlags, RingFifo, MIN_PACKETS},
    lock,
    streamer::Shared,
    Complex16, Complex32, SAMPLES12_IN_PKT,
};

/// Samples converted per pass through the stack scratch buffer
const CHUNK: usize = SAMPLES12_IN_PKT;

/// Timing information travelling with a block of samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Timestamp of the first sample
    pub timestamp: u64,
    pub flags: PacketFlags,
}

impl Metadata {
    /// Samples to be sent at `timestamp`
    pub fn at(timestamp: u64) -> Self {
        Self {
            timestamp,
            flags: PacketFlags::SYNC_TIMESTAMP,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub fifo_size: usize,
    pub fifo_filled: usize,
    pub overrun: u32,
    pub underrun: u32,
    pub active: bool,
    /// Packets lost since the previous query
    pub dropped_packets: u64,
    /// Last timestamp seen on the link in this direction
    pub timestamp: u64,
    /// Link throughput in bytes per second
    pub link_rate: u64,
}

pub struct StreamChannel {
    direction: Direction,
    index: usize,
    used: AtomicBool,
    active: AtomicBool,
    pkt_lost: AtomicU64,
    config: Mutex<StreamConfig>,
    fifo: RingFifo,
    streamer: Weak<Shared>,
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("direction", &self.direction)
            .field("index", &self.index)
            .field("used", &self.is_used())
            .field("active", &self.is_active())
            .field("fifo", &self.fifo.info())
            .finish()
    }
}

impl StreamChannel {
    pub(crate) fn new(direction: Direction, index: usize, streamer: Weak<Shared>) -> Self {
        let config = StreamConfig {
            direction,
            channel: index,
            ..Default::default()
        };
        Self {
            direction,
            index,
            used: AtomicBool::new(false),
            active: AtomicBool::new(false),
            pkt_lost: AtomicU64::new(0),
            config: Mutex::new(config),
            fifo: RingFifo::new(),
            streamer,
        }
    }

    /// Take on `config` and allocate the ring for it
    pub(crate) fn setup(&self, config: StreamConfig) {
        let packet_len = config.link_format.samples_per_packet();
        let length = config.effective_buffer_length().max(MIN_PACKETS * packet_len);
        self.fifo.resize(packet_len, Some(length / packet_len));
        debug!(
            "{} channel {}: ring of {} samples, {} link",
            self.direction,
            self.index,
            self.fifo.size(),
            config.link_format
        );
        *lock(&self.config) = config;
        self.pkt_lost.store(0, Ordering::Relaxed);
        self.used.store(true, Ordering::Release);
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Channel index on the chip
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> StreamConfig {
        lock(&self.config).clone()
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn force_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Used and active
    pub(crate) fn is_streaming(&self) -> bool {
        self.is_used() && self.is_active()
    }

    pub(crate) fn fifo(&self) -> &RingFifo {
        &self.fifo
    }

    pub(crate) fn add_lost_packets(&self, count: u64) {
        self.pkt_lost.fetch_add(count, Ordering::Relaxed);
    }

    fn accepts(&self, direction: Direction) -> bool {
        self.is_used() && self.direction == direction
    }

    /// Queue integer samples for transmission. Returns how many were queued,
    /// 0 on a receive channel or one configured for floats.
    pub fn write(&self, samples: &[Complex16], meta: &Metadata, timeout: Duration) -> usize {
        if !self.accepts(Direction::Tx) {
            return 0;
        }
        let config = self.config();
        if config.format == SampleFormat::Float32 {
            return 0;
        }
        if convert::is_passthrough(config.format, config.link_format) {
            return self
                .fifo
                .push_samples(samples, meta.timestamp, timeout, meta.flags);
        }
        self.push_converted(samples, meta, timeout, |src, dst| {
            convert::int_to_link(src, config.format, config.link_format, dst)
        })
    }

    /// Queue normalized float samples for transmission
    pub fn write_f32(&self, samples: &[Complex32], meta: &Metadata, timeout: Duration) -> usize {
        if !self.accepts(Direction::Tx) {
            return 0;
        }
        let config = self.config();
        if config.format != SampleFormat::Float32 {
            return 0;
        }
        self.push_converted(samples, meta, timeout, |src, dst| {
            convert::float_to_link(src, config.link_format, dst)
        })
    }

    /// Convert through a fixed scratch chunk and push. Only the final chunk
    /// carries [`PacketFlags::END_BURST`].
    fn push_converted<T>(
        &self,
        samples: &[T],
        meta: &Metadata,
        timeout: Duration,
        convert: impl Fn(&[T], &mut [Complex16]),
    ) -> usize {
        let mut scratch = [Complex16::new(0, 0); CHUNK];
        let deadline = Instant::now().checked_add(timeout);
        let mut pushed = 0;
        for chunk in samples.chunks(CHUNK) {
            let last = pushed + chunk.len() == samples.len();
            let mut flags = meta.flags;
            if !last {
                flags.remove(PacketFlags::END_BURST);
            }
            let converted = &mut scratch[..chunk.len()];
            convert(chunk, converted);
            let n = self.fifo.push_samples(
                converted,
                meta.timestamp.wrapping_add(pushed as u64),
                remaining(deadline),
                flags,
            );
            pushed += n;
            if n < chunk.len() {
                break;
            }
        }
        pushed
    }

    /// Take received integer samples. Returns the count, the timestamp of
    /// the first one lands in `meta`.
    pub fn read(&self, samples: &mut [Complex16], meta: &mut Metadata, timeout: Duration) -> usize {
        if !self.accepts(Direction::Rx) {
            return 0;
        }
        let config = self.config();
        if config.format == SampleFormat::Float32 {
            return 0;
        }
        let (popped, timestamp) = self.fifo.pop_samples(samples, timeout);
        convert::link_to_int(&mut samples[..popped], config.format, config.link_format);
        if popped > 0 {
            meta.timestamp = timestamp;
        }
        meta.flags.insert(PacketFlags::SYNC_TIMESTAMP);
        popped
    }

    /// Take received samples as normalized floats
    pub fn read_f32(&self, samples: &mut [Complex32], meta: &mut Metadata, timeout: Duration) -> usize {
        if !self.accepts(Direction::Rx) {
            return 0;
        }
        let config = self.config();
        if config.format != SampleFormat::Float32 {
            return 0;
        }
        let mut scratch = [Complex16::new(0, 0); CHUNK];
        let deadline = Instant::now().checked_add(timeout);
        let mut popped = 0;
        for chunk in samples.chunks_mut(CHUNK) {
            let raw = &mut scratch[..chunk.len()];
            let (n, timestamp) = self.fifo.pop_samples(raw, remaining(deadline));
            if popped == 0 && n > 0 {
                meta.timestamp = timestamp;
            }
            convert::link_to_float(&raw[..n], config.link_format, &mut chunk[..n]);
            popped += n;
            if n < chunk.len() {
                break;
            }
        }
        meta.flags.insert(PacketFlags::SYNC_TIMESTAMP);
        popped
    }

    fn streamer(&self) -> Result<Arc<Shared>> {
        self.streamer.upgrade().ok_or(StreamError::StreamerDropped)
    }

    /// Begin streaming, starting the worker loops if needed
    pub fn start(&self) -> Result<()> {
        if !self.is_used() {
            return Err(StreamError::NotConfigured);
        }
        let shared = self.streamer()?;
        self.fifo.clear();
        self.pkt_lost.store(0, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
        info!("{} channel {} started", self.direction, self.index);
        shared.update_threads(false).map_err(|e| {
            self.active.store(false, Ordering::Relaxed);
            e
        })
    }

    pub fn stop(&self) -> Result<()> {
        if !self.is_used() {
            return Err(StreamError::NotConfigured);
        }
        self.active.store(false, Ordering::Relaxed);
        info!("{} channel {} stopped", self.direction, self.index);
        self.streamer()?.update_threads(false)
    }

    /// Stop if running and give the channel slot back. The slot is freed
    /// even when stopping fails.
    pub fn close(&self) -> Result<()> {
        if !self.is_used() {
            return Ok(());
        }
        let stopped = if self.is_active() { self.stop() } else { Ok(()) };
        self.used.store(false, Ordering::Release);
        self.fifo.release();
        stopped
    }

    /// Ring and link statistics. Reading resets the dropped packet count.
    pub fn info(&self) -> ChannelInfo {
        if !self.is_used() {
            return ChannelInfo::default();
        }
        let fifo = self.fifo.info();
        let (timestamp, link_rate) = match self.streamer.upgrade() {
            Some(shared) => (
                shared.stats.last_timestamp(self.direction),
                shared.stats.rate(self.direction),
            ),
            None => (0, 0),
        };
        ChannelInfo {
            fifo_size: fifo.size,
            fifo_filled: fifo.items_filled,
            overrun: fifo.overflow,
            underrun: fifo.underflow,
            active: self.is_active(),
            dropped_packets: self.pkt_lost.swap(0, Ordering::Relaxed),
            timestamp,
            link_rate,
        }
    }

    /// Samples moved per transfer in this channel's direction
    pub fn stream_size(&self) -> usize {
        match self.streamer.upgrade() {
            Some(shared) if self.is_used() => shared.stream_size(self.direction),
            _ => 0,
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
}
