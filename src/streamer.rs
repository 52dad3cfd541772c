//! The streaming engine of one radio chip.
//!
//! A [`Streamer`] owns two RX and two TX [`StreamChannel`]s and at most one
//! receive and one transmit worker thread. Worker threads are only started and
//! stopped from [`Streamer::update_threads`], which channels call when they
//! start or stop. Anything the workers depend on (link format, batch sizes,
//! which channels are in use) is only changed while they are stopped.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use tracing::{error, info, warn};

use crate::{
    align::{AlignOutcome, Aligner},
    capture,
    channel::StreamChannel,
    config::{Direction, LinkFormat, StreamConfig},
    error::{Result, StreamError},
    hal::{fields, fpga_regs, DataPort, Fpga, RadioChip},
    lock,
    monitoring::LinkStats,
    priority, transmit, MAX_CHANNELS,
};

/// Upper bound on packets per transfer
pub const MAX_BATCH_SIZE: usize = 64;

/// Packets per transfer for a stream: the largest power of two strictly below
/// `(rate in MHz + 5) * latency * stream_size`, within `1..=MAX_BATCH_SIZE`
pub fn batch_size_for(sample_rate: f64, latency: f32, stream_size: usize) -> usize {
    let target = (sample_rate / 1e6 + 5.0) * f64::from(latency) * stream_size as f64;
    let mut batch = 1;
    while ((batch << 1) as f64) < target && batch < MAX_BATCH_SIZE {
        batch <<= 1;
    }
    batch
}

/// Everything a worker loop needs, fixed for its lifetime
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopParams {
    pub endpoint: u8,
    pub link: LinkFormat,
    /// Channel lanes per wire packet
    pub stream_size: usize,
    /// Wire packets per transfer
    pub batch: usize,
    pub slots: usize,
}

impl LoopParams {
    /// Samples per lane in one wire packet
    pub fn samples_per_packet(&self) -> usize {
        self.link.samples_per_packet() / self.stream_size
    }

    /// Lane carrying a channel's samples
    pub fn lane(&self, channel: usize) -> usize {
        if self.stream_size == MAX_CHANNELS {
            channel
        } else {
            0
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    terminate: Arc<AtomicBool>,
}

impl Worker {
    fn spawn(name: &str, run: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> Result<Self> {
        let terminate = Arc::new(AtomicBool::new(false));
        let flag = terminate.clone();
        let handle = priority::spawn_realtime(name, move || run(flag)).map_err(StreamError::Spawn)?;
        Ok(Self { handle, terminate })
    }

    fn stop(self) {
        self.terminate.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("Streaming worker panicked");
        }
    }
}

struct Control {
    rx_worker: Option<Worker>,
    tx_worker: Option<Worker>,
    link_format: LinkFormat,
    rx_batch: usize,
    tx_batch: usize,
    /// Channel indices with at least one direction in use
    stream_size: usize,
    timestamp_offset: u64,
    /// Whether the board has been told to stream
    hw_streaming: bool,
    worker_starts: usize,
}

impl Control {
    fn running(&self) -> bool {
        self.rx_worker.is_some() || self.tx_worker.is_some()
    }
}

/// State shared between the application facing handles and the workers
pub(crate) struct Shared {
    pub port: Arc<dyn DataPort>,
    pub fpga: Arc<dyn Fpga>,
    pub chip: Arc<dyn RadioChip>,
    pub chip_id: u8,
    pub rx: [Arc<StreamChannel>; MAX_CHANNELS],
    pub tx: [Arc<StreamChannel>; MAX_CHANNELS],
    pub stats: LinkStats,
    control: Mutex<Control>,
}

impl Shared {
    fn channels(&self, direction: Direction) -> &[Arc<StreamChannel>; MAX_CHANNELS] {
        match direction {
            Direction::Rx => &self.rx,
            Direction::Tx => &self.tx,
        }
    }

    fn all_channels(&self) -> impl Iterator<Item = &Arc<StreamChannel>> {
        self.rx.iter().chain(self.tx.iter())
    }

    fn channels_in_use(&self) -> usize {
        (0..MAX_CHANNELS)
            .filter(|&i| self.rx[i].is_used() || self.tx[i].is_used())
            .count()
    }

    /// 16 bit as soon as any channel in use asks for it
    fn required_link_format(&self) -> LinkFormat {
        if self
            .all_channels()
            .any(|c| c.is_used() && c.config().link_format == LinkFormat::Int16)
        {
            LinkFormat::Int16
        } else {
            LinkFormat::Int12
        }
    }

    pub fn stream_size(&self, direction: Direction) -> usize {
        let control = lock(&self.control);
        let batch = match direction {
            Direction::Rx => control.rx_batch,
            Direction::Tx => control.tx_batch,
        };
        self.required_link_format().samples_per_packet() * batch / control.stream_size.max(1)
    }

    pub fn update_threads(self: &Arc<Self>, stop_all: bool) -> Result<()> {
        let mut control = lock(&self.control);
        self.update_threads_locked(&mut control, stop_all)
    }

    fn update_threads_locked(self: &Arc<Self>, control: &mut Control, stop_all: bool) -> Result<()> {
        let need_rx = !stop_all && self.rx.iter().any(|c| c.is_streaming());
        let need_tx = !stop_all && self.tx.iter().any(|c| c.is_streaming());

        if !need_tx {
            if let Some(worker) = control.tx_worker.take() {
                worker.stop();
                info!("TX worker stopped");
            }
        }
        if !need_rx {
            if let Some(worker) = control.rx_worker.take() {
                worker.stop();
                info!("RX worker stopped");
            }
        }

        if (need_rx || need_tx) && !control.running() {
            self.configure_hardware(control)?;
        } else if !need_rx && !need_tx && control.hw_streaming {
            self.fpga.select_chip(self.chip_id)?;
            self.fpga.stop_streaming()?;
            control.hw_streaming = false;
        }

        if need_rx && control.rx_worker.is_none() {
            let params = self.loop_params(control, Direction::Rx);
            let shared = self.clone();
            let worker = Worker::spawn(&format!("lime-rx{}", self.chip_id), move |terminate| {
                capture::receive_packets(&shared, params, &terminate)
            })?;
            control.rx_worker = Some(worker);
            control.worker_starts += 1;
            info!(?params, "RX worker started");
        }
        if need_tx && control.tx_worker.is_none() {
            self.fpga.select_chip(self.chip_id)?;
            // Stop any waveform playback so it does not fight the stream
            self.fpga.write_register(fpga_regs::WFM_CTRL, 0)?;
            let params = self.loop_params(control, Direction::Tx);
            let shared = self.clone();
            let worker = Worker::spawn(&format!("lime-tx{}", self.chip_id), move |terminate| {
                transmit::transmit_packets(&shared, params, &terminate)
            })?;
            control.tx_worker = Some(worker);
            control.worker_starts += 1;
            info!(?params, "TX worker started");
        }
        Ok(())
    }

    fn loop_params(&self, control: &Control, direction: Direction) -> LoopParams {
        let batch = match direction {
            Direction::Rx => control.rx_batch,
            Direction::Tx => control.tx_batch,
        };
        LoopParams {
            endpoint: self.chip_id,
            link: control.link_format,
            stream_size: control.stream_size.clamp(1, MAX_CHANNELS),
            batch: self.port.negotiate_batch_size(batch),
            slots: self.port.slot_count().max(1),
        }
    }

    /// Resize every ring in use to packets of one wire packet's share
    fn resize_channel_buffers(&self, control: &Control) {
        let packet_len =
            control.link_format.samples_per_packet() / control.stream_size.clamp(1, MAX_CHANNELS);
        for channel in self.all_channels().filter(|c| c.is_used()) {
            channel.fifo().resize(packet_len, None);
        }
    }

    /// First start: program the board for the channels in use
    fn configure_hardware(&self, control: &mut Control) -> Result<()> {
        control.link_format = self.required_link_format();
        control.stream_size = self.channels_in_use();
        self.resize_channel_buffers(control);
        self.fpga.select_chip(self.chip_id)?;

        let align = self.rx.iter().all(|c| c.is_used()) && self.rx.iter().any(|c| c.config().align);
        if align {
            let aligner = Aligner::new(&*self.chip, &*self.fpga, &*self.port, self.chip_id);
            match aligner.align_rx_rf(true) {
                Ok(AlignOutcome::Aligned) => {}
                Ok(AlignOutcome::NotConverged) => warn!("Streaming with unaligned RX channels"),
                Err(e) => warn!("Streaming with unaligned RX channels: {}", e),
            }
        }

        self.fpga.stop_streaming()?;
        self.fpga.reset_timestamp()?;
        self.stats.set_last_timestamp(Direction::Rx, 0);
        self.port.reset_stream_buffers()?;

        let mut mode = if self.chip.field(fields::LML1_SISODDR)? != 0 {
            fpga_regs::MODE_SISO_DDR
        } else if self.chip.field(fields::LML1_TRXIQPULSE)? != 0 {
            fpga_regs::MODE_TRXIQ_PULSE
        } else {
            fpga_regs::MODE_MIMO
        };
        if control.link_format == LinkFormat::Int12 {
            mode |= fpga_regs::SAMPLE_WIDTH_12;
        }
        let enables = (0..MAX_CHANNELS)
            .filter(|&i| self.rx[i].is_used() || self.tx[i].is_used())
            .fold(0u16, |mask, i| mask | 1 << i);
        self.fpga.write_registers(&[
            (fpga_regs::MODE, mode),
            (fpga_regs::CHANNEL_ENABLE, enables),
        ])?;

        let ctrl = self.fpga.read_register(fpga_regs::INTERFACE_CTRL)?;
        self.fpga.start_streaming()?;
        control.hw_streaming = true;
        self.fpga.write_registers(&[
            (fpga_regs::INTERFACE_CTRL, ctrl | fpga_regs::CONFIG_LATCH),
            (fpga_regs::INTERFACE_CTRL, ctrl & !fpga_regs::CONFIG_LATCH),
        ])?;
        if !align {
            self.chip.reset_logic_registers()?;
        }
        info!(
            "Board streaming: {} link, {} channel(s), mode 0x{:04x}",
            control.link_format, control.stream_size, mode
        );
        Ok(())
    }
}

/// Streaming engine for one radio chip. Dropping it stops all streaming.
pub struct Streamer {
    shared: Arc<Shared>,
}

impl Streamer {
    /// `chip_id` selects the chip on the board and the data port endpoint
    pub fn new(
        port: Arc<dyn DataPort>,
        fpga: Arc<dyn Fpga>,
        chip: Arc<dyn RadioChip>,
        chip_id: u8,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak| {
            let channel = |direction, index| Arc::new(StreamChannel::new(direction, index, weak.clone()));
            Shared {
                port,
                fpga,
                chip,
                chip_id,
                rx: [channel(Direction::Rx, 0), channel(Direction::Rx, 1)],
                tx: [channel(Direction::Tx, 0), channel(Direction::Tx, 1)],
                stats: LinkStats::new(),
                control: Mutex::new(Control {
                    rx_worker: None,
                    tx_worker: None,
                    link_format: LinkFormat::Int12,
                    rx_batch: 1,
                    tx_batch: 1,
                    stream_size: 1,
                    timestamp_offset: 0,
                    hw_streaming: false,
                    worker_starts: 0,
                }),
            }
        });
        Self { shared }
    }

    /// Claim a channel slot for `config`. The channel index is taken modulo two.
    pub fn setup_stream(&self, mut config: StreamConfig) -> Result<Arc<StreamChannel>> {
        let shared = &self.shared;
        let mut control = lock(&shared.control);
        config.channel &= 1;
        let index = config.channel;
        let channel = shared.channels(config.direction)[index].clone();
        if channel.is_used() {
            error!("Setup stream: {} channel {} already in use", config.direction, index);
            return Err(StreamError::ChannelInUse {
                direction: config.direction,
                channel: index,
            });
        }

        if control.running() && !shared.rx[index].is_used() && !shared.tx[index].is_used() {
            warn!("Stopping data stream to set up a new stream");
            shared.update_threads_locked(&mut control, true)?;
        }
        if control.running() && config.link_format != control.link_format {
            error!("Stream setup failed: stream is already running with incompatible link format");
            return Err(StreamError::IncompatibleLinkFormat {
                requested: config.link_format,
                active: control.link_format,
            });
        }

        let direction = config.direction;
        let latency = config.performance_latency;
        channel.setup(config);
        control.stream_size = shared.channels_in_use();
        let rate = shared.chip.sample_rate(direction);
        let batch = batch_size_for(rate, latency, control.stream_size);
        match direction {
            Direction::Rx => control.rx_batch = batch,
            Direction::Tx => control.tx_batch = batch,
        }
        info!(
            "{} channel {} set up, {} packet(s) per transfer",
            direction, index, batch
        );
        Ok(channel)
    }

    /// The channel in a slot, whether set up or not
    pub fn channel(&self, direction: Direction, index: usize) -> Arc<StreamChannel> {
        self.shared.channels(direction)[index & 1].clone()
    }

    /// Start or stop worker threads to match the active channels
    pub fn update_threads(&self, stop_all: bool) -> Result<()> {
        self.shared.update_threads(stop_all)
    }

    /// Samples moved per transfer in `direction`
    pub fn stream_size(&self, direction: Direction) -> usize {
        self.shared.stream_size(direction)
    }

    pub fn batch_size(&self, direction: Direction) -> usize {
        let control = lock(&self.shared.control);
        match direction {
            Direction::Rx => control.rx_batch,
            Direction::Tx => control.tx_batch,
        }
    }

    /// Link format of the running stream, or of the last one
    pub fn link_format(&self) -> LinkFormat {
        lock(&self.shared.control).link_format
    }

    pub fn is_running(&self, direction: Direction) -> bool {
        let control = lock(&self.shared.control);
        match direction {
            Direction::Rx => control.rx_worker.is_some(),
            Direction::Tx => control.tx_worker.is_some(),
        }
    }

    /// Worker threads started over the streamer's life
    pub fn worker_starts(&self) -> usize {
        lock(&self.shared.control).worker_starts
    }

    pub fn stats(&self) -> &LinkStats {
        &self.shared.stats
    }

    /// Current board time. With nothing streaming the board counter is reset
    /// and this returns 0.
    pub fn hardware_timestamp(&self) -> Result<u64> {
        let shared = &self.shared;
        let mut control = lock(&shared.control);
        if control.running() {
            let last = shared.stats.last_timestamp(Direction::Rx);
            return Ok(last.wrapping_add(control.timestamp_offset));
        }
        // The board may not have been configured yet
        shared.fpga.select_chip(shared.chip_id)?;
        shared.fpga.stop_streaming()?;
        shared.fpga.reset_timestamp()?;
        control.hw_streaming = false;
        control.timestamp_offset = 0;
        Ok(0)
    }

    /// Make [`Streamer::hardware_timestamp`] read `now` at the last received timestamp
    pub fn set_hardware_timestamp(&self, now: u64) {
        let last = self.shared.stats.last_timestamp(Direction::Rx);
        lock(&self.shared.control).timestamp_offset = now.wrapping_sub(last);
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if let Err(e) = self.shared.update_threads(true) {
            warn!("Failed to stop streaming: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedChip, SimulatedFpga, SimulatedPort};

    struct Board {
        port: Arc<SimulatedPort>,
        fpga: Arc<SimulatedFpga>,
        chip: Arc<SimulatedChip>,
    }

    fn board() -> (Board, Streamer) {
        let port = Arc::new(SimulatedPort::new(4));
        let fpga = Arc::new(SimulatedFpga::new());
        let chip = Arc::new(SimulatedChip::new(10e6));
        let streamer = Streamer::new(port.clone(), fpga.clone(), chip.clone(), 0);
        (Board { port, fpga, chip }, streamer)
    }

    #[test]
    fn batch_sizes_are_bounded_powers_of_two() {
        assert_eq!(batch_size_for(0.0, 0.0, 1), 1);
        // (10 + 5) * 0.5 = 7.5
        assert_eq!(batch_size_for(10e6, 0.5, 1), 4);
        // Strictly below: 16 itself is not allowed
        assert_eq!(batch_size_for(11e6, 1.0, 1), 8);
        assert_eq!(batch_size_for(122.88e6, 1.0, 2), MAX_BATCH_SIZE);
        for rate in [1e6, 7e6, 30.72e6, 61.44e6] {
            let batch = batch_size_for(rate, 0.7, 2);
            assert!(batch.is_power_of_two() && batch <= MAX_BATCH_SIZE);
        }
    }

    #[test]
    fn second_setup_of_a_slot_is_refused() {
        let (_board, streamer) = board();
        streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        let err = streamer.setup_stream(StreamConfig::rx(0)).unwrap_err();
        assert!(matches!(
            err,
            StreamError::ChannelInUse {
                direction: Direction::Rx,
                channel: 0
            }
        ));
        // The other direction of the same index is free
        assert!(streamer.setup_stream(StreamConfig::tx(0)).is_ok());
    }

    #[test]
    fn running_stream_rejects_other_link_format() {
        let (_board, streamer) = board();
        let rx = streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        rx.start().unwrap();
        let err = streamer
            .setup_stream(StreamConfig {
                link_format: LinkFormat::Int16,
                ..StreamConfig::tx(0)
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::IncompatibleLinkFormat { .. }));
        assert!(!streamer.channel(Direction::Tx, 0).is_used());
        assert!(streamer.is_running(Direction::Rx));
    }

    #[test]
    fn new_channel_index_stops_running_stream() {
        let (_board, streamer) = board();
        let rx = streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        rx.start().unwrap();
        assert!(streamer.is_running(Direction::Rx));
        streamer.setup_stream(StreamConfig::rx(1)).unwrap();
        assert!(!streamer.is_running(Direction::Rx));
        // Two channels at 10 MHz: (10 + 5) * 0.5 * 2 = 15, batch of 8
        assert_eq!(streamer.batch_size(Direction::Rx), 8);
        assert_eq!(streamer.stream_size(Direction::Rx), 1360 * 8 / 2);
    }

    #[test]
    fn update_threads_is_idempotent() {
        let (board, streamer) = board();
        let rx = streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        rx.start().unwrap();
        let writes = board.fpga.writes();
        let starts = streamer.worker_starts();
        assert_eq!(starts, 1);

        streamer.update_threads(false).unwrap();
        assert_eq!(board.fpga.writes(), writes);
        assert_eq!(streamer.worker_starts(), starts);

        rx.stop().unwrap();
        assert!(!board.fpga.is_streaming());
        let writes = board.fpga.writes();
        streamer.update_threads(false).unwrap();
        streamer.update_threads(true).unwrap();
        assert_eq!(board.fpga.writes(), writes);
        assert_eq!(streamer.worker_starts(), starts);
    }

    #[test]
    fn first_start_programs_the_board() {
        let (board, streamer) = board();
        let tx = streamer
            .setup_stream(StreamConfig {
                link_format: LinkFormat::Int16,
                ..StreamConfig::tx(1)
            })
            .unwrap();
        tx.start().unwrap();
        assert_eq!(board.fpga.register(fpga_regs::MODE), fpga_regs::MODE_MIMO);
        assert_eq!(board.fpga.register(fpga_regs::CHANNEL_ENABLE), 0b10);
        assert_eq!(board.fpga.register(fpga_regs::WFM_CTRL), 0);
        assert_eq!(board.fpga.register(fpga_regs::CHIP_SELECT), 1);
        assert!(board.fpga.is_streaming());
        assert_eq!(board.chip.logic_resets(), 1);
        assert_eq!(board.port.resets(), 1);
        assert_eq!(streamer.link_format(), LinkFormat::Int16);
        assert!(streamer.is_running(Direction::Tx));
        assert!(!streamer.is_running(Direction::Rx));
        tx.close().unwrap();
        assert!(!streamer.is_running(Direction::Tx));
    }

    #[test]
    fn packed_sample_width_and_siso_mode() {
        let (board, streamer) = board();
        board.chip.modify_field(fields::LML1_SISODDR, 1).unwrap();
        let rx = streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        rx.start().unwrap();
        assert_eq!(
            board.fpga.register(fpga_regs::MODE),
            fpga_regs::MODE_SISO_DDR | fpga_regs::SAMPLE_WIDTH_12
        );
    }

    #[test]
    fn idle_timestamp_resets_the_board() {
        let (board, streamer) = board();
        streamer.set_hardware_timestamp(1000);
        assert_eq!(streamer.hardware_timestamp().unwrap(), 0);
        assert!(!board.fpga.is_streaming());

        let rx = streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        rx.start().unwrap();
        streamer.stats().set_last_timestamp(Direction::Rx, 500);
        streamer.set_hardware_timestamp(10_000);
        assert_eq!(streamer.hardware_timestamp().unwrap(), 10_000);
        streamer.stats().set_last_timestamp(Direction::Rx, 600);
        assert_eq!(streamer.hardware_timestamp().unwrap(), 10_100);
    }

    #[test]
    fn dropping_the_streamer_stops_workers() {
        let (board, streamer) = board();
        let rx = streamer.setup_stream(StreamConfig::rx(0)).unwrap();
        rx.start().unwrap();
        drop(streamer);
        assert!(!board.fpga.is_streaming());
        assert!(matches!(rx.start(), Err(StreamError::StreamerDropped)));
    }
}
