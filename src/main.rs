use std::{
    error::Error,
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use limestream::{
    sim::{SimulatedChip, SimulatedFpga, SimulatedPort},
    Complex16, Complex32, Direction, LinkFormat, Metadata, SampleFormat, StreamChannel,
    StreamConfig, Streamer, PACKET_SIZE,
};
use tracing::{debug, info, warn};

mod args;

const IO_TIMEOUT: Duration = Duration::from_millis(100);
const REPORT_PERIOD: Duration = Duration::from_secs(1);
const TONE_AMPLITUDE: f64 = 0.7;

/// Complex exponential generator
struct Tone {
    phase: f64,
    step: f64,
}

impl Tone {
    fn new(fraction: f64) -> Self {
        Self {
            phase: 0.0,
            step: TAU * fraction,
        }
    }

    fn fill(&mut self, out: &mut [Complex32]) {
        for sample in out.iter_mut() {
            *sample = Complex32::new(
                (TONE_AMPLITUDE * self.phase.cos()) as f32,
                (TONE_AMPLITUDE * self.phase.sin()) as f32,
            );
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

fn integer_scale(format: SampleFormat) -> f32 {
    match format {
        SampleFormat::Int12 => LinkFormat::Int12.full_scale(),
        _ => LinkFormat::Int16.full_scale(),
    }
}

/// Write the tone to every TX channel, paced to the sample rate
fn transmit_tone(
    channels: Vec<Arc<StreamChannel>>,
    format: SampleFormat,
    sample_rate: f64,
    fraction: f64,
    block: usize,
    stop: Arc<AtomicBool>,
) {
    let mut tone = Tone::new(fraction);
    let mut floats = vec![Complex32::new(0.0, 0.0); block];
    let mut ints = vec![Complex16::new(0, 0); block];
    let scale = integer_scale(format);
    let start = Instant::now();
    let mut timestamp = 0u64;

    while !stop.load(Ordering::Relaxed) {
        tone.fill(&mut floats);
        for (int, float) in ints.iter_mut().zip(&floats) {
            *int = Complex16::new((float.re * scale) as i16, (float.im * scale) as i16);
        }
        let meta = Metadata::at(timestamp);
        for channel in &channels {
            let written = match format {
                SampleFormat::Float32 => channel.write_f32(&floats, &meta, IO_TIMEOUT),
                _ => channel.write(&ints, &meta, IO_TIMEOUT),
            };
            if written < block {
                debug!(written, "TX ring full");
            }
        }
        timestamp += block as u64;

        let due = Duration::from_secs_f64(timestamp as f64 / sample_rate);
        if let Some(ahead) = due.checked_sub(start.elapsed()) {
            thread::sleep(ahead);
        }
    }
}

/// Feed every sent wire packet back in as received data
fn loopback(port: Arc<SimulatedPort>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        if let Some(transfer) = port.next_transfer(IO_TIMEOUT) {
            for packet in transfer.chunks_exact(PACKET_SIZE) {
                port.inject(packet.to_vec());
            }
        }
    }
}

fn report(channels: &[Arc<StreamChannel>]) {
    for channel in channels {
        let stats = channel.info();
        info!(
            "{} {}: {}/{} queued, {} overrun, {} underrun, {} dropped, ts {}, {:.2} MB/s",
            channel.direction(),
            channel.index(),
            stats.fifo_filled,
            stats.fifo_size,
            stats.overrun,
            stats.underrun,
            stats.dropped_packets,
            stats.timestamp,
            stats.link_rate as f64 / 1e6
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = args::Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(args.verbose.log_level_filter()))
        .init();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("Stopping");
        handler_stop.store(true, Ordering::Relaxed);
    })?;

    let port = Arc::new(SimulatedPort::new(4));
    let fpga = Arc::new(SimulatedFpga::new());
    let chip = Arc::new(SimulatedChip::new(args.sample_rate));
    let streamer = Streamer::new(port.clone(), fpga, chip, 0);

    let format = SampleFormat::from(args.format);
    let link = LinkFormat::from(args.link);
    let setup = |direction, channel| {
        streamer.setup_stream(StreamConfig {
            direction,
            channel,
            format,
            link_format: link,
            buffer_length: args.buffer_length,
            performance_latency: args.latency,
            align: false,
        })
    };
    let mut rx = Vec::new();
    let mut tx = Vec::new();
    for index in 0..usize::from(args.channels) {
        rx.push(setup(Direction::Rx, index)?);
        tx.push(setup(Direction::Tx, index)?);
    }
    for channel in rx.iter().chain(&tx) {
        channel.start()?;
    }
    info!(
        "Streaming {} channel(s) over a {} link, batch {} packets",
        args.channels,
        streamer.link_format(),
        streamer.batch_size(Direction::Rx)
    );

    let block = streamer.link_format().samples_per_packet() / rx.len();
    let feeder = {
        let channels = tx.clone();
        let stop = stop.clone();
        let (rate, tone) = (args.sample_rate, args.tone);
        thread::Builder::new()
            .name("tone".into())
            .spawn(move || transmit_tone(channels, format, rate, tone, block, stop))?
    };
    let looper = {
        let port = port.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("loopback".into())
            .spawn(move || loopback(port, stop))?
    };

    let started = Instant::now();
    let mut last_report = started;
    let mut ints = vec![Complex16::new(0, 0); block];
    let mut floats = vec![Complex32::new(0.0, 0.0); block];
    let mut meta = Metadata::default();
    let mut received = 0usize;

    while !stop.load(Ordering::Relaxed) {
        for channel in &rx {
            received += match format {
                SampleFormat::Float32 => channel.read_f32(&mut floats, &mut meta, IO_TIMEOUT),
                _ => channel.read(&mut ints, &mut meta, IO_TIMEOUT),
            };
        }
        if last_report.elapsed() >= REPORT_PERIOD {
            last_report = Instant::now();
            info!("{} samples received, last at {}", received, meta.timestamp);
            report(&rx);
            report(&tx);
        }
        if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
            stop.store(true, Ordering::Relaxed);
        }
    }

    if feeder.join().is_err() {
        warn!("Tone thread panicked");
    }
    if looper.join().is_err() {
        warn!("Loopback thread panicked");
    }
    for channel in rx.iter().chain(&tx) {
        channel.close()?;
    }
    Ok(())
}
