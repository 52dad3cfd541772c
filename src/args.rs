//! Argument parsing for running from the command line

use clap::{Parser, ValueEnum};
use limestream::{LinkFormat, SampleFormat};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Packed 12 bit samples
    I12,
    I16,
}

impl From<Link> for LinkFormat {
    fn from(link: Link) -> Self {
        match link {
            Link::I12 => LinkFormat::Int12,
            Link::I16 => LinkFormat::Int16,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    I12,
    I16,
    F32,
}

impl From<Format> for SampleFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::I12 => SampleFormat::Int12,
            Format::I16 => SampleFormat::Int16,
            Format::F32 => SampleFormat::Float32,
        }
    }
}

/// Loop a test tone through a simulated board and report stream statistics
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Number of RX channels to stream (1 or 2)
    #[clap(short, long, default_value_t = 1)]
    #[clap(value_parser = clap::value_parser!(u8).range(1..=2))]
    pub channels: u8,
    /// Sample format on the wire
    #[clap(short, long, value_enum, default_value_t = Link::I12)]
    pub link: Link,
    /// Sample format handed to the application
    #[clap(short, long, value_enum, default_value_t = Format::I16)]
    pub format: Format,
    /// Sample rate in Hz, which sets the transfer batch size
    #[clap(short, long, default_value_t = 10e6)]
    pub sample_rate: f64,
    /// Ring buffer length in samples, 0 for the default
    #[clap(short, long, default_value_t = 0)]
    pub buffer_length: usize,
    /// 0.0 for lowest latency, 1.0 for highest throughput
    #[clap(short = 'p', long, default_value_t = 0.5)]
    pub latency: f32,
    /// Seconds to run for, 0 runs until interrupted
    #[clap(short, long, default_value_t = 0)]
    pub duration: u64,
    /// Test tone frequency as a fraction of the sample rate
    #[clap(short, long, default_value_t = 0.01)]
    pub tone: f64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["limestream"]);
        assert_eq!(args.channels, 1);
        assert_eq!(args.link, Link::I12);
        assert_eq!(SampleFormat::from(args.format), SampleFormat::Int16);
    }

    #[test]
    fn rejects_a_third_channel() {
        assert!(Args::try_parse_from(["limestream", "-c", "3"]).is_err());
        let args = Args::parse_from(["limestream", "-c", "2", "-l", "i16", "-f", "f32"]);
        assert_eq!(LinkFormat::from(args.link), LinkFormat::Int16);
        assert_eq!(args.format, Format::F32);
    }
}
