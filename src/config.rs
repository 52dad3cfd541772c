//! Stream configuration supplied by the application

use std::fmt;

use crate::{SAMPLES12_IN_PKT, SAMPLES16_IN_PKT};

/// Buffer length used when the application leaves it at zero
pub const DEFAULT_BUFFER_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// Sample format seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Full scale 16 bit integers
    #[default]
    Int16,
    /// Normalized to [-1.0, 1.0]
    Float32,
    /// 12 bit values carried in 16 bit integers
    Int12,
}

/// Sample encoding on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkFormat {
    /// Three bytes per complex sample
    #[default]
    Int12,
    /// Four bytes per complex sample
    Int16,
}

impl LinkFormat {
    /// Complex samples a single packet payload holds, shared by all channels
    pub fn samples_per_packet(self) -> usize {
        match self {
            LinkFormat::Int12 => SAMPLES12_IN_PKT,
            LinkFormat::Int16 => SAMPLES16_IN_PKT,
        }
    }

    /// Largest magnitude a normalized sample is scaled to
    pub fn full_scale(self) -> f32 {
        match self {
            LinkFormat::Int12 => 2047.0,
            LinkFormat::Int16 => 32767.0,
        }
    }

    pub fn is_packed(self) -> bool {
        self == LinkFormat::Int12
    }
}

impl fmt::Display for LinkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFormat::Int12 => write!(f, "12-bit packed"),
            LinkFormat::Int16 => write!(f, "16-bit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub direction: Direction,
    /// Channel index on the chip, 0 (A) or 1 (B)
    pub channel: usize,
    pub format: SampleFormat,
    pub link_format: LinkFormat,
    /// Ring buffer length in samples, 0 selects [`DEFAULT_BUFFER_LENGTH`]
    pub buffer_length: usize,
    /// 0.0 favours low latency, 1.0 favours throughput
    pub performance_latency: f32,
    /// Request phase alignment of the two RX channels
    pub align: bool,
}

impl StreamConfig {
    pub fn rx(channel: usize) -> Self {
        Self {
            direction: Direction::Rx,
            channel,
            ..Default::default()
        }
    }

    pub fn tx(channel: usize) -> Self {
        Self {
            direction: Direction::Tx,
            channel,
            ..Default::default()
        }
    }

    pub fn is_tx(&self) -> bool {
        self.direction == Direction::Tx
    }

    /// Ring buffer length in samples with the default applied
    pub fn effective_buffer_length(&self) -> usize {
        if self.buffer_length == 0 {
            DEFAULT_BUFFER_LENGTH
        } else {
            self.buffer_length
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Rx,
            channel: 0,
            format: SampleFormat::Int16,
            link_format: LinkFormat::Int12,
            buffer_length: 0,
            performance_latency: 0.5,
            align: false,
        }
    }
}
