//! Sample streaming engine for USB-attached LMS7002M radio boards.
//!
//! Samples flow between application buffers and the board through per-channel
//! [`RingFifo`]s, with one receive and one transmit worker thread per
//! [`Streamer`] shuttling fixed-size wire packets to and from the data port.

use std::sync::{Mutex, MutexGuard, PoisonError};

use num_complex::Complex;

pub mod align;
mod capture;
pub mod channel;
pub mod config;
pub mod convert;
pub mod error;
pub mod fifo;
pub mod hal;
pub mod monitoring;
pub mod packet;
pub mod priority;
pub mod sim;
pub mod streamer;
mod transmit;

pub use channel::{ChannelInfo, Metadata, StreamChannel};
pub use config::{Direction, LinkFormat, SampleFormat, StreamConfig};
pub use error::{HardwareError, Result, StreamError};
pub use fifo::{FifoInfo, PacketFlags, RingFifo, SamplePacket};
pub use streamer::Streamer;

/// Size of one wire packet, which is also the hardware FIFO block size
pub const PACKET_SIZE: usize = 4096;
/// Flags, payload length and counter
pub const HEADER_SIZE: usize = 16;
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;
/// Complex samples in one packet payload with 12 bit compression (all channels)
pub const SAMPLES12_IN_PKT: usize = PAYLOAD_SIZE / 3;
/// Complex samples in one packet payload at 16 bits (all channels)
pub const SAMPLES16_IN_PKT: usize = PAYLOAD_SIZE / 4;
/// Channels per direction on one radio chip
pub const MAX_CHANNELS: usize = 2;

/// The sample type stored in the ring buffers and carried on the wire
pub type Complex16 = Complex<i16>;
/// Normalized floating point samples handed to the application
pub type Complex32 = Complex<f32>;

/// Lock a mutex, carrying on with the inner value if a holder panicked.
/// Streaming state stays usable after a panicking application thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
