//! Error types for stream control.
//!
//! Only the control path (setting up, starting and stopping streams) returns
//! errors. The worker loops never do: I/O trouble there degrades into
//! counters and log messages so a hardware hiccup cannot end a stream.

use crate::config::{Direction, LinkFormat};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The requested channel slot already carries a stream
    #[error("{direction} channel {channel} is already in use")]
    ChannelInUse { direction: Direction, channel: usize },

    /// Streaming is running with a different wire format
    #[error("stream is already running with {active} link format, requested {requested}")]
    IncompatibleLinkFormat {
        requested: LinkFormat,
        active: LinkFormat,
    },

    /// The channel has not been set up or was closed
    #[error("stream channel is not configured")]
    NotConfigured,

    /// The owning streamer no longer exists
    #[error("streamer has been dropped")]
    StreamerDropped,

    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// A worker thread could not be created
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failures reported by the register and transport capabilities
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("register 0x{addr:04x} access failed: {reason}")]
    Register { addr: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout waiting for hardware")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, StreamError>;
