//! Hardware capabilities the streaming engine is written against.
//!
//! The engine never talks to USB, SPI or the board gateware directly. It
//! drives three traits instead:
//!
//! * [`DataPort`], the bulk transfer endpoints carrying wire packets
//! * [`RadioChip`], the LMS7002M transceiver's SPI register space
//! * [`Fpga`], the board gateware registers controlling the sample interface
//!
//! Transfers hand buffer ownership to the port and get it back on
//! [`DataPort::finish`], so the same allocation cycles through a slot for the
//! whole life of a worker loop.

use std::{collections::BTreeMap, time::Duration};

use crate::{config::Direction, error::HardwareError};

/// Identifies an in-flight transfer on a [`DataPort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub usize);

/// A finished transfer and the buffer it used
#[derive(Debug)]
pub struct Completed {
    pub buffer: Vec<u8>,
    pub transferred: usize,
}

/// Every transfer slot is busy. The buffer is handed back untouched.
#[derive(Debug, thiserror::Error)]
#[error("no free transfer slot")]
pub struct SlotsExhausted {
    pub buffer: Vec<u8>,
}

pub trait DataPort: Send + Sync {
    /// Number of transfers that may be in flight per direction, a power of two
    fn slot_count(&self) -> usize;

    /// Packets per transfer the port can actually handle for a request
    fn negotiate_batch_size(&self, requested: usize) -> usize {
        requested.max(1)
    }

    /// Queue a read filling `buffer`
    fn begin_receive(&self, endpoint: u8, buffer: Vec<u8>) -> Result<TransferHandle, SlotsExhausted>;

    /// Queue a write of the first `length` bytes of `buffer`
    fn begin_send(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        length: usize,
    ) -> Result<TransferHandle, SlotsExhausted>;

    /// Wait for a transfer to complete. False when still pending at `timeout`.
    fn wait(&self, handle: TransferHandle, timeout: Duration) -> bool;

    /// Reclaim a completed transfer. `None` for unknown or aborted handles.
    fn finish(&self, handle: TransferHandle) -> Option<Completed>;

    /// Cancel every read in flight on `endpoint`, discarding their data
    fn abort_receives(&self, endpoint: u8);

    /// Cancel every write in flight on `endpoint`
    fn abort_sends(&self, endpoint: u8);

    /// Flush data buffered in the transport
    fn reset_stream_buffers(&self) -> Result<(), HardwareError>;

    /// Read exactly `length` bytes in one transfer
    fn receive_blocking(&self, endpoint: u8, length: usize, timeout: Duration) -> Option<Vec<u8>> {
        let handle = self.begin_receive(endpoint, vec![0; length]).ok()?;
        if !self.wait(handle, timeout) {
            self.abort_receives(endpoint);
            return None;
        }
        let done = self.finish(handle)?;
        if done.transferred != length {
            return None;
        }
        Some(done.buffer)
    }
}

/// A bit range inside one chip register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterField {
    pub addr: u16,
    pub msb: u8,
    pub lsb: u8,
}

impl RegisterField {
    pub const fn new(addr: u16, msb: u8, lsb: u8) -> Self {
        Self { addr, msb, lsb }
    }

    pub fn mask(&self) -> u16 {
        let width = u32::from(self.msb - self.lsb + 1);
        (((1u32 << width) - 1) << self.lsb) as u16
    }
}

/// LMS7002M register fields the engine reads or toggles
pub mod fields {
    use super::RegisterField;

    pub const LML1_SISODDR: RegisterField = RegisterField::new(0x0023, 12, 12);
    pub const LML1_TRXIQPULSE: RegisterField = RegisterField::new(0x0023, 14, 14);
    pub const PD_FDIV_O_CGEN: RegisterField = RegisterField::new(0x0086, 14, 14);
    pub const SEL_PATH_RFE: RegisterField = RegisterField::new(0x010D, 8, 7);
    /// RX decimation
    pub const HBD_OVR_RXTSP: RegisterField = RegisterField::new(0x0403, 14, 12);
}

/// Register 0x0020 selects which channel(s) SPI writes address
pub const MAC_REGISTER: u16 = 0x0020;
pub const MAC_CHANNEL_A: u16 = 0xFFFD;
pub const MAC_CHANNEL_B: u16 = 0xFFFE;
pub const MAC_BOTH: u16 = 0xFFFF;

/// Chip blocks that can be returned to power-on defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipModule {
    /// RX front end
    Rfe,
    /// RX baseband
    Rbb,
    /// TX baseband
    Tbb,
    /// TX front end
    Trf,
}

/// A snapshot of the chip's register space, both channels
pub type RegisterMap = BTreeMap<(u16, u16), u16>;

pub trait RadioChip: Send + Sync {
    fn spi_read(&self, addr: u16) -> Result<u16, HardwareError>;
    fn spi_write(&self, addr: u16, value: u16) -> Result<(), HardwareError>;

    /// Interface sample rate in Hz
    fn sample_rate(&self, direction: Direction) -> f64;
    fn frequency_sx(&self, direction: Direction) -> f64;
    fn set_frequency_sx(&self, direction: Direction, hz: f64) -> Result<(), HardwareError>;

    fn backup_registers(&self) -> Result<RegisterMap, HardwareError>;
    fn restore_registers(&self, map: &RegisterMap) -> Result<(), HardwareError>;
    fn set_defaults(&self, module: ChipModule) -> Result<(), HardwareError>;
    /// Load the DC test signal for the RX (`tx == false`) or TX side
    fn load_dc_reg_iq(&self, tx: bool, i: u16, q: u16) -> Result<(), HardwareError>;
    /// Pulse the digital logic resets after a reconfiguration
    fn reset_logic_registers(&self) -> Result<(), HardwareError>;

    fn spi_write_all(&self, writes: &[(u16, u16)]) -> Result<(), HardwareError> {
        for &(addr, value) in writes {
            self.spi_write(addr, value)?;
        }
        Ok(())
    }

    fn field(&self, field: RegisterField) -> Result<u16, HardwareError> {
        Ok((self.spi_read(field.addr)? & field.mask()) >> field.lsb)
    }

    fn modify_field(&self, field: RegisterField, value: u16) -> Result<(), HardwareError> {
        let current = self.spi_read(field.addr)?;
        let updated = (current & !field.mask()) | ((value << field.lsb) & field.mask());
        self.spi_write(field.addr, updated)
    }
}

/// Board gateware registers
pub mod fpga_regs {
    pub const CHANNEL_ENABLE: u16 = 0x0007;
    pub const MODE: u16 = 0x0008;
    pub const INTERFACE_CTRL: u16 = 0x0009;
    pub const STREAM_CTRL: u16 = 0x000A;
    pub const WFM_CTRL: u16 = 0x000D;
    /// Selects the radio chip subsequent writes apply to
    pub const CHIP_SELECT: u16 = 0xFFFF;

    pub const MODE_MIMO: u16 = 0x0100;
    pub const MODE_SISO_DDR: u16 = 0x0040;
    pub const MODE_TRXIQ_PULSE: u16 = 0x0180;
    /// Mode register sample width bits for 12 bit samples
    pub const SAMPLE_WIDTH_12: u16 = 2;
    /// Interface control bits pulsed to latch a new configuration
    pub const CONFIG_LATCH: u16 = 5 << 1;
}

pub trait Fpga: Send + Sync {
    fn read_register(&self, addr: u16) -> Result<u16, HardwareError>;
    fn write_registers(&self, writes: &[(u16, u16)]) -> Result<(), HardwareError>;

    fn write_register(&self, addr: u16, value: u16) -> Result<(), HardwareError> {
        self.write_registers(&[(addr, value)])
    }

    fn select_chip(&self, chip_id: u8) -> Result<(), HardwareError> {
        self.write_register(fpga_regs::CHIP_SELECT, 1 << chip_id)
    }

    fn start_streaming(&self) -> Result<(), HardwareError> {
        let ctrl = self.read_register(fpga_regs::STREAM_CTRL)?;
        self.write_register(fpga_regs::STREAM_CTRL, ctrl | 1)
    }

    fn stop_streaming(&self) -> Result<(), HardwareError> {
        let ctrl = self.read_register(fpga_regs::STREAM_CTRL)?;
        self.write_register(fpga_regs::STREAM_CTRL, ctrl & !1)
    }

    fn reset_timestamp(&self) -> Result<(), HardwareError> {
        let ctrl = self.read_register(fpga_regs::INTERFACE_CTRL)?;
        self.write_registers(&[
            (fpga_regs::INTERFACE_CTRL, ctrl | 1),
            (fpga_regs::INTERFACE_CTRL, ctrl & !1),
        ])
    }
}
