//! Phase alignment of the two RX channels.
//!
//! The chip is put into a loop-back configuration with a test tone, one
//! two-channel packet is captured at a time and the phase difference between
//! the channels is measured with a single bin DFT. The TSP and clock divider
//! resets are retried until the measured difference between two tone
//! frequencies matches the expected group delay offset for the current
//! decimation.
//!
//! Alignment is best effort. Failing to converge is logged and the stream
//! starts unaligned.

use std::{f64::consts::PI, time::Duration};

use num_complex::Complex;
use tracing::{debug, info, warn};

use crate::{
    config::{Direction, LinkFormat},
    error::HardwareError,
    hal::{fields, fpga_regs, ChipModule, DataPort, Fpga, RadioChip, MAC_BOTH, MAC_CHANNEL_A, MAC_CHANNEL_B, MAC_REGISTER},
    packet::{samples_per_channel, split_packet, unpack_payload},
    Complex16, PACKET_SIZE,
};

/// Receive synthesizer frequency during RF alignment
pub const ALIGN_FREQUENCY: f64 = 450e6;
/// DFT length, bins are in units of fs / 512
pub const DFT_LEN: usize = 512;

const RF_ATTEMPTS: usize = 200;
const TSP_ATTEMPTS: usize = 100;
const QUADRATURE_ATTEMPTS: usize = 100;
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(50);
/// Largest accepted quadrature phase error in degrees
const QUADRATURE_LIMIT: f64 = 90.0;

/// Expected phase difference between the two tones, in degrees per MHz of
/// sample rate, per decimation setting
const OFFSETS: [f64; 5] = [1.15 / 60.0, 1.1 / 40.0, 0.55 / 20.0, 0.2 / 10.0, 0.18 / 5.0];
const TOLERANCE: [f64; 5] = [0.9, 0.45, 0.25, 0.14, 0.06];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignOutcome {
    Aligned,
    NotConverged,
}

/// Index into the offset and tolerance tables. Settings beyond the table
/// use the first entry.
pub fn decimation_index(decimation: u16) -> usize {
    let index = usize::from(decimation);
    if index < OFFSETS.len() {
        index
    } else {
        0
    }
}

/// Expected phase difference and tolerance in degrees
pub fn expected_offset(decimation: u16, sample_rate: f64) -> (f64, f64) {
    let index = decimation_index(decimation);
    (OFFSETS[index] * sample_rate / 1e6, TOLERANCE[index])
}

fn dft_bin(samples: &[Complex16], bin: usize) -> Complex<f64> {
    samples
        .iter()
        .take(DFT_LEN)
        .enumerate()
        .map(|(n, s)| {
            let angle = -2.0 * PI * (bin * n) as f64 / DFT_LEN as f64;
            Complex::new(f64::from(s.re), f64::from(s.im)) * Complex::from_polar(1.0, angle)
        })
        .sum()
}

/// Phase of channel B minus channel A at `bin`, in degrees within ±180
pub fn phase_difference(chan_a: &[Complex16], chan_b: &[Complex16], bin: usize) -> f64 {
    let phase_a = dft_bin(chan_a, bin).arg().to_degrees();
    let phase_b = dft_bin(chan_b, bin).arg().to_degrees();
    let mut diff = phase_b - phase_a;
    if diff < -180.0 {
        diff += 360.0;
    }
    if diff > 180.0 {
        diff -= 360.0;
    }
    diff
}

/// Runs the alignment procedures against one chip
pub struct Aligner<'a> {
    chip: &'a dyn RadioChip,
    fpga: &'a dyn Fpga,
    port: &'a dyn DataPort,
    chip_id: u8,
}

impl<'a> Aligner<'a> {
    pub fn new(
        chip: &'a dyn RadioChip,
        fpga: &'a dyn Fpga,
        port: &'a dyn DataPort,
        chip_id: u8,
    ) -> Self {
        Self {
            chip,
            fpga,
            port,
            chip_id,
        }
    }

    /// Stream both channels as 16 bit MIMO with streaming stopped
    fn prepare_capture(&self) -> Result<(), HardwareError> {
        self.fpga.select_chip(self.chip_id)?;
        self.fpga.stop_streaming()?;
        self.fpga.write_registers(&[
            (fpga_regs::MODE, fpga_regs::MODE_MIMO),
            (fpga_regs::CHANNEL_ENABLE, 3),
        ])
    }

    /// Grab a single wire packet from a freshly started stream
    fn capture_packet(&self) -> Result<Option<Vec<u8>>, HardwareError> {
        self.port.reset_stream_buffers()?;
        self.fpga.start_streaming()?;
        let packet = self
            .port
            .receive_blocking(self.chip_id, PACKET_SIZE, CAPTURE_TIMEOUT);
        self.fpga.stop_streaming()?;
        self.port.abort_receives(self.chip_id);
        Ok(packet)
    }

    /// Pulse the RX quadrature generator power-down on both channels
    pub fn rst_rx_iq_gen(&self) -> Result<(), HardwareError> {
        let mac = self.chip.spi_read(MAC_REGISTER)?;
        let rfe = self.chip.spi_read(0x010C)?;
        self.chip.spi_write(MAC_REGISTER, MAC_CHANNEL_A)?;
        let sxr = self.chip.spi_read(0x011C)?;
        self.chip.spi_write_all(&[
            (MAC_REGISTER, MAC_CHANNEL_A),
            (0x011C, sxr | 0x10),
            (MAC_REGISTER, MAC_BOTH),
            (0x0124, 0x001F),
            (0x010C, rfe | 0x8),
            (0x010C, rfe),
            (MAC_REGISTER, MAC_CHANNEL_A),
            (0x011C, sxr),
            (MAC_REGISTER, mac),
        ])
    }

    /// Reset the RX TSPs until both channels deliver the same test pattern
    /// word first. Returns whether they did. Both channels' TSP registers and
    /// the MAC selection are put back even when a register access fails.
    pub fn align_rx_tsp(&self) -> Result<bool, HardwareError> {
        const BACKUP: [u16; 2] = [0x0400, 0x040C];
        let mac = self.chip.spi_read(MAC_REGISTER)?;
        let mut saved = [[0u16; 2]; 2];
        for (regs, select) in saved.iter_mut().zip([MAC_CHANNEL_A, MAC_CHANNEL_B]) {
            self.chip.spi_write(MAC_REGISTER, select)?;
            for (value, addr) in regs.iter_mut().zip(BACKUP) {
                *value = self.chip.spi_read(addr)?;
            }
        }

        let searched = self.search_tsp();
        self.chip.spi_write_all(&[
            (MAC_REGISTER, MAC_CHANNEL_A),
            (BACKUP[0], saved[0][0]),
            (BACKUP[1], saved[0][1]),
            (MAC_REGISTER, MAC_CHANNEL_B),
            (BACKUP[0], saved[1][0]),
            (BACKUP[1], saved[1][1]),
            (MAC_REGISTER, mac),
        ])?;
        searched
    }

    fn search_tsp(&self) -> Result<bool, HardwareError> {
        self.chip.spi_write_all(&[
            (MAC_REGISTER, MAC_BOTH),
            (0x0400, 0x8085),
            (0x040C, 0x01FF),
        ])?;
        self.prepare_capture()?;

        for _ in 0..TSP_ATTEMPTS {
            // 0x55FE holds both TSPs in reset
            self.chip
                .spi_write_all(&[(MAC_REGISTER, 0x55FE), (MAC_REGISTER, MAC_CHANNEL_A)])?;
            let Some(packet) = self.capture_packet()? else {
                warn!("Channel alignment failed, no data from the board");
                return Ok(false);
            };
            let (_, payload) = split_packet(&packet);
            if payload[..4] == payload[4..8] {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Capture one packet and measure the channel phase difference at `bin`.
    /// `None` when nothing could be captured.
    pub fn phase_offset(&self, bin: usize) -> Result<Option<f64>, HardwareError> {
        let Some(packet) = self.capture_packet()? else {
            warn!("Channel alignment failed, no data from the board");
            return Ok(None);
        };
        let per_channel = samples_per_channel(LinkFormat::Int16, 2);
        let mut chan_a = vec![Complex16::default(); per_channel];
        let mut chan_b = vec![Complex16::default(); per_channel];
        let (_, payload) = split_packet(&packet);
        unpack_payload(payload, LinkFormat::Int16, &mut chan_a, Some(&mut chan_b));
        Ok(Some(phase_difference(&chan_a, &chan_b, bin)))
    }

    /// Align the RX channels against a loop-back tone. A failing register
    /// access ends the search as [`AlignOutcome::NotConverged`]; the register
    /// map (with `restore`) and the MAC selection are put back either way.
    pub fn align_rx_rf(&self, restore: bool) -> Result<AlignOutcome, HardwareError> {
        let mac = self.chip.spi_read(MAC_REGISTER)?;
        let backup = self.chip.backup_registers()?;
        let searched = self.search_rf();
        let restored = if restore {
            self.chip.restore_registers(&backup)
        } else {
            Ok(())
        };

        let outcome = match searched {
            Ok(AlignOutcome::Aligned) => {
                info!("RX channels aligned");
                self.align_quadrature(restore).unwrap_or_else(|e| {
                    warn!("Quadrature alignment aborted: {}", e);
                    AlignOutcome::NotConverged
                })
            }
            Ok(AlignOutcome::NotConverged) => {
                warn!("Channel alignment failed");
                AlignOutcome::NotConverged
            }
            Err(e) => {
                warn!("Channel alignment aborted: {}", e);
                AlignOutcome::NotConverged
            }
        };
        let mac_restored = self.chip.spi_write(MAC_REGISTER, mac);
        restored.and(mac_restored)?;
        Ok(outcome)
    }

    fn search_rf(&self) -> Result<AlignOutcome, HardwareError> {
        self.chip.spi_write(MAC_REGISTER, MAC_BOTH)?;
        for module in [ChipModule::Rfe, ChipModule::Rbb, ChipModule::Tbb, ChipModule::Trf] {
            self.chip.set_defaults(module)?;
        }
        self.chip.spi_write_all(&[
            (0x010C, 0x88C5),
            (0x010D, 0x0117),
            (0x0113, 0x024A),
            (0x0118, 0x418C),
            (0x0100, 0x4039),
            (0x0101, 0x7801),
            (0x0103, 0x0612),
            (0x0108, 0x318C),
            (0x0082, 0x8001),
            (0x0200, 0x008D),
            (0x0208, 0x01FB),
            (0x0400, 0x8081),
            (0x040C, 0x01FF),
            (0x0404, 0x0006),
        ])?;
        self.chip.load_dc_reg_iq(true, 0x3FFF, 0x3FFF)?;
        let sample_rate = self.chip.sample_rate(Direction::Rx);
        self.chip.set_frequency_sx(Direction::Rx, ALIGN_FREQUENCY)?;
        let decimation = self.chip.field(fields::HBD_OVR_RXTSP)?;
        let (offset, tolerance) = expected_offset(decimation, sample_rate);

        self.prepare_capture()?;
        for attempt in 0..RF_ATTEMPTS {
            self.chip.modify_field(fields::PD_FDIV_O_CGEN, 1)?;
            self.chip.modify_field(fields::PD_FDIV_O_CGEN, 0)?;
            self.align_rx_tsp()?;

            self.chip
                .set_frequency_sx(Direction::Tx, ALIGN_FREQUENCY + sample_rate / 16.0)?;
            let Some(first) = self.phase_offset(32)? else {
                break;
            };
            self.chip
                .set_frequency_sx(Direction::Tx, ALIGN_FREQUENCY + sample_rate / 8.0)?;
            let Some(second) = self.phase_offset(64)? else {
                break;
            };
            let diff = first - second;
            debug!(attempt, diff, offset, "RF alignment attempt");
            if (diff - offset).abs() < tolerance {
                return Ok(AlignOutcome::Aligned);
            }
        }
        Ok(AlignOutcome::NotConverged)
    }

    /// Bring the channels' I/Q phase within 90 degrees of each other. Like
    /// [`Aligner::align_rx_rf`], register failures end the search unaligned.
    pub fn align_quadrature(&self, restore: bool) -> Result<AlignOutcome, HardwareError> {
        let mac = self.chip.spi_read(MAC_REGISTER)?;
        let backup = self.chip.backup_registers()?;
        let searched = self.search_quadrature();
        let restored = if restore {
            self.chip.restore_registers(&backup)
        } else {
            Ok(())
        };

        let outcome = match searched {
            Ok(AlignOutcome::Aligned) => AlignOutcome::Aligned,
            Ok(AlignOutcome::NotConverged) => {
                warn!("Channel alignment failed");
                AlignOutcome::NotConverged
            }
            Err(e) => {
                warn!("Quadrature alignment aborted: {}", e);
                AlignOutcome::NotConverged
            }
        };
        let mac_restored = self.chip.spi_write(MAC_REGISTER, mac);
        restored.and(mac_restored)?;
        Ok(outcome)
    }

    fn search_quadrature(&self) -> Result<AlignOutcome, HardwareError> {
        self.chip.spi_write(MAC_REGISTER, MAC_BOTH)?;
        for module in [ChipModule::Rbb, ChipModule::Tbb, ChipModule::Trf] {
            self.chip.set_defaults(module)?;
        }
        self.chip.spi_write_all(&[
            (0x0113, 0x0046),
            (0x0118, 0x418C),
            (0x0100, 0x4039),
            (0x0101, 0x7801),
            (0x0108, 0x318C),
            (0x0082, 0x8001),
            (0x0200, 0x008D),
            (0x0208, 0x01FB),
            (0x0400, 0x8081),
            (0x040C, 0x01FF),
            (0x0404, 0x0006),
        ])?;
        self.chip.load_dc_reg_iq(true, 0x3FFF, 0x3FFF)?;
        self.chip.spi_write_all(&[
            (MAC_REGISTER, MAC_CHANNEL_B),
            (0x0105, 0x0006),
            (0x0100, 0x4038),
            (0x0113, 0x007F),
            (0x0119, 0x529B),
        ])?;
        self.select_rfe_path()?;
        // Channel A's LNA setting follows the path chosen on channel B
        let lna_path = self.chip.field(fields::SEL_PATH_RFE)?;
        self.chip.spi_write(MAC_REGISTER, MAC_CHANNEL_A)?;
        self.chip
            .spi_write(0x0103, if lna_path == 2 { 0x0612 } else { 0x0A12 })?;
        self.select_rfe_path()?;
        self.chip.spi_write(0x0119, 0x5293)?;

        let sample_rate = self.chip.sample_rate(Direction::Rx);
        let frequency = self.chip.frequency_sx(Direction::Rx);
        self.prepare_capture()?;
        self.chip
            .set_frequency_sx(Direction::Tx, frequency + sample_rate / 16.0)?;

        for _ in 0..QUADRATURE_ATTEMPTS {
            let Some(offset) = self.phase_offset(32)? else {
                break;
            };
            if offset.abs() <= QUADRATURE_LIMIT {
                return Ok(AlignOutcome::Aligned);
            }
            self.rst_rx_iq_gen()?;
        }
        Ok(AlignOutcome::NotConverged)
    }

    /// Route the loop-back through the LNA path currently selected
    fn select_rfe_path(&self) -> Result<(), HardwareError> {
        let path = self.chip.field(fields::SEL_PATH_RFE)?;
        let rfe = match path {
            3 => 0x018F,
            2 => 0x0117,
            _ => 0x008F,
        };
        self.chip.spi_write(0x010D, rfe)?;
        self.chip
            .spi_write(0x010C, if path == 2 { 0x88C5 } else { 0x88A5 })
    }
}
