//! In-memory stand-ins for the board, used by the tests and the loopback demo.
//!
//! [`SimulatedPort`] completes reads from wire packets injected with
//! [`SimulatedPort::inject`] and records every sent transfer. The chip and FPGA
//! simulations are plain register files that count writes.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Condvar, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use crate::{
    config::{Direction, LinkFormat},
    error::HardwareError,
    hal::{
        fpga_regs, ChipModule, Completed, DataPort, Fpga, RadioChip, RegisterMap, SlotsExhausted,
        TransferHandle, MAC_BOTH, MAC_REGISTER,
    },
    lock,
    packet::{pack_payload, PacketHeader},
    Complex16, HEADER_SIZE, PACKET_SIZE,
};

/// Build one wire packet. Channel B makes it a two channel packet.
pub fn wire_packet(
    counter: u64,
    flags: u8,
    link: LinkFormat,
    chan_a: &[Complex16],
    chan_b: Option<&[Complex16]>,
) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    let written = pack_payload(chan_a, chan_b, link, &mut packet[HEADER_SIZE..]);
    PacketHeader {
        flags,
        payload_len: written as u16,
        counter,
    }
    .encode(&mut packet);
    packet
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Receive,
    Send,
}

struct Transfer {
    endpoint: u8,
    kind: Kind,
    /// Out while a receive is being filled
    buffer: Option<Vec<u8>>,
    length: usize,
    transferred: usize,
    done: bool,
}

#[derive(Default)]
struct PortState {
    next_handle: usize,
    transfers: HashMap<usize, Transfer>,
}

pub struct SimulatedPort {
    slots: usize,
    state: Mutex<PortState>,
    send_done: Condvar,
    stall_sends: AtomicBool,
    refuse_sends: AtomicBool,
    resets: AtomicUsize,
    feed_tx: Sender<Vec<u8>>,
    feed_rx: Receiver<Vec<u8>>,
    sent_tx: Sender<Vec<u8>>,
    sent_rx: Receiver<Vec<u8>>,
}

impl SimulatedPort {
    pub fn new(slots: usize) -> Self {
        let (feed_tx, feed_rx) = unbounded();
        let (sent_tx, sent_rx) = unbounded();
        Self {
            slots: slots.max(1).next_power_of_two(),
            state: Mutex::new(PortState::default()),
            send_done: Condvar::new(),
            stall_sends: AtomicBool::new(false),
            refuse_sends: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            feed_tx,
            feed_rx,
            sent_tx,
            sent_rx,
        }
    }

    /// Queue one wire packet for the receive side
    pub fn inject(&self, packet: Vec<u8>) {
        assert_eq!(packet.len(), PACKET_SIZE, "Inject whole wire packets");
        let _ = self.feed_tx.send(packet);
    }

    /// Injected packets not yet picked up by a read
    pub fn pending_rx(&self) -> usize {
        self.feed_rx.len()
    }

    /// Drain everything sent so far, split into wire packets
    pub fn take_sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent_rx
            .try_iter()
            .flat_map(|transfer| {
                transfer
                    .chunks(PACKET_SIZE)
                    .map(<[u8]>::to_vec)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Wait up to `timeout` for the next sent transfer, one or more packets
    pub fn next_transfer(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.sent_rx.recv_timeout(timeout).ok()
    }

    /// Hold sends in flight until unstalled, as a wedged endpoint would
    pub fn stall_sends(&self, stall: bool) {
        self.stall_sends.store(stall, Ordering::Relaxed);
        if stall {
            return;
        }
        let mut state = lock(&self.state);
        for transfer in state.transfers.values_mut() {
            if transfer.kind == Kind::Send && !transfer.done {
                self.complete_send(transfer);
            }
        }
        self.send_done.notify_all();
    }

    /// Turn every send away as if all slots were busy
    pub fn refuse_sends(&self, refuse: bool) {
        self.refuse_sends.store(refuse, Ordering::Relaxed);
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).transfers.len()
    }

    fn complete_send(&self, transfer: &mut Transfer) {
        if let Some(buffer) = transfer.buffer.as_ref() {
            let _ = self.sent_tx.send(buffer[..transfer.length].to_vec());
        }
        transfer.transferred = transfer.length;
        transfer.done = true;
    }

    fn begin(
        &self,
        endpoint: u8,
        kind: Kind,
        buffer: Vec<u8>,
        length: usize,
    ) -> Result<TransferHandle, SlotsExhausted> {
        let mut state = lock(&self.state);
        let busy = state
            .transfers
            .values()
            .filter(|t| t.endpoint == endpoint && t.kind == kind)
            .count();
        let refused = kind == Kind::Send && self.refuse_sends.load(Ordering::Relaxed);
        if busy >= self.slots || refused {
            return Err(SlotsExhausted { buffer });
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        let mut transfer = Transfer {
            endpoint,
            kind,
            buffer: Some(buffer),
            length,
            transferred: 0,
            done: false,
        };
        if kind == Kind::Send && !self.stall_sends.load(Ordering::Relaxed) {
            self.complete_send(&mut transfer);
        }
        state.transfers.insert(handle, transfer);
        Ok(TransferHandle(handle))
    }

    /// Fill a receive buffer from the feed, waiting up to `timeout` for the
    /// first packet
    fn fill(&self, buffer: &mut [u8], timeout: Duration) -> Option<usize> {
        let first = match self.feed_rx.recv_timeout(timeout) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };
        let mut filled = 0;
        let mut next = Some(first);
        while let Some(packet) = next.take() {
            let n = packet.len().min(buffer.len() - filled);
            buffer[filled..filled + n].copy_from_slice(&packet[..n]);
            filled += n;
            if buffer.len() - filled >= PACKET_SIZE {
                next = self.feed_rx.try_recv().ok();
            }
        }
        Some(filled)
    }

    fn abort(&self, endpoint: u8, kind: Kind) {
        let mut state = lock(&self.state);
        state
            .transfers
            .retain(|_, t| !(t.endpoint == endpoint && t.kind == kind));
        self.send_done.notify_all();
    }
}

impl DataPort for SimulatedPort {
    fn slot_count(&self) -> usize {
        self.slots
    }

    fn begin_receive(&self, endpoint: u8, buffer: Vec<u8>) -> Result<TransferHandle, SlotsExhausted> {
        let length = buffer.len();
        self.begin(endpoint, Kind::Receive, buffer, length)
    }

    fn begin_send(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        length: usize,
    ) -> Result<TransferHandle, SlotsExhausted> {
        let length = length.min(buffer.len());
        self.begin(endpoint, Kind::Send, buffer, length)
    }

    fn wait(&self, handle: TransferHandle, timeout: Duration) -> bool {
        let mut state = lock(&self.state);
        let Some(transfer) = state.transfers.get_mut(&handle.0) else {
            return true;
        };
        if transfer.done {
            return true;
        }
        if transfer.kind == Kind::Receive {
            let Some(mut buffer) = transfer.buffer.take() else {
                return false;
            };
            drop(state);
            let filled = self.fill(&mut buffer, timeout);
            let mut state = lock(&self.state);
            let Some(transfer) = state.transfers.get_mut(&handle.0) else {
                return false;
            };
            transfer.buffer = Some(buffer);
            return match filled {
                Some(bytes) => {
                    trace!(bytes, "simulated read complete");
                    transfer.transferred = bytes;
                    transfer.done = true;
                    true
                }
                None => false,
            };
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .send_done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            match state.transfers.get(&handle.0) {
                Some(transfer) if !transfer.done => continue,
                _ => return true,
            }
        }
    }

    fn finish(&self, handle: TransferHandle) -> Option<Completed> {
        let transfer = lock(&self.state).transfers.remove(&handle.0)?;
        Some(Completed {
            buffer: transfer.buffer?,
            transferred: transfer.transferred,
        })
    }

    fn abort_receives(&self, endpoint: u8) {
        self.abort(endpoint, Kind::Receive);
    }

    fn abort_sends(&self, endpoint: u8) {
        self.abort(endpoint, Kind::Send);
    }

    fn reset_stream_buffers(&self) -> Result<(), HardwareError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        while self.feed_rx.try_recv().is_ok() {}
        Ok(())
    }
}

/// Register file standing in for the FPGA
#[derive(Default)]
pub struct SimulatedFpga {
    registers: Mutex<BTreeMap<u16, u16>>,
    writes: AtomicUsize,
}

impl SimulatedFpga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: u16) -> u16 {
        lock(&self.registers).get(&addr).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn is_streaming(&self) -> bool {
        self.register(fpga_regs::STREAM_CTRL) & 1 != 0
    }
}

impl Fpga for SimulatedFpga {
    fn read_register(&self, addr: u16) -> Result<u16, HardwareError> {
        Ok(self.register(addr))
    }

    fn write_registers(&self, writes: &[(u16, u16)]) -> Result<(), HardwareError> {
        let mut registers = lock(&self.registers);
        for &(addr, value) in writes {
            registers.insert(addr, value);
        }
        self.writes.fetch_add(writes.len(), Ordering::Relaxed);
        Ok(())
    }
}

/// Register file standing in for the LMS7002M.
///
/// Registers from 0x0100 up exist once per channel and are addressed through
/// the MAC register, like on the chip.
pub struct SimulatedChip {
    registers: Mutex<RegisterMap>,
    sample_rate: Mutex<[f64; 2]>,
    frequency: Mutex<[f64; 2]>,
    writes: AtomicUsize,
    logic_resets: AtomicUsize,
    fail_tx_tuning: AtomicBool,
}

impl SimulatedChip {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            registers: Mutex::new(RegisterMap::new()),
            sample_rate: Mutex::new([sample_rate; 2]),
            frequency: Mutex::new([0.0; 2]),
            writes: AtomicUsize::new(0),
            logic_resets: AtomicUsize::new(0),
            fail_tx_tuning: AtomicBool::new(false),
        }
    }

    /// Make TX synthesizer tuning time out, as a chip that lost SPI would
    pub fn fail_tx_tuning(&self, fail: bool) {
        self.fail_tx_tuning.store(fail, Ordering::Relaxed);
    }

    pub fn set_sample_rate(&self, direction: Direction, hz: f64) {
        lock(&self.sample_rate)[direction_index(direction)] = hz;
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn logic_resets(&self) -> usize {
        self.logic_resets.load(Ordering::Relaxed)
    }

    /// Channels a register access reaches, 0 for shared registers
    fn targets(registers: &RegisterMap, addr: u16) -> &'static [u16] {
        if addr < 0x0100 {
            return &[0];
        }
        match registers.get(&(0, MAC_REGISTER)).copied().unwrap_or(MAC_BOTH) & 0x3 {
            0x1 => &[1],
            0x2 => &[2],
            _ => &[1, 2],
        }
    }
}

fn direction_index(direction: Direction) -> usize {
    match direction {
        Direction::Rx => 0,
        Direction::Tx => 1,
    }
}

impl RadioChip for SimulatedChip {
    fn spi_read(&self, addr: u16) -> Result<u16, HardwareError> {
        let registers = lock(&self.registers);
        let channel = Self::targets(&registers, addr)[0];
        Ok(registers.get(&(channel, addr)).copied().unwrap_or(0))
    }

    fn spi_write(&self, addr: u16, value: u16) -> Result<(), HardwareError> {
        let mut registers = lock(&self.registers);
        for &channel in Self::targets(&registers, addr) {
            registers.insert((channel, addr), value);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sample_rate(&self, direction: Direction) -> f64 {
        lock(&self.sample_rate)[direction_index(direction)]
    }

    fn frequency_sx(&self, direction: Direction) -> f64 {
        lock(&self.frequency)[direction_index(direction)]
    }

    fn set_frequency_sx(&self, direction: Direction, hz: f64) -> Result<(), HardwareError> {
        if direction == Direction::Tx && self.fail_tx_tuning.load(Ordering::Relaxed) {
            return Err(HardwareError::Timeout);
        }
        lock(&self.frequency)[direction_index(direction)] = hz;
        Ok(())
    }

    fn backup_registers(&self) -> Result<RegisterMap, HardwareError> {
        Ok(lock(&self.registers).clone())
    }

    fn restore_registers(&self, map: &RegisterMap) -> Result<(), HardwareError> {
        *lock(&self.registers) = map.clone();
        Ok(())
    }

    fn set_defaults(&self, module: ChipModule) -> Result<(), HardwareError> {
        let range = match module {
            ChipModule::Rfe => 0x010C..=0x0114,
            ChipModule::Rbb => 0x0115..=0x011B,
            ChipModule::Tbb => 0x0105..=0x010B,
            ChipModule::Trf => 0x0100..=0x0104,
        };
        lock(&self.registers).retain(|(channel, addr), _| *channel == 0 || !range.contains(addr));
        Ok(())
    }

    fn load_dc_reg_iq(&self, tx: bool, i: u16, q: u16) -> Result<(), HardwareError> {
        let base = if tx { 0x020C } else { 0x040B };
        self.spi_write(base, i)?;
        self.spi_write(base, q)
    }

    fn reset_logic_registers(&self) -> Result<(), HardwareError> {
        self.logic_resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
