//! The receive worker loop
//!
//! Every transfer slot always has a read in flight. The loop waits on the
//! oldest one, splits what came back into wire packets, checks the counters
//! for gaps and pushes one packet per active channel into its ring. The slot
//! is then resubmitted with the same buffer.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    config::Direction,
    fifo::{PacketFlags, SamplePacket},
    hal::{DataPort, TransferHandle},
    monitoring::RateMeter,
    packet::{split_packet, unpack_payload},
    streamer::{LoopParams, Shared},
    MAX_CHANNELS, PACKET_SIZE,
};

/// Longest wait for one transfer before the rate is reset and the wait retried
pub(crate) const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);

/// What a wire counter says about the stream since the previous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gap {
    None,
    /// Whole packets missing before this one
    Lost(u64),
    /// The counter went backwards
    Regressed { from: u64, to: u64 },
}

#[derive(Debug)]
struct GapDetector {
    samples_per_packet: u64,
    previous: u64,
}

impl GapDetector {
    fn new(samples_per_packet: usize) -> Self {
        Self {
            samples_per_packet: samples_per_packet as u64,
            previous: 0,
        }
    }

    fn advance(&mut self, counter: u64) -> Gap {
        let previous = std::mem::replace(&mut self.previous, counter);
        if counter == previous {
            return Gap::None;
        }
        if counter < previous {
            return Gap::Regressed {
                from: previous,
                to: counter,
            };
        }
        let delta = counter - previous;
        if delta == self.samples_per_packet {
            return Gap::None;
        }
        match (delta / self.samples_per_packet).saturating_sub(1) {
            0 => Gap::None,
            lost => Gap::Lost(lost),
        }
    }
}

enum Slot {
    Reading(TransferHandle),
    /// No free transfer slot last time, submit again on the next pass
    Idle(Vec<u8>),
}

fn submit(port: &dyn DataPort, endpoint: u8, buffer: Vec<u8>) -> Slot {
    match port.begin_receive(endpoint, buffer) {
        Ok(handle) => Slot::Reading(handle),
        Err(exhausted) => {
            trace!("no free read slot");
            Slot::Idle(exhausted.buffer)
        }
    }
}

pub(crate) fn receive_packets(shared: &Shared, params: LoopParams, terminate: &AtomicBool) {
    let port = &*shared.port;
    let samples_per_packet = params.samples_per_packet();
    let transfer_len = params.batch * PACKET_SIZE;
    let mut lanes = [
        SamplePacket::new(samples_per_packet),
        SamplePacket::new(samples_per_packet),
    ];
    let mut gaps = GapDetector::new(samples_per_packet);
    let mut meter = RateMeter::new(Direction::Rx);
    // Loss markers arrive in runs, only log one per run
    let mut marker_holdoff = 0;

    let mut slots: Vec<Slot> = (0..params.slots)
        .map(|_| submit(port, params.endpoint, vec![0; transfer_len]))
        .collect();
    let mut index = 0;

    while !terminate.load(Ordering::Relaxed) {
        let buffer = match std::mem::replace(&mut slots[index], Slot::Idle(Vec::new())) {
            Slot::Reading(handle) => {
                if !port.wait(handle, TRANSFER_TIMEOUT) {
                    slots[index] = Slot::Reading(handle);
                    meter.stalled(&shared.stats);
                    continue;
                }
                match port.finish(handle) {
                    Some(done) => {
                        meter.add(done.transferred);
                        let data = &done.buffer[..done.transferred.min(done.buffer.len())];
                        for packet in data.chunks_exact(PACKET_SIZE) {
                            let (header, payload) = split_packet(packet);
                            if header.packet_loss() {
                                if marker_holdoff > 0 {
                                    marker_holdoff -= 1;
                                } else {
                                    debug!("Board reported lost packets");
                                    marker_holdoff = 2 * params.slots;
                                }
                                for channel in shared.tx.iter().filter(|c| c.is_streaming()) {
                                    channel.add_lost_packets(1);
                                }
                            }
                            match gaps.advance(header.counter) {
                                Gap::None => {}
                                Gap::Lost(lost) => {
                                    for channel in shared.rx.iter().filter(|c| c.is_streaming()) {
                                        channel.add_lost_packets(lost);
                                    }
                                }
                                Gap::Regressed { from, to } => {
                                    warn!(from, to, "RX timestamp went backwards");
                                }
                            }
                            shared.stats.set_last_timestamp(Direction::Rx, header.counter);
                            deliver(shared, &params, payload, header.counter, &mut lanes);
                        }
                        done.buffer
                    }
                    None => vec![0; transfer_len],
                }
            }
            Slot::Idle(buffer) => {
                thread::yield_now();
                buffer
            }
        };

        slots[index] = submit(port, params.endpoint, buffer);
        index = (index + 1) % slots.len();
        meter.tick(&shared.stats);
    }

    port.abort_receives(params.endpoint);
    meter.stop(&shared.stats);
}

/// Unpack one payload and hand each active channel its lane
fn deliver(
    shared: &Shared,
    params: &LoopParams,
    payload: &[u8],
    counter: u64,
    lanes: &mut [SamplePacket; MAX_CHANNELS],
) {
    let [lane_a, lane_b] = &mut *lanes;
    let count = if params.stream_size == MAX_CHANNELS {
        unpack_payload(
            payload,
            params.link,
            &mut lane_a.samples[..],
            Some(&mut lane_b.samples[..]),
        )
    } else {
        unpack_payload(payload, params.link, &mut lane_a.samples[..], None)
    };
    for (index, channel) in shared.rx.iter().enumerate() {
        if !channel.is_streaming() {
            continue;
        }
        let lane = &mut lanes[params.lane(index)];
        lane.timestamp = counter;
        lane.count = count;
        lane.flags = PacketFlags::NONE;
        // A full ring counts the overflow, the packet is dropped
        channel.fifo().push_packet(lane, Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_packets_lose_nothing() {
        let mut gaps = GapDetector::new(1360);
        assert_eq!(gaps.advance(0), Gap::None);
        assert_eq!(gaps.advance(1360), Gap::None);
        assert_eq!(gaps.advance(2720), Gap::None);
    }

    #[test]
    fn gap_of_k_packets_loses_k_minus_one() {
        let mut gaps = GapDetector::new(1360);
        gaps.advance(0);
        assert_eq!(gaps.advance(2 * 1360), Gap::Lost(1));
        assert_eq!(gaps.advance(2 * 1360 + 5 * 1360), Gap::Lost(4));
    }

    #[test]
    fn short_steps_are_not_loss() {
        let mut gaps = GapDetector::new(1360);
        for ts in [0, 136, 272, 408] {
            assert_eq!(gaps.advance(ts), Gap::None);
        }
    }

    #[test]
    fn backwards_counter_is_a_regression() {
        let mut gaps = GapDetector::new(510);
        gaps.advance(10_000);
        assert_eq!(
            gaps.advance(0),
            Gap::Regressed {
                from: 10_000,
                to: 0
            }
        );
        assert_eq!(gaps.advance(510), Gap::None);
    }
}
