//! The transmit worker loop
//!
//! Slots are used round robin. For each slot the loop waits for its previous
//! transfer, fills the buffer with up to a batch of wire packets popped from
//! the TX rings and submits it. Channels that are set up but not started
//! contribute silence so the lanes of a two channel stream stay aligned.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use num_traits::Zero;
use tracing::trace;

use crate::{
    capture::TRANSFER_TIMEOUT,
    channel::StreamChannel,
    config::Direction,
    fifo::{PacketFlags, SamplePacket},
    hal::TransferHandle,
    monitoring::RateMeter,
    packet::{pack_payload, PacketHeader, FLAG_IGNORE_TIMESTAMP},
    streamer::{LoopParams, Shared},
    Complex16, HEADER_SIZE, MAX_CHANNELS, PACKET_SIZE, PAYLOAD_SIZE,
};

/// How long to wait on an application ring for the next packet
const POP_TIMEOUT: Duration = Duration::from_millis(100);

enum Slot {
    Free(Vec<u8>),
    Sending(TransferHandle),
    /// Assembled but refused by the port, sent again on the next pass
    Unsent {
        buffer: Vec<u8>,
        length: usize,
        last_timestamp: u64,
    },
}

/// Payload bytes for a burst's final, short packet. The board reads whole
/// 48 byte (packed) or 16 byte words.
fn short_payload_len(samples: usize, samples_per_packet: usize, packed: bool) -> usize {
    let quantum = if packed { 48 } else { 16 };
    let share = (samples * PAYLOAD_SIZE / samples_per_packet).max(1);
    (1 + (share - 1) / quantum) * quantum
}

/// Fill `buffer` with up to `params.batch` wire packets. Returns the bytes to
/// send and the counter of the last packet, `None` when no channel had data.
fn assemble(
    channels: &[Arc<StreamChannel>; MAX_CHANNELS],
    params: &LoopParams,
    lanes: &mut [SamplePacket; MAX_CHANNELS],
    buffer: &mut [u8],
) -> Option<(usize, u64)> {
    let samples_per_packet = params.samples_per_packet();
    let mut length = 0;
    let mut last_timestamp = None;

    for packet in buffer.chunks_exact_mut(PACKET_SIZE).take(params.batch) {
        let mut lead: Option<(u64, PacketFlags)> = None;
        let mut payload_len = PAYLOAD_SIZE;

        for (index, channel) in channels.iter().enumerate() {
            if !channel.is_used() {
                continue;
            }
            let lane = &mut lanes[params.lane(index)];
            if !channel.is_active() {
                lane.zero_fill();
                continue;
            }
            if !channel.fifo().pop_packet(lane, POP_TIMEOUT) {
                lane.zero_fill();
                continue;
            }
            if lane.count != samples_per_packet {
                if !lane.flags.contains(PacketFlags::END_BURST) {
                    // A short packet without a burst end is dropped
                    lane.zero_fill();
                    continue;
                }
                payload_len = short_payload_len(lane.count, samples_per_packet, params.link.is_packed());
                lane.samples[lane.count..].fill(Complex16::zero());
            }
            lead.get_or_insert((lane.timestamp, lane.flags));
        }

        let Some((timestamp, flags)) = lead else {
            break;
        };
        let (head, body) = packet.split_at_mut(HEADER_SIZE);
        let [lane_a, lane_b] = &*lanes;
        if params.stream_size == MAX_CHANNELS {
            pack_payload(&lane_a.samples, Some(&lane_b.samples[..]), params.link, body);
        } else {
            pack_payload(&lane_a.samples, None, params.link, body);
        }
        let header = PacketHeader {
            flags: if flags.contains(PacketFlags::SYNC_TIMESTAMP) {
                0
            } else {
                FLAG_IGNORE_TIMESTAMP
            },
            payload_len: payload_len as u16,
            counter: timestamp,
        };
        header.encode(head);
        length += HEADER_SIZE + payload_len;
        last_timestamp = Some(timestamp);

        // Nothing may follow a short packet in the same transfer
        if flags.contains(PacketFlags::END_BURST) || payload_len < PAYLOAD_SIZE {
            break;
        }
    }
    last_timestamp.map(|ts| (length, ts))
}

pub(crate) fn transmit_packets(shared: &Shared, params: LoopParams, terminate: &AtomicBool) {
    let port = &*shared.port;
    let samples_per_packet = params.samples_per_packet();
    let transfer_len = params.batch * PACKET_SIZE;
    let mut lanes = [
        SamplePacket::new(samples_per_packet),
        SamplePacket::new(samples_per_packet),
    ];
    let mut meter = RateMeter::new(Direction::Tx);
    let mut slots: Vec<Slot> = (0..params.slots)
        .map(|_| Slot::Free(vec![0; transfer_len]))
        .collect();
    let mut index = 0;

    while !terminate.load(Ordering::Relaxed) {
        let (buffer, length, last_timestamp) =
            match std::mem::replace(&mut slots[index], Slot::Free(Vec::new())) {
                Slot::Sending(handle) => {
                    if !port.wait(handle, TRANSFER_TIMEOUT) {
                        slots[index] = Slot::Sending(handle);
                        meter.stalled(&shared.stats);
                        continue;
                    }
                    let mut buffer = match port.finish(handle) {
                        Some(done) => {
                            meter.add(done.transferred);
                            done.buffer
                        }
                        None => vec![0; transfer_len],
                    };
                    match assemble(&shared.tx, &params, &mut lanes, &mut buffer) {
                        Some((length, last)) => (buffer, length, last),
                        None => {
                            slots[index] = Slot::Free(buffer);
                            meter.tick(&shared.stats);
                            continue;
                        }
                    }
                }
                Slot::Free(mut buffer) => match assemble(&shared.tx, &params, &mut lanes, &mut buffer) {
                    Some((length, last)) => (buffer, length, last),
                    None => {
                        slots[index] = Slot::Free(buffer);
                        meter.tick(&shared.stats);
                        continue;
                    }
                },
                Slot::Unsent {
                    buffer,
                    length,
                    last_timestamp,
                } => (buffer, length, last_timestamp),
            };

        // Stopping mid batch drops what was assembled
        if terminate.load(Ordering::Relaxed) {
            break;
        }

        match port.begin_send(params.endpoint, buffer, length) {
            Ok(handle) => {
                trace!(length, last_timestamp, "transfer submitted");
                shared.stats.set_last_timestamp(
                    Direction::Tx,
                    last_timestamp.wrapping_add(samples_per_packet as u64 - 1),
                );
                slots[index] = Slot::Sending(handle);
                index = (index + 1) % slots.len();
            }
            Err(exhausted) => {
                trace!("no free send slot");
                slots[index] = Slot::Unsent {
                    buffer: exhausted.buffer,
                    length,
                    last_timestamp,
                };
                thread::yield_now();
            }
        }
        meter.tick(&shared.stats);
    }

    port.abort_sends(params.endpoint);
    meter.stop(&shared.stats);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{LinkFormat, StreamConfig},
        fifo::SamplePacket,
    };
    use std::{sync::Weak, time::Duration};

    fn tx_channels() -> [Arc<StreamChannel>; MAX_CHANNELS] {
        let channel = |index| Arc::new(StreamChannel::new(Direction::Tx, index, Weak::new()));
        let channels = [channel(0), channel(1)];
        channels[0].setup(StreamConfig {
            buffer_length: 16384,
            ..StreamConfig::tx(0)
        });
        channels[0].force_active(true);
        channels
    }

    fn queue(channel: &StreamChannel, timestamp: u64, count: usize, flags: PacketFlags) {
        let mut packet = SamplePacket::new(1360);
        for (i, s) in packet.samples.iter_mut().enumerate() {
            *s = Complex16::new(i as i16 % 2000, 1);
        }
        packet.count = count;
        packet.timestamp = timestamp;
        packet.flags = flags;
        assert!(channel.fifo().push_packet(&packet, Duration::ZERO));
    }

    fn params() -> LoopParams {
        LoopParams {
            endpoint: 0,
            link: LinkFormat::Int12,
            stream_size: 1,
            batch: 4,
            slots: 1,
        }
    }

    #[test]
    fn short_packet_without_burst_end_is_dropped() {
        let channels = tx_channels();
        queue(&channels[0], 0, 10, PacketFlags::SYNC_TIMESTAMP);
        let mut lanes = [SamplePacket::new(1360), SamplePacket::new(1360)];
        let mut buffer = vec![0u8; 4 * PACKET_SIZE];
        assert_eq!(assemble(&channels, &params(), &mut lanes, &mut buffer), None);
        assert_eq!(channels[0].fifo().info().items_filled, 0);
    }

    #[test]
    fn burst_end_shortens_the_payload_and_closes_the_transfer() {
        let channels = tx_channels();
        let mut burst_end = PacketFlags::SYNC_TIMESTAMP;
        burst_end.insert(PacketFlags::END_BURST);
        queue(&channels[0], 1360, 1360, PacketFlags::SYNC_TIMESTAMP);
        queue(&channels[0], 2720, 10, burst_end);
        queue(&channels[0], 4080, 1360, PacketFlags::SYNC_TIMESTAMP);

        let mut lanes = [SamplePacket::new(1360), SamplePacket::new(1360)];
        let mut buffer = vec![0u8; 4 * PACKET_SIZE];
        let (length, last) = assemble(&channels, &params(), &mut lanes, &mut buffer).unwrap();
        assert_eq!(length, PACKET_SIZE + HEADER_SIZE + 48);
        assert_eq!(last, 2720);

        let first = PacketHeader::decode(&buffer);
        assert_eq!((first.counter, first.payload_len), (1360, PAYLOAD_SIZE as u16));
        let short = PacketHeader::decode(&buffer[PACKET_SIZE..]);
        assert_eq!(short.counter, 2720);
        assert_eq!(short.payload_len, 48);
        assert_eq!(short.flags, 0);
        // The packet after the burst waits for the next transfer
        assert_eq!(channels[0].fifo().info().items_filled, 1360);
    }

    #[test]
    fn idle_second_channel_is_zero_filled() {
        let channels = tx_channels();
        channels[1].setup(StreamConfig {
            buffer_length: 16384,
            ..StreamConfig::tx(1)
        });
        queue(&channels[0], 0, 680, PacketFlags::NONE);
        let params = LoopParams {
            stream_size: 2,
            batch: 1,
            ..params()
        };
        let mut lanes = [SamplePacket::new(680), SamplePacket::new(680)];
        let mut buffer = vec![0xAAu8; PACKET_SIZE];
        let (length, last) = assemble(&channels, &params, &mut lanes, &mut buffer).unwrap();
        assert_eq!((length, last), (PACKET_SIZE, 0));
        assert_eq!(
            PacketHeader::decode(&buffer).flags,
            FLAG_IGNORE_TIMESTAMP
        );
        assert!(lanes[1].samples.iter().all(|s| *s == Complex16::zero()));
    }

    #[test]
    fn short_payloads_round_up_to_whole_words() {
        // 10 of 1360 packed samples is exactly 30 bytes
        assert_eq!(short_payload_len(10, 1360, true), 48);
        assert_eq!(short_payload_len(16, 1360, true), 48);
        assert_eq!(short_payload_len(17, 1360, true), 96);
        assert_eq!(short_payload_len(4, 1020, false), 16);
        assert_eq!(short_payload_len(5, 1020, false), 32);
        assert_eq!(short_payload_len(1, 1360, true), 48);
    }
}
