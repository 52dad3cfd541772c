//! End to end streaming against the simulated board

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use limestream::{
    hal::{RadioChip, MAC_REGISTER},
    packet::{split_packet, unpack_payload, PacketHeader, FLAG_IGNORE_TIMESTAMP, FLAG_PACKET_LOSS},
    sim::{wire_packet, SimulatedChip, SimulatedFpga, SimulatedPort},
    Complex16, Complex32, Direction, LinkFormat, Metadata, PacketFlags, SampleFormat,
    StreamConfig, Streamer, HEADER_SIZE, PACKET_SIZE,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct Board {
    port: Arc<SimulatedPort>,
    fpga: Arc<SimulatedFpga>,
    chip: Arc<SimulatedChip>,
}

fn board() -> (Board, Streamer) {
    let port = Arc::new(SimulatedPort::new(4));
    let fpga = Arc::new(SimulatedFpga::new());
    let chip = Arc::new(SimulatedChip::new(10e6));
    let streamer = Streamer::new(port.clone(), fpga.clone(), chip.clone(), 0);
    (Board { port, fpga, chip }, streamer)
}

fn config(direction: Direction, channel: usize, format: SampleFormat, link: LinkFormat) -> StreamConfig {
    StreamConfig {
        direction,
        channel,
        format,
        link_format: link,
        buffer_length: 16384,
        ..Default::default()
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn silence(n: usize) -> Vec<Complex16> {
    vec![Complex16::new(0, 0); n]
}

#[test]
fn receives_packets_in_order() {
    let (board, streamer) = board();
    let rx = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    rx.start().unwrap();
    assert!(board.fpga.is_streaming());

    for counter in [0, 136, 272, 408] {
        board
            .port
            .inject(wire_packet(counter, 0, LinkFormat::Int12, &silence(1360), None));
    }

    let mut samples = vec![Complex16::new(1, 1); 5440];
    let mut meta = Metadata::default();
    assert_eq!(rx.read(&mut samples, &mut meta, READ_TIMEOUT), 5440);
    assert!(samples.iter().all(|s| *s == Complex16::new(0, 0)));
    assert_eq!(meta.timestamp, 0);

    let info = rx.info();
    assert_eq!(info.dropped_packets, 0);
    assert!(info.active);
    assert_eq!(info.timestamp, 408);
}

#[test]
fn counter_gap_is_reported_as_dropped_packets() {
    let (board, streamer) = board();
    let rx = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    rx.start().unwrap();

    for counter in [0, 2720, 4080, 5440] {
        board
            .port
            .inject(wire_packet(counter, 0, LinkFormat::Int12, &silence(1360), None));
    }

    let mut samples = vec![Complex16::new(0, 0); 5440];
    let mut meta = Metadata::default();
    assert_eq!(rx.read(&mut samples, &mut meta, READ_TIMEOUT), 5440);
    assert_eq!(rx.info().dropped_packets, 1);
    // The count resets once read
    assert_eq!(rx.info().dropped_packets, 0);
}

#[test]
fn backwards_counter_is_not_loss() {
    let (board, streamer) = board();
    let rx = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    rx.start().unwrap();

    for counter in [0, 1360, 0, 1360] {
        board
            .port
            .inject(wire_packet(counter, 0, LinkFormat::Int12, &silence(1360), None));
    }

    let mut samples = vec![Complex16::new(0, 0); 5440];
    let mut meta = Metadata::default();
    assert_eq!(rx.read(&mut samples, &mut meta, READ_TIMEOUT), 5440);
    assert_eq!(rx.info().dropped_packets, 0);
}

#[test]
fn loss_marker_counts_against_transmit_channels() {
    let (board, streamer) = board();
    let rx = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    rx.start().unwrap();
    tx.start().unwrap();
    assert!(streamer.is_running(Direction::Rx));
    assert!(streamer.is_running(Direction::Tx));

    board.port.inject(wire_packet(
        0,
        FLAG_PACKET_LOSS,
        LinkFormat::Int12,
        &silence(1360),
        None,
    ));

    let mut samples = vec![Complex16::new(0, 0); 1360];
    let mut meta = Metadata::default();
    assert_eq!(rx.read(&mut samples, &mut meta, READ_TIMEOUT), 1360);
    assert_eq!(tx.info().dropped_packets, 1);
    assert_eq!(rx.info().dropped_packets, 0);
}

#[test]
fn two_channels_share_each_packet() {
    let (board, streamer) = board();
    let rx_a = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int16))
        .unwrap();
    let rx_b = streamer
        .setup_stream(config(Direction::Rx, 1, SampleFormat::Int16, LinkFormat::Int16))
        .unwrap();
    rx_a.start().unwrap();
    rx_b.start().unwrap();
    assert_eq!(streamer.worker_starts(), 1);
    assert_eq!(streamer.link_format(), LinkFormat::Int16);

    let a: Vec<Complex16> = (0..510).map(|i| Complex16::new(i, 1)).collect();
    let b: Vec<Complex16> = (0..510).map(|i| Complex16::new(-i, 2)).collect();
    board
        .port
        .inject(wire_packet(0, 0, LinkFormat::Int16, &a, Some(&b)));

    let mut got_a = silence(510);
    let mut got_b = silence(510);
    let mut meta = Metadata::default();
    assert_eq!(rx_a.read(&mut got_a, &mut meta, READ_TIMEOUT), 510);
    assert_eq!(rx_b.read(&mut got_b, &mut meta, READ_TIMEOUT), 510);
    assert_eq!(got_a, a);
    assert_eq!(got_b, b);
}

#[test]
fn float_reads_are_normalized() {
    let (board, streamer) = board();
    let rx = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Float32, LinkFormat::Int12))
        .unwrap();
    rx.start().unwrap();

    let tone = vec![Complex16::new(2047, -1024); 1360];
    board
        .port
        .inject(wire_packet(2000, 0, LinkFormat::Int12, &tone, None));

    let mut samples = vec![Complex32::new(0.0, 0.0); 1360];
    let mut meta = Metadata::default();
    assert_eq!(rx.read_f32(&mut samples, &mut meta, READ_TIMEOUT), 1360);
    assert_eq!(meta.timestamp, 2000);
    for s in &samples {
        assert!((s.re - 1.0).abs() < 1e-6);
        assert!((s.im + 0.5).abs() < 1e-3);
    }

    // Integer reads are refused on a float channel
    let mut ints = silence(16);
    assert_eq!(rx.read(&mut ints, &mut meta, Duration::ZERO), 0);
}

#[test]
fn full_ring_counts_overruns() {
    let (board, streamer) = board();
    let mut cfg = config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int12);
    cfg.buffer_length = 100;
    let rx = streamer.setup_stream(cfg).unwrap();
    rx.start().unwrap();

    for i in 0..6 {
        board.port.inject(wire_packet(
            i * 1360,
            0,
            LinkFormat::Int12,
            &silence(1360),
            None,
        ));
    }

    assert!(wait_until(|| rx.info().overrun == 2));
    let info = rx.info();
    assert_eq!(info.fifo_size, 4 * 1360);
    assert_eq!(info.fifo_filled, 4 * 1360);
}

#[test]
fn transmits_timestamped_packets() {
    let (board, streamer) = board();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    tx.start().unwrap();
    assert!(!streamer.is_running(Direction::Rx));

    let ramp: Vec<Complex16> = (0..1360).map(|i| Complex16::new(i * 16, -i * 16)).collect();
    assert_eq!(
        tx.write(&ramp, &Metadata::at(1000), Duration::from_secs(1)),
        1360
    );

    let transfer = board.port.next_transfer(READ_TIMEOUT).unwrap();
    assert_eq!(transfer.len(), 4096);
    let (header, payload) = split_packet(&transfer);
    assert_eq!(header.counter, 1000);
    assert_eq!(header.flags, 0);
    assert_eq!(header.payload_len, 4080);

    let mut samples = silence(1360);
    assert_eq!(unpack_payload(payload, LinkFormat::Int12, &mut samples, None), 1360);
    let expected: Vec<Complex16> = (0..1360).map(|i| Complex16::new(i, -i)).collect();
    assert_eq!(samples, expected);

    assert!(wait_until(|| tx.info().timestamp == 2359));
}

#[test]
fn untimed_writes_ask_the_board_to_ignore_the_counter() {
    let (board, streamer) = board();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int16))
        .unwrap();
    tx.start().unwrap();

    let samples = vec![Complex16::new(100, 100); 1020];
    assert_eq!(
        tx.write(&samples, &Metadata::default(), Duration::from_secs(1)),
        1020
    );

    let transfer = board.port.next_transfer(READ_TIMEOUT).unwrap();
    let (header, payload) = split_packet(&transfer);
    assert_eq!(header.flags & FLAG_IGNORE_TIMESTAMP, FLAG_IGNORE_TIMESTAMP);
    let mut got = silence(1020);
    unpack_payload(payload, LinkFormat::Int16, &mut got, None);
    assert_eq!(got, samples);
}

#[test]
fn failed_alignment_still_streams() {
    let (board, streamer) = board();
    let mut cfg = config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int16);
    cfg.align = true;
    let rx_a = streamer.setup_stream(cfg.clone()).unwrap();
    cfg.channel = 1;
    let rx_b = streamer.setup_stream(cfg).unwrap();

    rx_a.start().unwrap();
    rx_b.start().unwrap();
    assert!(streamer.is_running(Direction::Rx));
    assert!(board.fpga.is_streaming());
    // Logic registers are left alone after an alignment attempt
    assert_eq!(board.chip.logic_resets(), 0);
}

#[test]
fn stopping_every_channel_stops_the_board() {
    let (board, streamer) = board();
    let rx = streamer
        .setup_stream(config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    rx.start().unwrap();
    assert_eq!(board.chip.logic_resets(), 1);

    rx.stop().unwrap();
    assert!(!streamer.is_running(Direction::Rx));
    assert!(!board.fpga.is_streaming());
    assert_eq!(board.port.in_flight(), 0);

    rx.close().unwrap();
    assert!(!rx.is_used());
    assert_eq!(rx.info(), Default::default());
}

#[test]
fn register_failure_during_alignment_still_streams() {
    let (board, streamer) = board();
    board
        .chip
        .spi_write_all(&[(MAC_REGISTER, 0x1234), (0x0113, 0x0ABC)])
        .unwrap();
    board.chip.fail_tx_tuning(true);

    let mut cfg = config(Direction::Rx, 0, SampleFormat::Int16, LinkFormat::Int16);
    cfg.align = true;
    let rx_a = streamer.setup_stream(cfg.clone()).unwrap();
    cfg.channel = 1;
    streamer.setup_stream(cfg).unwrap();

    rx_a.start().unwrap();
    assert!(streamer.is_running(Direction::Rx));
    assert!(board.fpga.is_streaming());
    assert_eq!(board.chip.spi_read(MAC_REGISTER).unwrap(), 0x1234);
    assert_eq!(board.chip.spi_read(0x0113).unwrap(), 0x0ABC);
}

#[test]
fn burst_end_sends_a_short_packet() {
    let (board, streamer) = board();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int12))
        .unwrap();
    tx.start().unwrap();

    let burst: Vec<Complex16> = (0..10).map(|i| Complex16::new(i * 16, 16)).collect();
    let mut meta = Metadata::at(500);
    meta.flags.insert(PacketFlags::END_BURST);
    assert_eq!(tx.write(&burst, &meta, Duration::from_secs(1)), 10);

    let transfer = board.port.next_transfer(READ_TIMEOUT).unwrap();
    // 10 packed samples round up to one 48 byte word group
    assert_eq!(transfer.len(), HEADER_SIZE + 48);
    let (header, payload) = split_packet(&transfer);
    assert_eq!(header.counter, 500);
    assert_eq!(header.payload_len, 48);
    assert_eq!(header.flags, 0);

    let mut samples = silence(16);
    assert_eq!(unpack_payload(payload, LinkFormat::Int12, &mut samples, None), 16);
    for (i, s) in samples.iter().enumerate() {
        let expected = if i < 10 {
            Complex16::new(i as i16, 1)
        } else {
            Complex16::new(0, 0)
        };
        assert_eq!(*s, expected, "sample {i}");
    }
}

#[test]
fn short_write_without_burst_end_is_held_back() {
    let (board, streamer) = board();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int16))
        .unwrap();
    tx.start().unwrap();

    let samples = vec![Complex16::new(5, 5); 1020];
    assert_eq!(tx.write(&samples[..10], &Metadata::at(0), Duration::from_secs(1)), 10);
    assert!(board.port.next_transfer(Duration::from_millis(300)).is_none());

    assert_eq!(
        tx.write(&samples[10..], &Metadata::at(10), Duration::from_secs(1)),
        1010
    );
    let transfer = board.port.next_transfer(READ_TIMEOUT).unwrap();
    assert_eq!(transfer.len(), PACKET_SIZE);
    let (header, _) = split_packet(&transfer);
    assert_eq!(header.counter, 0);
    assert_eq!(header.payload_len, 4080);
}

#[test]
fn refused_send_is_retried_unchanged() {
    let (board, streamer) = board();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int16))
        .unwrap();
    tx.start().unwrap();
    board.port.refuse_sends(true);

    let samples: Vec<Complex16> = (0..1020).map(|i| Complex16::new(i, -i)).collect();
    assert_eq!(
        tx.write(&samples, &Metadata::at(7000), Duration::from_secs(1)),
        1020
    );
    thread::sleep(Duration::from_millis(300));
    assert!(board.port.take_sent_packets().is_empty());

    board.port.refuse_sends(false);
    let transfer = board.port.next_transfer(READ_TIMEOUT).unwrap();
    let (header, payload) = split_packet(&transfer);
    assert_eq!(header.counter, 7000);
    let mut got = silence(1020);
    unpack_payload(payload, LinkFormat::Int16, &mut got, None);
    assert_eq!(got, samples);
    // Sent exactly once
    assert!(board.port.next_transfer(Duration::from_millis(300)).is_none());
    assert!(wait_until(|| tx.info().timestamp == 7000 + 1019));
}

#[test]
fn stalled_sends_reset_the_rate_and_complete_later() {
    let (board, streamer) = board();
    let tx = streamer
        .setup_stream(config(Direction::Tx, 0, SampleFormat::Int16, LinkFormat::Int16))
        .unwrap();
    tx.start().unwrap();

    let samples = vec![Complex16::new(3, -3); 1020];
    let mut timestamp = 0u64;
    let flowing = Instant::now();
    while flowing.elapsed() < Duration::from_millis(1300) {
        tx.write(&samples, &Metadata::at(timestamp), Duration::from_millis(100));
        timestamp += 1020;
        board.port.take_sent_packets();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(wait_until(|| streamer.stats().rate(Direction::Tx) > 0));
    // Let the last packets written go out before stalling
    thread::sleep(Duration::from_millis(300));

    board.port.stall_sends(true);
    board.port.take_sent_packets();
    let base = timestamp;
    for _ in 0..16 {
        assert_eq!(
            tx.write(&samples, &Metadata::at(timestamp), Duration::from_secs(1)),
            1020
        );
        timestamp += 1020;
    }
    assert!(wait_until(|| streamer.stats().rate(Direction::Tx) == 0));

    board.port.stall_sends(false);
    let mut counters = Vec::new();
    while counters.len() < 16 {
        let transfer = board.port.next_transfer(READ_TIMEOUT).unwrap();
        for packet in transfer.chunks(PACKET_SIZE) {
            counters.push(PacketHeader::decode(packet).counter);
        }
    }
    counters.sort_unstable();
    let expected: Vec<u64> = (0..16).map(|k| base + k * 1020).collect();
    assert_eq!(counters, expected);
}
