//! Wire packet layout and payload codecs
//!
//! Every transfer to or from the board is a whole number of 4096 byte packets:
//!
//! ```text
//! [0]      flags (bit 3: packet lost by hardware, bit 4: ignore timestamp)
//! [1..3]   payload length, little endian
//! [3..8]   reserved
//! [8..16]  counter, the timestamp of the first sample, little endian
//! [16..]   payload
//! ```
//!
//! The payload holds interleaved I/Q for one or two channels. With two
//! channels samples alternate A, B, A, B. 12 bit samples take three bytes,
//! 16 bit samples four.

use byteorder::{ByteOrder, LittleEndian};

use crate::{config::LinkFormat, Complex16, HEADER_SIZE, PACKET_SIZE, PAYLOAD_SIZE};

const FLAGS_OFFSET: usize = 0;
const PAYLOAD_LEN_OFFSET: usize = 1;
const COUNTER_OFFSET: usize = 8;

/// Set by the board when it had to drop data
pub const FLAG_PACKET_LOSS: u8 = 1 << 3;
/// Tells the board to transmit as soon as possible instead of at `counter`
pub const FLAG_IGNORE_TIMESTAMP: u8 = 1 << 4;

const _: () = assert!(HEADER_SIZE + PAYLOAD_SIZE == PACKET_SIZE);
const _: () = assert!(COUNTER_OFFSET + 8 == HEADER_SIZE);
// Both encodings divide evenly between two channels
const _: () = assert!(PAYLOAD_SIZE % 6 == 0 && PAYLOAD_SIZE % 8 == 0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    pub payload_len: u16,
    pub counter: u64,
}

impl PacketHeader {
    pub fn decode(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= HEADER_SIZE, "Packet header is 16 bytes");
        Self {
            flags: bytes[FLAGS_OFFSET],
            payload_len: LittleEndian::read_u16(&bytes[PAYLOAD_LEN_OFFSET..]),
            counter: LittleEndian::read_u64(&bytes[COUNTER_OFFSET..]),
        }
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= HEADER_SIZE, "Packet header is 16 bytes");
        bytes[..HEADER_SIZE].fill(0);
        bytes[FLAGS_OFFSET] = self.flags;
        LittleEndian::write_u16(&mut bytes[PAYLOAD_LEN_OFFSET..], self.payload_len);
        LittleEndian::write_u64(&mut bytes[COUNTER_OFFSET..], self.counter);
    }

    pub fn packet_loss(&self) -> bool {
        self.flags & FLAG_PACKET_LOSS != 0
    }

    pub fn ignore_timestamp(&self) -> bool {
        self.flags & FLAG_IGNORE_TIMESTAMP != 0
    }
}

/// Split a packet into its header and payload
pub fn split_packet(packet: &[u8]) -> (PacketHeader, &[u8]) {
    let header = PacketHeader::decode(packet);
    (header, &packet[HEADER_SIZE..PACKET_SIZE.min(packet.len())])
}

/// Samples per channel carried by one full packet
pub fn samples_per_channel(link: LinkFormat, channels: usize) -> usize {
    link.samples_per_packet() / channels.max(1)
}

fn bytes_per_sample(link: LinkFormat) -> usize {
    match link {
        LinkFormat::Int12 => 3,
        LinkFormat::Int16 => 4,
    }
}

fn unpack12(bytes: &[u8]) -> Complex16 {
    // Shift the 12 bit values to the top of an i16 and back to sign extend
    let i = ((u16::from(bytes[0]) | u16::from(bytes[1]) << 8) << 4) as i16 >> 4;
    let q = (u16::from(bytes[1]) | u16::from(bytes[2]) << 8) as i16 >> 4;
    Complex16::new(i, q)
}

fn pack12(sample: Complex16, bytes: &mut [u8]) {
    bytes[0] = sample.re as u8;
    bytes[1] = ((sample.re >> 8) & 0x0F) as u8 | ((sample.im << 4) as u8 & 0xF0);
    bytes[2] = (sample.im >> 4) as u8;
}

fn unpack16(bytes: &[u8]) -> Complex16 {
    Complex16::new(
        LittleEndian::read_i16(&bytes[0..2]),
        LittleEndian::read_i16(&bytes[2..4]),
    )
}

fn pack16(sample: Complex16, bytes: &mut [u8]) {
    LittleEndian::write_i16(&mut bytes[0..2], sample.re);
    LittleEndian::write_i16(&mut bytes[2..4], sample.im);
}

/// Unpack a payload into one or two channel buffers, returning the number of
/// samples written per channel
pub fn unpack_payload(
    payload: &[u8],
    link: LinkFormat,
    chan_a: &mut [Complex16],
    mut chan_b: Option<&mut [Complex16]>,
) -> usize {
    let channels = if chan_b.is_some() { 2 } else { 1 };
    let step = bytes_per_sample(link);
    let mut count = payload.len() / (step * channels);
    count = count.min(chan_a.len());
    if let Some(b) = chan_b.as_deref() {
        count = count.min(b.len());
    }
    let unpack = match link {
        LinkFormat::Int12 => unpack12,
        LinkFormat::Int16 => unpack16,
    };
    for (i, frame) in payload
        .chunks_exact(step * channels)
        .take(count)
        .enumerate()
    {
        chan_a[i] = unpack(&frame[..step]);
        if let Some(b) = chan_b.as_deref_mut() {
            b[i] = unpack(&frame[step..]);
        }
    }
    count
}

/// Pack one or two channels of `count` samples into `out`, returning the
/// number of payload bytes written
pub fn pack_payload(
    chan_a: &[Complex16],
    chan_b: Option<&[Complex16]>,
    link: LinkFormat,
    out: &mut [u8],
) -> usize {
    let channels = if chan_b.is_some() { 2 } else { 1 };
    let step = bytes_per_sample(link);
    let mut count = chan_a.len().min(out.len() / (step * channels));
    if let Some(b) = chan_b {
        count = count.min(b.len());
    }
    let pack = match link {
        LinkFormat::Int12 => pack12,
        LinkFormat::Int16 => pack16,
    };
    for (i, frame) in out.chunks_exact_mut(step * channels).take(count).enumerate() {
        pack(chan_a[i], &mut frame[..step]);
        if let Some(b) = chan_b {
            pack(b[i], &mut frame[step..]);
        }
    }
    count * step * channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SAMPLES12_IN_PKT, SAMPLES16_IN_PKT};
    use num_traits::Zero;

    #[test]
    fn header_fields_land_at_their_offsets() {
        let header = PacketHeader {
            flags: FLAG_PACKET_LOSS | FLAG_IGNORE_TIMESTAMP,
            payload_len: 4080,
            counter: 0x0102_0304_0506_0708,
        };
        let mut bytes = [0xAAu8; HEADER_SIZE];
        header.encode(&mut bytes);
        assert_eq!(bytes[0], 0x18);
        assert_eq!(&bytes[1..3], &[0xF0, 0x0F]);
        assert_eq!(&bytes[3..8], &[0; 5]);
        assert_eq!(bytes[8], 0x08);
        assert_eq!(bytes[15], 0x01);
        let decoded = PacketHeader::decode(&bytes);
        assert_eq!(decoded, header);
        assert!(decoded.packet_loss());
        assert!(decoded.ignore_timestamp());
    }

    #[test]
    fn packed_samples_sign_extend() {
        let samples = [
            Complex16::new(2047, -2048),
            Complex16::new(-1, 1),
            Complex16::new(0, -2047),
        ];
        let mut bytes = [0u8; 9];
        assert_eq!(pack_payload(&samples, None, LinkFormat::Int12, &mut bytes), 9);
        // I = 0x7FF, Q = 0x800
        assert_eq!(&bytes[..3], &[0xFF, 0x07, 0x80]);

        let mut out = [Complex16::zero(); 3];
        assert_eq!(unpack_payload(&bytes, LinkFormat::Int12, &mut out, None), 3);
        assert_eq!(out, samples);
    }

    #[test]
    fn mimo_payload_interleaves_channels() {
        let a = [Complex16::new(1, 2), Complex16::new(3, 4)];
        let b = [Complex16::new(-5, -6), Complex16::new(-7, -8)];
        let mut bytes = [0u8; 16];
        assert_eq!(pack_payload(&a, Some(&b), LinkFormat::Int16, &mut bytes), 16);
        assert_eq!(LittleEndian::read_i16(&bytes[4..6]), -5);
        assert_eq!(LittleEndian::read_i16(&bytes[8..10]), 3);

        let mut out_a = [Complex16::zero(); 2];
        let mut out_b = [Complex16::zero(); 2];
        let n = unpack_payload(&bytes, LinkFormat::Int16, &mut out_a, Some(&mut out_b));
        assert_eq!(n, 2);
        assert_eq!(out_a, a);
        assert_eq!(out_b, b);
    }

    #[test]
    fn full_payload_sample_counts() {
        let payload = [0u8; PAYLOAD_SIZE];
        let mut a = vec![Complex16::zero(); SAMPLES12_IN_PKT];
        let mut b = vec![Complex16::zero(); SAMPLES12_IN_PKT];
        assert_eq!(
            unpack_payload(&payload, LinkFormat::Int12, &mut a, None),
            SAMPLES12_IN_PKT
        );
        assert_eq!(
            unpack_payload(&payload, LinkFormat::Int12, &mut a, Some(&mut b)),
            SAMPLES12_IN_PKT / 2
        );
        assert_eq!(
            unpack_payload(&payload, LinkFormat::Int16, &mut a, None),
            SAMPLES16_IN_PKT
        );
        assert_eq!(samples_per_channel(LinkFormat::Int16, 2), 510);
    }
}
