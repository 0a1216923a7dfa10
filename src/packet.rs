//! Wire format of the probe's streaming bulk-in packets.
//!
//! The device emits a continuous sequence of 512-byte packets on the
//! streaming endpoint. Each packet carries an 8-byte header and 126 packed
//! 32-bit samples. All multi-byte fields are little-endian.

/// Size of one streaming packet and of every bulk-in transfer granule.
pub const BULK_IN_LENGTH: usize = 512;

/// Raw samples carried by one streaming packet.
pub const SAMPLES_PER_PACKET: usize = 126;

/// Raw-sample value synthesized for packets lost on the wire.
pub const MISSING_SAMPLE: u32 = 0xffff_ffff;

/// The probe's native sample rate: two channels at 2 MS/s.
pub const MAX_SAMPLE_RATE: u32 = 2_000_000;

/// Version byte expected in device-bound state packets.
pub const PACKET_VERSION: u8 = 1;

/// Payload kinds for device-bound state packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Settings = 1,
    Status = 2,
    Extio = 3,
    Info = 4,
}

/// Read-only view over one 512-byte streaming packet.
///
/// Header layout: buffer_type (u8), status (u8), length (u16),
/// packet_index (u16), usb_frame_index (u16), then 126 × u32 samples.
#[derive(Debug, Clone, Copy)]
pub struct StreamPacket<'a> {
    bytes: &'a [u8],
}

impl<'a> StreamPacket<'a> {
    pub const LEN: usize = BULK_IN_LENGTH;

    pub fn new(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() == Self::LEN, "stream packet must be 512 bytes");
        Self { bytes }
    }

    pub fn buffer_type(&self) -> u8 {
        self.bytes[0]
    }

    pub fn status(&self) -> u8 {
        self.bytes[1]
    }

    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn packet_index(&self) -> u16 {
        u16::from_le_bytes([self.bytes[4], self.bytes[5]])
    }

    pub fn usb_frame_index(&self) -> u16 {
        u16::from_le_bytes([self.bytes[6], self.bytes[7]])
    }

    pub fn samples(&self) -> impl Iterator<Item = u32> + 'a {
        self.bytes[8..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("chunk length")))
    }
}

/// Split a packed raw sample into its (current, voltage) 16-bit words.
#[inline]
pub fn split_sample(raw: u32) -> (u16, u16) {
    ((raw >> 16) as u16, raw as u16)
}

/// Assemble a 512-byte streaming packet. Used by loopback tooling and tests.
pub fn encode_packet(packet_index: u16, samples: &[u32; SAMPLES_PER_PACKET]) -> [u8; BULK_IN_LENGTH] {
    let mut bytes = [0u8; BULK_IN_LENGTH];
    bytes[2..4].copy_from_slice(&(BULK_IN_LENGTH as u16).to_le_bytes());
    bytes[4..6].copy_from_slice(&packet_index.to_le_bytes());
    for (slot, sample) in bytes[8..].chunks_exact_mut(4).zip(samples.iter()) {
        slot.copy_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_round_trip() {
        let samples = [0x1234_5678u32; SAMPLES_PER_PACKET];
        let bytes = encode_packet(0xBEEF, &samples);
        let packet = StreamPacket::new(&bytes);
        assert_eq!(packet.packet_index(), 0xBEEF);
        assert_eq!(packet.length(), 512);
        assert_eq!(packet.samples().count(), SAMPLES_PER_PACKET);
        assert!(packet.samples().all(|s| s == 0x1234_5678));
    }

    #[test]
    fn sample_split_halves() {
        let (i, v) = split_sample(0xAAAA_5555);
        assert_eq!(i, 0xAAAA);
        assert_eq!(v, 0x5555);
        assert_eq!(split_sample(MISSING_SAMPLE), (0xffff, 0xffff));
    }
}
