//! Bounded ingress buffer for raw samples with packet-gap synthesis.
//!
//! Endpoint payloads arrive as runs of 512-byte stream packets carrying a
//! monotonically increasing 16-bit index. A jump in the index means packets
//! were lost to USB latency; rather than shrink the timescale, the gap is
//! filled with whole packets of the missing-sample sentinel so the sample
//! clock stays honest downstream.

use crate::error::ProbeError;
use crate::packet::{split_sample, StreamPacket, MISSING_SAMPLE, SAMPLES_PER_PACKET};

/// Capacity in raw samples. Overflow means the processor is not being
/// drained fast enough, which is a wiring bug, not a runtime condition.
pub const MAX_RAW_SAMPLES: usize = 4 * 1024 * 1024;

pub struct IngressRing {
    raw: Vec<u32>,
    last_index: Option<u16>,
    dropped_packets: u64,
    repeated_packets: u64,
}

impl Default for IngressRing {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressRing {
    pub fn new() -> Self {
        Self {
            raw: Vec::with_capacity(SAMPLES_PER_PACKET * 1024),
            last_index: None,
            dropped_packets: 0,
            repeated_packets: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Packets lost on the wire so far (gap widths summed).
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    pub fn repeated_packets(&self) -> u64 {
        self.repeated_packets
    }

    /// Split an endpoint payload into packets and append their samples,
    /// synthesizing sentinel packets across index gaps.
    pub fn add(&mut self, bytes: &[u8]) -> Result<(), ProbeError> {
        if bytes.len() % StreamPacket::LEN != 0 {
            log::warn!(
                "bulk payload of {} bytes is not a whole number of packets",
                bytes.len()
            );
        }
        for chunk in bytes.chunks_exact(StreamPacket::LEN) {
            self.add_packet(&StreamPacket::new(chunk))?;
        }
        Ok(())
    }

    fn add_packet(&mut self, packet: &StreamPacket) -> Result<(), ProbeError> {
        let index = packet.packet_index();
        if let Some(last) = self.last_index {
            // Wrapping arithmetic makes 0xFFFF -> 0x0000 a delta of 1.
            let delta = index.wrapping_sub(last);
            if delta == 0 {
                self.repeated_packets += 1;
                log::warn!("repeated stream packet index {index}");
            } else if delta > 1 {
                let gap = u64::from(delta) - 1;
                self.dropped_packets += gap;
                log::warn!("stream gap of {gap} packets before index {index}");
                for _ in 0..gap {
                    for _ in 0..SAMPLES_PER_PACKET {
                        self.push_raw(MISSING_SAMPLE)?;
                    }
                }
            }
        }
        self.last_index = Some(index);
        for sample in packet.samples() {
            self.push_raw(sample)?;
        }
        Ok(())
    }

    fn push_raw(&mut self, value: u32) -> Result<(), ProbeError> {
        if self.raw.len() >= MAX_RAW_SAMPLES {
            return Err(ProbeError::Invariant(
                "raw sample buffer overflow; processor was not drained".into(),
            ));
        }
        self.raw.push(value);
        Ok(())
    }

    /// Hand every buffered raw sample to `f` in order, then reset.
    pub fn drain(&mut self, mut f: impl FnMut(u16, u16)) {
        for &raw in &self.raw {
            let (raw_i, raw_v) = split_sample(raw);
            f(raw_i, raw_v);
        }
        self.raw.clear();
    }
}
