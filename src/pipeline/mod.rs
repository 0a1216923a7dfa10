//! The raw-sample pipeline: ingress, calibration, downsampling, disk.
//!
//! Stages are owned top-down by [`TracePipeline`]; no stage owns its
//! downstream. The session thread drives the whole chain: the endpoint's
//! data sink appends bytes to the ingress buffer, and the endpoint's notify
//! tick drains ingress through the processor into the energy accumulator,
//! which queues full pages for the writer thread.

pub mod downsample;
pub mod ingress;
pub mod processor;
pub mod ring;

use std::ops::ControlFlow;

use anyhow::Result;

use downsample::{EnergyAccumulator, TraceStats};
use ingress::IngressRing;
use processor::RawProcessor;
use ring::PageWriter;

use crate::error::ProbeError;

pub struct TracePipeline {
    ingress: IngressRing,
    processor: RawProcessor,
    energy: EnergyAccumulator,
}

impl TracePipeline {
    pub fn new(processor: RawProcessor, energy: EnergyAccumulator) -> Self {
        Self {
            ingress: IngressRing::new(),
            processor,
            energy,
        }
    }

    /// Endpoint data sink: buffer the payload, keep streaming unless the
    /// ingress buffer overflowed.
    pub fn accept(&mut self, bytes: &[u8]) -> Result<ControlFlow<()>> {
        self.ingress.add(bytes)?;
        Ok(ControlFlow::Continue(()))
    }

    /// Endpoint notify tick: run every buffered sample through the
    /// processor into the accumulator. A fatal writer error stops the
    /// stream in an orderly way; the cause stays readable via [`Self::finish`].
    pub fn drain(&mut self) -> Result<ControlFlow<()>> {
        let Self {
            ingress,
            processor,
            energy,
        } = self;
        ingress.drain(|raw_i, raw_v| processor.process(raw_i, raw_v, energy));
        if self.energy.fatal().is_some() {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    }

    pub fn dropped_packets(&self) -> u64 {
        self.ingress.dropped_packets()
    }

    /// True once the accumulator has recorded a fatal writer error.
    pub fn failed(&self) -> bool {
        self.energy.fatal().is_some()
    }

    /// Handle to the write ring, for driving the writer loop.
    pub fn ring_shared(&self) -> std::sync::Arc<ring::RingShared> {
        self.energy.ring_shared()
    }

    pub fn stats(&self) -> TraceStats {
        let mut stats = self.energy.stats();
        stats.dropped_packets = self.ingress.dropped_packets();
        stats
    }

    /// Disassemble into the page writer, the first fatal error and the
    /// final counters.
    pub fn finish(self) -> (PageWriter, Option<ProbeError>, TraceStats) {
        let dropped = self.ingress.dropped_packets();
        let (writer, fatal, mut stats) = self.energy.finish();
        stats.dropped_packets = dropped;
        (writer, fatal, stats)
    }
}
