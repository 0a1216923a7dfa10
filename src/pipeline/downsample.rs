//! Energy accumulation and downsampling into the trace file.
//!
//! Each calibrated sample contributes `i * v / 2` joules-per-sample-tick of
//! energy, accumulated in double precision. Every `D = 2_000_000 / rate`
//! samples the accumulator is emitted as one single-precision float. GPI0
//! rides along in the annotation bits; its falling edges become timestamps
//! relative to the trace start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ProbeError;
use crate::packet::MAX_SAMPLE_RATE;

use super::processor::SampleSink;
use super::ring::PageWriter;

/// Check the divisibility rule for a requested output rate.
pub fn validate_sample_rate(rate: u32) -> Result<u32, ProbeError> {
    if rate == 0 || rate > MAX_SAMPLE_RATE || MAX_SAMPLE_RATE % rate != 0 {
        return Err(ProbeError::Config(format!(
            "sample rate must divide {MAX_SAMPLE_RATE}, got {rate}"
        )));
    }
    Ok(MAX_SAMPLE_RATE / rate)
}

/// Counters reported to the shell when a trace stops.
#[derive(Debug, Clone, Default)]
pub struct TraceStats {
    pub sample_rate: u32,
    pub total_samples: u64,
    pub total_nan: u64,
    pub total_inf: u64,
    pub dropped_packets: u64,
    pub timestamps: Vec<f32>,
}

impl TraceStats {
    /// Fraction of emitted energy samples that were NaN, in percent.
    pub fn nan_percent(&self) -> f64 {
        if self.total_samples == 0 {
            return 0.0;
        }
        self.total_nan as f64 * 100.0 / self.total_samples as f64
    }
}

pub struct EnergyAccumulator {
    acc: f64,
    accumulated: u32,
    downsample: u32,
    sample_rate: u32,
    total_samples: u64,
    total_nan: u64,
    total_inf: u64,
    last_gpi0: bool,
    observe_timestamps: Arc<AtomicBool>,
    timestamps: Vec<f32>,
    writer: PageWriter,
    fatal: Option<ProbeError>,
}

impl EnergyAccumulator {
    pub fn new(
        sample_rate: u32,
        writer: PageWriter,
        observe_timestamps: Arc<AtomicBool>,
    ) -> Result<Self, ProbeError> {
        let downsample = validate_sample_rate(sample_rate)?;
        Ok(Self {
            acc: 0.0,
            accumulated: 0,
            downsample,
            sample_rate,
            total_samples: 0,
            total_nan: 0,
            total_inf: 0,
            last_gpi0: true,
            observe_timestamps,
            timestamps: Vec::new(),
            writer,
            fatal: None,
        })
    }

    /// First fatal pipeline error, if any. Sticky.
    pub fn fatal(&self) -> Option<&ProbeError> {
        self.fatal.as_ref()
    }

    /// Handle to the write ring, for driving the writer loop.
    pub fn ring_shared(&self) -> Arc<super::ring::RingShared> {
        self.writer.shared()
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            sample_rate: self.sample_rate,
            total_samples: self.total_samples,
            total_nan: self.total_nan,
            total_inf: self.total_inf,
            dropped_packets: 0,
            timestamps: self.timestamps.clone(),
        }
    }

    /// Tear down into the page writer (for the close-time flush) and the
    /// error that stopped the pipeline, if any.
    pub fn finish(self) -> (PageWriter, Option<ProbeError>, TraceStats) {
        let stats = self.stats();
        (self.writer, self.fatal, stats)
    }

    fn gpi0_check(&mut self, current: bool) {
        if self.last_gpi0 && !current && self.observe_timestamps.load(Ordering::Relaxed) {
            let timestamp = self.total_samples as f32 / self.sample_rate as f32;
            self.timestamps.push(timestamp);
            // Lap marks are part of the line protocol and go to stdout.
            println!("m-lap-us-{}", (timestamp * 1e6) as u64);
        }
        self.last_gpi0 = current;
    }

    fn heartbeat(&self) {
        if self.total_samples % u64::from(self.sample_rate) == 0 {
            log::debug!(
                "trace at {} samples, nan={} inf={}",
                self.total_samples,
                self.total_nan,
                self.total_inf
            );
        }
    }
}

impl SampleSink for EnergyAccumulator {
    fn emit(&mut self, cal_i: f32, cal_v: f32, bits: u8) {
        let energy = f64::from(cal_i) * f64::from(cal_v) / 2.0;
        let energy_f32 = energy as f32;
        if energy_f32.is_nan() {
            self.total_nan += 1;
        }
        if energy_f32.is_infinite() {
            self.total_inf += 1;
        }
        self.acc += energy;
        self.accumulated += 1;
        if self.accumulated == self.downsample {
            self.total_samples += 1;
            if self.fatal.is_none() {
                if let Err(err) = self.writer.push(self.acc as f32) {
                    log::error!("trace writer failed: {err}");
                    self.fatal = Some(err);
                }
            }
            self.accumulated = 0;
            self.acc = 0.0;
            self.heartbeat();
        }
        self.gpi0_check((bits >> 4) & 1 == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ring::writer_loop;

    fn accumulator(rate: u32) -> (EnergyAccumulator, std::path::PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.bin");
        let writer = PageWriter::create(&path, rate).unwrap();
        let acc =
            EnergyAccumulator::new(rate, writer, Arc::new(AtomicBool::new(false))).unwrap();
        (acc, path, dir)
    }

    fn close_and_read(acc: EnergyAccumulator, path: &std::path::Path) -> Vec<f32> {
        let (writer, fatal, _) = acc.finish();
        assert!(fatal.is_none());
        let shared = writer.shared();
        shared.request_stop();
        writer_loop(&shared);
        writer.close().unwrap();
        let bytes = std::fs::read(path).unwrap();
        bytes[5..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn rate_divisibility_rule() {
        assert_eq!(validate_sample_rate(1000).unwrap(), 2000);
        assert_eq!(validate_sample_rate(1).unwrap(), 2_000_000);
        assert_eq!(validate_sample_rate(2_000_000).unwrap(), 1);
        assert!(validate_sample_rate(0).is_err());
        assert!(validate_sample_rate(3).is_err());
        assert!(validate_sample_rate(4_000_000).is_err());
    }

    #[test]
    fn unit_rate_sums_the_whole_capture() {
        // R = 1 folds everything into one float per 2M samples.
        let (mut acc, path, _dir) = accumulator(1);
        for _ in 0..MAX_SAMPLE_RATE {
            acc.emit(2.0, 1.0, 0);
        }
        let floats = close_and_read(acc, &path);
        assert_eq!(floats.len(), 1);
        assert_eq!(floats[0], 2_000_000.0);
    }

    #[test]
    fn exact_ratio_emits_bucket_sums() {
        // R = 1000 -> D = 2000; buckets sum i*v/2 over 2000 samples.
        let (mut acc, path, _dir) = accumulator(1000);
        for _ in 0..6000 {
            acc.emit(1.0, 1.0, 0);
        }
        let floats = close_and_read(acc, &path);
        assert_eq!(floats.len(), 3);
        assert!(floats.iter().all(|&v| v == 1000.0));
    }

    #[test]
    fn native_rate_passes_samples_through() {
        let (mut acc, path, _dir) = accumulator(MAX_SAMPLE_RATE);
        acc.emit(3.0, 2.0, 0);
        acc.emit(f32::NAN, 1.0, 0);
        assert_eq!(acc.stats().total_nan, 1);
        let floats = close_and_read(acc, &path);
        assert_eq!(floats[0], 3.0);
        assert!(floats[1].is_nan());
    }

    #[test]
    fn gpi0_falling_edge_records_a_timestamp() {
        let (mut acc, _path, _dir) = accumulator(MAX_SAMPLE_RATE);
        acc.observe_timestamps.store(true, Ordering::Relaxed);
        acc.emit(1.0, 1.0, 0x10); // GPI0 high
        acc.emit(1.0, 1.0, 0x00); // falling edge
        acc.emit(1.0, 1.0, 0x00);
        let stats = acc.stats();
        assert_eq!(stats.timestamps.len(), 1);
        // The edge lands after the second emitted sample.
        assert_eq!(stats.timestamps[0], 2.0 / MAX_SAMPLE_RATE as f32);
    }

    #[test]
    fn timer_disabled_records_nothing() {
        let (mut acc, _path, _dir) = accumulator(MAX_SAMPLE_RATE);
        acc.emit(1.0, 1.0, 0x10);
        acc.emit(1.0, 1.0, 0x00);
        assert!(acc.stats().timestamps.is_empty());
    }
}
