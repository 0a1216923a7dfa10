//! Trace supervision: the session thread, the writer thread and the
//! shutdown protocol between them.
//!
//! While a trace runs, the session thread owns the device (it loops
//! `process` under the session mutex) and the writer thread owns the file
//! tail. The shell only flips shared flags until it stops the trace, at
//! which point both threads are joined, the device stream is torn down and
//! the pipeline is disassembled for its final flush and counters.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::error::ProbeError;
use crate::packet::BULK_IN_LENGTH;
use crate::pipeline::downsample::{EnergyAccumulator, TraceStats};
use crate::pipeline::processor::RawProcessor;
use crate::pipeline::ring::{writer_loop, PageWriter, RingShared};
use crate::pipeline::TracePipeline;
use crate::probe::Js110;

/// Deadline for either worker thread to exit after its flag clears.
/// Missing it means the loop wedged, which is a protocol bug, not a
/// recoverable condition.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Session-thread tick timeout.
const PROCESS_TICK: Duration = Duration::from_secs(1);

/// Everything `stop` can report: final counters, the output files, and the
/// pipeline's first fatal error if it died mid-trace.
pub struct TraceOutcome {
    pub stats: TraceStats,
    pub fatal: Option<ProbeError>,
    pub energy_path: PathBuf,
    pub timestamps_path: PathBuf,
}

pub struct TraceSession {
    spinning: Arc<AtomicBool>,
    session_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    pipeline: Arc<Mutex<Option<TracePipeline>>>,
    ring: Arc<RingShared>,
    energy_path: PathBuf,
    timestamps_path: PathBuf,
}

impl TraceSession {
    /// Wire the pipeline, start streaming and launch both worker threads.
    pub fn start(
        probe: &mut Js110,
        settings: &Settings,
        sample_rate: u32,
        dir: &Path,
        prefix: &str,
        observe_timestamps: Arc<AtomicBool>,
    ) -> Result<Self, ProbeError> {
        std::fs::create_dir_all(dir)?;
        let energy_path = dir.join(format!("{prefix}-energy.bin"));
        let timestamps_path = dir.join(format!("{prefix}-timestamps.json"));

        let writer = PageWriter::create(&energy_path, sample_rate)?;
        let ring = writer.shared();

        let mut processor = RawProcessor::new(settings.suppress_mode()?);
        processor.set_calibration(probe.calibration().clone());
        processor.set_suppress_options(
            settings.suppress_samples_pre,
            settings.suppress_samples_post,
            settings.suppress_window,
        );
        let energy = EnergyAccumulator::new(sample_rate, writer, observe_timestamps)?;
        let pipeline = Arc::new(Mutex::new(Some(TracePipeline::new(processor, energy))));

        probe.power_on(true)?;
        let sink_pipeline = pipeline.clone();
        let notify_pipeline = pipeline.clone();
        probe.start_streaming(
            settings.transfers,
            settings.transfer_packets * BULK_IN_LENGTH,
            Box::new(move |bytes: &[u8]| {
                match sink_pipeline.lock().expect("pipeline poisoned").as_mut() {
                    Some(pipeline) => pipeline.accept(bytes),
                    None => Ok(std::ops::ControlFlow::Break(())),
                }
            }),
            Box::new(move || {
                match notify_pipeline.lock().expect("pipeline poisoned").as_mut() {
                    Some(pipeline) => pipeline.drain(),
                    None => Ok(std::ops::ControlFlow::Break(())),
                }
            }),
            Box::new(|code: crate::usb::DeviceEvent, msg: &str| {
                log::info!("stream endpoint stopped: {code}: {msg}");
            }),
        )?;

        let spinning = Arc::new(AtomicBool::new(true));
        let session = probe.session();
        let session_thread = {
            let spinning = spinning.clone();
            thread::spawn(move || {
                while spinning.load(Ordering::Acquire) {
                    session.lock().expect("device session poisoned").process(PROCESS_TICK);
                }
            })
        };
        let writer_thread = {
            let ring = ring.clone();
            thread::spawn(move || writer_loop(&ring))
        };

        Ok(Self {
            spinning,
            session_thread: Some(session_thread),
            writer_thread: Some(writer_thread),
            pipeline,
            ring,
            energy_path,
            timestamps_path,
        })
    }

    /// True once the pipeline has recorded a fatal error mid-trace.
    pub fn failed(&self) -> bool {
        self.pipeline
            .lock()
            .expect("pipeline poisoned")
            .as_ref()
            .is_some_and(TracePipeline::failed)
    }

    /// Stop both loops, tear down the stream and finalize the files.
    pub fn stop(mut self, probe: &mut Js110) -> Result<TraceOutcome, ProbeError> {
        self.spinning.store(false, Ordering::Release);
        if let Some(handle) = self.session_thread.take() {
            join_deadline(handle, "trace")?;
        }

        // The session thread is parked; control transfers are safe again.
        let stream_error = probe.stop_streaming().err();

        let pipeline = self
            .pipeline
            .lock()
            .expect("pipeline poisoned")
            .take()
            .ok_or_else(|| ProbeError::Invariant("trace pipeline already taken".into()))?;
        let (writer, mut fatal, stats) = pipeline.finish();

        self.ring.request_stop();
        if let Some(handle) = self.writer_thread.take() {
            join_deadline(handle, "writer")?;
        }
        writer.close()?;
        write_timestamps(&self.timestamps_path, &stats.timestamps)?;

        if fatal.is_none() {
            if let Some(err) = stream_error {
                fatal = Some(err);
            }
        }
        Ok(TraceOutcome {
            stats,
            fatal,
            energy_path: self.energy_path,
            timestamps_path: self.timestamps_path,
        })
    }
}

fn join_deadline(handle: JoinHandle<()>, what: &str) -> Result<(), ProbeError> {
    let deadline = Instant::now() + JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(ProbeError::Invariant(format!(
                "{what} thread failed to exit"
            )));
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle
        .join()
        .map_err(|_| ProbeError::Invariant(format!("{what} thread panicked")))
}

/// The timestamps file is a JSON array of seconds, one value per line,
/// bracketed, and written even when no timestamps were captured.
fn write_timestamps(path: &Path, timestamps: &[f32]) -> Result<(), ProbeError> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "[")?;
    for (n, timestamp) in timestamps.iter().enumerate() {
        if n + 1 < timestamps.len() {
            writeln!(file, "\t{timestamp},")?;
        } else {
            writeln!(file, "\t{timestamp}")?;
        }
    }
    writeln!(file, "]")?;
    file.flush()?;
    Ok(())
}
