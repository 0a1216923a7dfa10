//! Transport seams between the transfer engine and the platform USB stack.
//!
//! The engine never talks to the USB stack directly; it drives these traits.
//! The production implementation lives in [`super::host`]; tests drive the
//! engine with the scripted transport in `super::mock`.

use std::time::Duration;

use crate::error::ProbeError;

use super::SetupPacket;

/// Outcome of handing a transfer to the platform.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The transfer is in flight; a completion will follow.
    Submitted,
    /// The platform refused the transfer outright.
    Rejected(String),
}

/// One drained bulk-in completion. Completions are always delivered in
/// submission order.
#[derive(Debug)]
pub enum BulkCompletion {
    /// Nothing has finished yet.
    Pending,
    /// The oldest in-flight transfer finished with these bytes.
    Done(Vec<u8>),
    /// The oldest in-flight transfer was cancelled.
    Aborted,
    /// The oldest in-flight transfer failed.
    Failed(String),
}

#[derive(Debug)]
pub enum ControlCompletion {
    Pending,
    /// The transfer finished; for IN transfers this carries the payload.
    Done(Vec<u8>),
    Failed(String),
}

/// A bulk IN pipe that can keep several reads in flight.
pub trait BulkInPipe: Send {
    /// Queue a read of `len` bytes.
    fn submit(&mut self, len: usize) -> SubmitOutcome;

    /// Non-blocking completion query for the oldest in-flight read.
    fn poll_complete(&mut self) -> BulkCompletion;

    /// Blocking completion query, used while draining after a cancel.
    fn wait_complete(&mut self, timeout: Duration) -> BulkCompletion;

    /// Park until a completion is available or the timeout lapses. Does not
    /// consume the completion; a later `poll_complete` returns it.
    fn wait_ready(&mut self, timeout: Duration) -> bool;

    /// Cancel every in-flight read. Each one still completes (as aborted).
    fn abort(&mut self);
}

/// The endpoint-0 control pipe. At most one transfer is in flight; the
/// caller enforces that ordering.
pub trait ControlPipe: Send {
    fn submit(&mut self, setup: &SetupPacket, data: &[u8]) -> SubmitOutcome;

    fn poll_complete(&mut self) -> ControlCompletion;

    fn wait_complete(&mut self, timeout: Duration) -> ControlCompletion;

    /// Park until the in-flight transfer completes, without consuming it.
    fn wait_ready(&mut self, timeout: Duration) -> bool;
}

/// An opened device: a factory for its pipes.
pub trait DeviceTransport: Send {
    fn open_control(&mut self) -> Result<Box<dyn ControlPipe>, ProbeError>;

    fn open_bulk_in(
        &mut self,
        pipe_id: u8,
        transfer_size: usize,
    ) -> Result<Box<dyn BulkInPipe>, ProbeError>;

    /// Human-readable device identity for log and shell messages.
    fn description(&self) -> String;
}
