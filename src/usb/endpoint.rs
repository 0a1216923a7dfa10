//! Streaming bulk-in endpoint with a pool of in-flight transfers.
//!
//! The endpoint keeps `pool_size` reads outstanding so the device always has
//! a buffer to fill. Each tick drains completions in submission order, hands
//! the received bytes to the data sink, and immediately reissues the slot.
//! Transient "not finished yet" conditions end the drain; anything else is a
//! halt. The first halt wins the stop-code; later causes are only logged.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::error::ProbeError;
use crate::packet::BULK_IN_LENGTH;

use super::backend::{BulkCompletion, BulkInPipe, DeviceTransport, SubmitOutcome};
use super::{DeviceEvent, TransferSlot};

/// Sink for received bytes. `Break` requests orderly teardown; an error is
/// treated as a callback failure and also stops the stream.
pub type DataFn = Box<dyn FnMut(&[u8]) -> anyhow::Result<ControlFlow<()>> + Send>;

/// "Work arrived since the last tick" notification, with the same
/// stop semantics as [`DataFn`].
pub type NotifyFn = Box<dyn FnMut() -> anyhow::Result<ControlFlow<()>> + Send>;

/// Invoked exactly once per stop with the captured cause.
pub type StopFn = Box<dyn FnMut(DeviceEvent, &str) + Send>;

/// How long to wait on each completion while draining a cancelled pipe.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    Running,
    Stopping,
}

pub struct BulkInEndpoint {
    pipe_id: u8,
    transfer_size: usize,
    pool_size: usize,
    pipe: Option<Box<dyn BulkInPipe>>,
    slots: Vec<TransferSlot>,
    free: VecDeque<usize>,
    pending: VecDeque<usize>,
    data_fn: DataFn,
    notify_fn: NotifyFn,
    stop_fn: StopFn,
    state: EndpointState,
    stop_code: DeviceEvent,
    stop_message: String,
    transfer_count: u64,
    byte_count: u64,
    completed_since_notify: u32,
}

impl BulkInEndpoint {
    pub fn new(
        pipe_id: u8,
        pool_size: usize,
        block_size: usize,
        data_fn: DataFn,
        notify_fn: NotifyFn,
        stop_fn: StopFn,
    ) -> Self {
        // Transfers are issued in whole 512-byte packet granules.
        let transfer_size = block_size.div_ceil(BULK_IN_LENGTH) * BULK_IN_LENGTH;
        Self {
            pipe_id,
            transfer_size,
            pool_size,
            pipe: None,
            slots: Vec::new(),
            free: VecDeque::new(),
            pending: VecDeque::new(),
            data_fn,
            notify_fn,
            stop_fn,
            state: EndpointState::Idle,
            stop_code: DeviceEvent::None,
            stop_message: String::new(),
            transfer_count: 0,
            byte_count: 0,
            completed_since_notify: 0,
        }
    }

    pub fn pipe_id(&self) -> u8 {
        self.pipe_id
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn stop_code(&self) -> DeviceEvent {
        self.stop_code
    }

    pub fn stop_message(&self) -> &str {
        &self.stop_message
    }

    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Pool accounting; free + pending always equals the pool size outside
    /// of the instant a slot is in hand during reissue.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.free.len(), self.pending.len())
    }

    /// Open the pipe, allocate the pool and issue every slot.
    pub fn start(&mut self, transport: &mut dyn DeviceTransport) -> Result<(), ProbeError> {
        if self.state != EndpointState::Idle {
            return Err(ProbeError::Invariant(format!(
                "endpoint {:02x} started while {:?}",
                self.pipe_id, self.state
            )));
        }
        self.stop_code = DeviceEvent::None;
        self.stop_message.clear();
        self.pipe = Some(transport.open_bulk_in(self.pipe_id, self.transfer_size)?);
        self.slots = (0..self.pool_size).map(|_| TransferSlot::default()).collect();
        self.free = (0..self.pool_size).collect();
        self.pending.clear();
        self.completed_since_notify = 0;
        self.state = EndpointState::Running;
        log::debug!(
            "endpoint {:02x} started, {} x {} byte transfers",
            self.pipe_id,
            self.pool_size,
            self.transfer_size
        );
        self.refill();
        Ok(())
    }

    /// Advance the endpoint by one tick. Returns true when the endpoint must
    /// be torn down by the session.
    pub fn poll(&mut self) -> bool {
        if self.state != EndpointState::Running {
            return self.stop_code.is_failure();
        }
        let mut halt = self.expire();
        if !halt {
            halt = self.refill();
        }
        halt
    }

    /// Flush one "work arrived" tick to the notify callback. Returns true
    /// when the callback asked for (or failed into) teardown.
    pub fn notify_if_any(&mut self) -> bool {
        if self.completed_since_notify == 0 {
            return false;
        }
        self.completed_since_notify = 0;
        match (self.notify_fn)() {
            Ok(ControlFlow::Continue(())) => false,
            Ok(ControlFlow::Break(())) => true,
            Err(err) => {
                log::warn!("endpoint {:02x} notify failed: {err:#}", self.pipe_id);
                true
            }
        }
    }

    /// Idempotent teardown: cancel, drain, deliver one stop notification and
    /// return to `Idle`.
    pub fn stop(&mut self) {
        if self.state == EndpointState::Idle {
            return;
        }
        if self.state != EndpointState::Stopping {
            self.cancel();
        }
        if self.stop_code == DeviceEvent::None {
            self.stop_code = DeviceEvent::Undefined;
            // Let the pipeline consume whatever arrived before the stop.
            self.notify_if_any();
        }
        self.pipe = None;
        (self.stop_fn)(self.stop_code, &self.stop_message);
        self.state = EndpointState::Idle;
    }

    /// Non-blocking probe used by the session's composite wait.
    pub fn ready(&mut self) -> bool {
        self.wait_ready(Duration::ZERO)
    }

    pub fn wait_ready(&mut self, timeout: Duration) -> bool {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.wait_ready(timeout),
            None => false,
        }
    }

    /// Drain completions in submission order. Stops at the first transfer
    /// that is still pending so FIFO ordering is preserved.
    fn expire(&mut self) -> bool {
        let mut halt = false;
        while !halt && !self.pending.is_empty() {
            let completion = match self.pipe.as_mut() {
                Some(pipe) => pipe.poll_complete(),
                None => break,
            };
            match completion {
                BulkCompletion::Pending => break,
                BulkCompletion::Done(data) => {
                    let idx = self.pending.pop_front().expect("pending queue desync");
                    self.transfer_count += 1;
                    self.byte_count += data.len() as u64;
                    self.completed_since_notify += 1;
                    if data.len() > self.transfer_size {
                        let msg = format!(
                            "endpoint {:02x}: completion of {} bytes exceeds the {}-byte slot",
                            self.pipe_id,
                            data.len(),
                            self.transfer_size
                        );
                        self.free.push_back(idx);
                        self.halt(DeviceEvent::CommunicationError, &msg);
                        halt = true;
                        continue;
                    }
                    self.slots[idx].fill(data);
                    match (self.data_fn)(self.slots[idx].bytes()) {
                        Ok(ControlFlow::Continue(())) => {
                            halt = self.issue(idx);
                        }
                        Ok(ControlFlow::Break(())) => {
                            let msg =
                                format!("endpoint {:02x} terminated by data sink", self.pipe_id);
                            self.free.push_back(idx);
                            self.halt(DeviceEvent::CallbackStop, &msg);
                            halt = true;
                        }
                        Err(err) => {
                            let msg = format!(
                                "endpoint {:02x} data sink failed: {err:#}",
                                self.pipe_id
                            );
                            self.free.push_back(idx);
                            self.halt(DeviceEvent::CallbackException, &msg);
                            halt = true;
                        }
                    }
                }
                BulkCompletion::Aborted => {
                    let idx = self.pending.pop_front().expect("pending queue desync");
                    self.free.push_back(idx);
                    let msg = format!(
                        "endpoint {:02x} transfer aborted outside of cancel",
                        self.pipe_id
                    );
                    self.halt(DeviceEvent::CommunicationError, &msg);
                    halt = true;
                }
                BulkCompletion::Failed(err) => {
                    let idx = self.pending.pop_front().expect("pending queue desync");
                    self.free.push_back(idx);
                    let msg =
                        format!("endpoint {:02x} transfer failed: {err}", self.pipe_id);
                    self.halt(DeviceEvent::CommunicationError, &msg);
                    halt = true;
                }
            }
        }
        halt
    }

    /// Reissue every free slot.
    fn refill(&mut self) -> bool {
        while let Some(idx) = self.free.pop_front() {
            if self.issue(idx) {
                return true;
            }
        }
        false
    }

    fn issue(&mut self, idx: usize) -> bool {
        let outcome = match self.pipe.as_mut() {
            Some(pipe) => pipe.submit(self.transfer_size),
            None => SubmitOutcome::Rejected("pipe closed".into()),
        };
        match outcome {
            SubmitOutcome::Submitted => {
                self.pending.push_back(idx);
                false
            }
            SubmitOutcome::Rejected(err) => {
                self.free.push_back(idx);
                let msg = format!("endpoint {:02x} issue failed: {err}", self.pipe_id);
                self.halt(DeviceEvent::CommunicationError, &msg);
                true
            }
        }
    }

    /// Abort the pipe and reap every outstanding completion. Cancelled
    /// completions are expected and silent; anything else is logged.
    fn cancel(&mut self) {
        if let Some(pipe) = self.pipe.as_mut() {
            pipe.abort();
        }
        while !self.pending.is_empty() {
            let completion = match self.pipe.as_mut() {
                Some(pipe) => pipe.wait_complete(CANCEL_DRAIN_TIMEOUT),
                None => BulkCompletion::Aborted,
            };
            let idx = self.pending.pop_front().expect("pending queue desync");
            match completion {
                BulkCompletion::Done(data) => self.slots[idx].fill(data),
                BulkCompletion::Aborted => {}
                BulkCompletion::Failed(err) => {
                    log::warn!("endpoint {:02x} cancel drain: {err}", self.pipe_id);
                }
                BulkCompletion::Pending => {
                    log::warn!("endpoint {:02x} cancel drain timed out", self.pipe_id);
                }
            }
            self.free.push_back(idx);
        }
    }

    /// Capture the first stop cause and begin teardown. Later causes only
    /// log; they may not overwrite the first.
    fn halt(&mut self, stop_code: DeviceEvent, msg: &str) {
        if self.state == EndpointState::Running {
            self.state = EndpointState::Stopping;
            self.cancel();
        }
        if stop_code != DeviceEvent::Undefined {
            if self.stop_code == DeviceEvent::None {
                self.stop_code = stop_code;
                self.stop_message = msg.to_string();
                log::warn!("endpoint {:02x} halt {stop_code}: {msg}", self.pipe_id);
            } else {
                log::debug!(
                    "endpoint {:02x} halt {stop_code} duplicate: {msg}",
                    self.pipe_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::{MockPipeState, MockTransport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn noop_endpoint(pool: usize) -> (BulkInEndpoint, Arc<Mutex<MockPipeState>>, MockTransport) {
        let transport = MockTransport::new();
        let state = transport.bulk.clone();
        let endpoint = BulkInEndpoint::new(
            0x82,
            pool,
            1024,
            Box::new(|_| Ok(ControlFlow::Continue(()))),
            Box::new(|| Ok(ControlFlow::Continue(()))),
            Box::new(|_, _| {}),
        );
        (endpoint, state, transport)
    }

    #[test]
    fn transfer_size_rounds_up_to_packets() {
        let (endpoint, _, _) = noop_endpoint(2);
        assert_eq!(endpoint.transfer_size, 1024);
        let ep = BulkInEndpoint::new(
            0x82,
            1,
            513,
            Box::new(|_| Ok(ControlFlow::Continue(()))),
            Box::new(|| Ok(ControlFlow::Continue(()))),
            Box::new(|_, _| {}),
        );
        assert_eq!(ep.transfer_size, 1024);
    }

    #[test]
    fn start_issues_whole_pool() {
        let (mut endpoint, state, mut transport) = noop_endpoint(4);
        endpoint.start(&mut transport).unwrap();
        assert_eq!(endpoint.state(), EndpointState::Running);
        assert_eq!(endpoint.queue_depths(), (0, 4));
        assert_eq!(state.lock().unwrap().in_flight, 4);
    }

    #[test]
    fn pool_accounting_survives_completions() {
        let (mut endpoint, state, mut transport) = noop_endpoint(3);
        endpoint.start(&mut transport).unwrap();
        state
            .lock()
            .unwrap()
            .completions
            .push_back(BulkCompletion::Done(vec![0u8; 512]));
        assert!(!endpoint.poll());
        // The completed slot was reissued; the pool is intact.
        let (free, pending) = endpoint.queue_depths();
        assert_eq!(free + pending, 3);
        assert_eq!(pending, 3);
        assert_eq!(endpoint.transfer_count(), 1);
        assert!(endpoint.notify_if_any() == false);
    }

    #[test]
    fn sink_stop_halts_with_callback_stop() {
        let transport = MockTransport::new();
        let state = transport.bulk.clone();
        let mut transport = transport;
        let mut endpoint = BulkInEndpoint::new(
            0x82,
            2,
            512,
            Box::new(|_| Ok(ControlFlow::Break(()))),
            Box::new(|| Ok(ControlFlow::Continue(()))),
            Box::new(|_, _| {}),
        );
        endpoint.start(&mut transport).unwrap();
        state
            .lock()
            .unwrap()
            .completions
            .push_back(BulkCompletion::Done(vec![0u8; 512]));
        assert!(endpoint.poll());
        assert_eq!(endpoint.stop_code(), DeviceEvent::CallbackStop);
        assert_eq!(endpoint.state(), EndpointState::Stopping);
        // Cancel drained the remaining in-flight transfer back to free.
        assert_eq!(endpoint.queue_depths(), (2, 0));
        assert!(state.lock().unwrap().aborted);
    }

    #[test]
    fn first_halt_cause_is_never_overwritten() {
        let (mut endpoint, state, mut transport) = noop_endpoint(2);
        endpoint.start(&mut transport).unwrap();
        state
            .lock()
            .unwrap()
            .completions
            .push_back(BulkCompletion::Failed("stall".into()));
        assert!(endpoint.poll());
        assert_eq!(endpoint.stop_code(), DeviceEvent::CommunicationError);
        let first_message = endpoint.stop_message().to_string();
        endpoint.halt(DeviceEvent::CallbackStop, "too late");
        assert_eq!(endpoint.stop_code(), DeviceEvent::CommunicationError);
        assert_eq!(endpoint.stop_message(), first_message);
    }

    #[test]
    fn oversized_completion_is_fatal() {
        let (mut endpoint, state, mut transport) = noop_endpoint(2);
        endpoint.start(&mut transport).unwrap();
        state
            .lock()
            .unwrap()
            .completions
            .push_back(BulkCompletion::Done(vec![0u8; 4096]));
        assert!(endpoint.poll());
        assert_eq!(endpoint.stop_code(), DeviceEvent::CommunicationError);
        assert!(endpoint.stop_message().contains("exceeds"));
    }

    #[test]
    fn stop_is_idempotent_and_notifies_once() {
        let stops = Arc::new(AtomicU32::new(0));
        let stops_seen = stops.clone();
        let transport = MockTransport::new();
        let mut transport = transport;
        let mut endpoint = BulkInEndpoint::new(
            0x82,
            2,
            512,
            Box::new(|_| Ok(ControlFlow::Continue(()))),
            Box::new(|| Ok(ControlFlow::Continue(()))),
            Box::new(move |code, _| {
                assert_eq!(code, DeviceEvent::Undefined);
                stops_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        endpoint.start(&mut transport).unwrap();
        endpoint.stop();
        endpoint.stop();
        assert_eq!(endpoint.state(), EndpointState::Idle);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_issue_is_a_communication_error() {
        let (mut endpoint, state, mut transport) = noop_endpoint(2);
        endpoint.start(&mut transport).unwrap();
        {
            let mut st = state.lock().unwrap();
            st.completions.push_back(BulkCompletion::Done(vec![0u8; 512]));
            st.reject_submits = Some("no device".into());
        }
        assert!(endpoint.poll());
        assert_eq!(endpoint.stop_code(), DeviceEvent::CommunicationError);
        assert!(endpoint.stop_message().contains("issue failed"));
        let (free, pending) = endpoint.queue_depths();
        assert_eq!(free + pending, 2);
    }

    #[test]
    fn notify_flushes_only_after_completions() {
        let ticks = Arc::new(AtomicU32::new(0));
        let ticks_seen = ticks.clone();
        let transport = MockTransport::new();
        let state = transport.bulk.clone();
        let mut transport = transport;
        let mut endpoint = BulkInEndpoint::new(
            0x82,
            1,
            512,
            Box::new(|_| Ok(ControlFlow::Continue(()))),
            Box::new(move || {
                ticks_seen.fetch_add(1, Ordering::SeqCst);
                Ok(ControlFlow::Continue(()))
            }),
            Box::new(|_, _| {}),
        );
        endpoint.start(&mut transport).unwrap();
        assert!(!endpoint.notify_if_any());
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        state
            .lock()
            .unwrap()
            .completions
            .push_back(BulkCompletion::Done(vec![0u8; 512]));
        endpoint.poll();
        assert!(!endpoint.notify_if_any());
        assert!(!endpoint.notify_if_any());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
