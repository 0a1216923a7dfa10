//! Scripted transport for exercising the transfer engine without hardware.
//!
//! Tests push completions into the shared state and watch what the engine
//! submits. The control mock additionally enforces the single-outstanding
//! rule: a second submit while one is in flight is a test failure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProbeError;

use super::backend::{
    BulkCompletion, BulkInPipe, ControlCompletion, ControlPipe, DeviceTransport, SubmitOutcome,
};
use super::SetupPacket;

#[derive(Default)]
pub struct MockPipeState {
    /// Completions handed out in order, one per in-flight transfer.
    pub completions: VecDeque<BulkCompletion>,
    pub in_flight: usize,
    pub submits: usize,
    pub reject_submits: Option<String>,
    pub aborted: bool,
}

pub struct MockBulkPipe(Arc<Mutex<MockPipeState>>);

impl BulkInPipe for MockBulkPipe {
    fn submit(&mut self, _len: usize) -> SubmitOutcome {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.reject_submits.clone() {
            return SubmitOutcome::Rejected(err);
        }
        state.in_flight += 1;
        state.submits += 1;
        SubmitOutcome::Submitted
    }

    fn poll_complete(&mut self) -> BulkCompletion {
        let mut state = self.0.lock().unwrap();
        match state.completions.pop_front() {
            Some(completion) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                completion
            }
            None => BulkCompletion::Pending,
        }
    }

    fn wait_complete(&mut self, _timeout: Duration) -> BulkCompletion {
        let mut state = self.0.lock().unwrap();
        if let Some(completion) = state.completions.pop_front() {
            state.in_flight = state.in_flight.saturating_sub(1);
            return completion;
        }
        if state.aborted && state.in_flight > 0 {
            state.in_flight -= 1;
            return BulkCompletion::Aborted;
        }
        BulkCompletion::Pending
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        if !self.0.lock().unwrap().completions.is_empty() {
            return true;
        }
        if !timeout.is_zero() {
            // Keep composite waits from spinning hot against the mock.
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        !self.0.lock().unwrap().completions.is_empty()
    }

    fn abort(&mut self) {
        self.0.lock().unwrap().aborted = true;
    }
}

#[derive(Default)]
pub struct MockControlState {
    pub responses: VecDeque<ControlCompletion>,
    pub in_flight: Option<SetupPacket>,
    pub submits: Vec<(SetupPacket, Vec<u8>)>,
    pub reject_next: Option<String>,
}

pub struct MockControlPipe(Arc<Mutex<MockControlState>>);

impl MockControlPipe {
    fn take_completion(&mut self) -> ControlCompletion {
        let mut state = self.0.lock().unwrap();
        if state.in_flight.is_none() {
            return ControlCompletion::Pending;
        }
        match state.responses.pop_front() {
            Some(response) => {
                state.in_flight = None;
                response
            }
            None => ControlCompletion::Pending,
        }
    }
}

impl ControlPipe for MockControlPipe {
    fn submit(&mut self, setup: &SetupPacket, data: &[u8]) -> SubmitOutcome {
        let mut state = self.0.lock().unwrap();
        assert!(
            state.in_flight.is_none(),
            "second control transfer submitted while one is in flight"
        );
        if let Some(err) = state.reject_next.take() {
            return SubmitOutcome::Rejected(err);
        }
        state.in_flight = Some(*setup);
        state.submits.push((*setup, data.to_vec()));
        SubmitOutcome::Submitted
    }

    fn poll_complete(&mut self) -> ControlCompletion {
        self.take_completion()
    }

    fn wait_complete(&mut self, _timeout: Duration) -> ControlCompletion {
        self.take_completion()
    }

    fn wait_ready(&mut self, _timeout: Duration) -> bool {
        let state = self.0.lock().unwrap();
        state.in_flight.is_some() && !state.responses.is_empty()
    }
}

pub struct MockTransport {
    pub bulk: Arc<Mutex<MockPipeState>>,
    pub control: Arc<Mutex<MockControlState>>,
    pub fail_bulk_open: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            bulk: Arc::new(Mutex::new(MockPipeState::default())),
            control: Arc::new(Mutex::new(MockControlState::default())),
            fail_bulk_open: false,
        }
    }
}

impl DeviceTransport for MockTransport {
    fn open_control(&mut self) -> Result<Box<dyn ControlPipe>, ProbeError> {
        Ok(Box::new(MockControlPipe(self.control.clone())))
    }

    fn open_bulk_in(
        &mut self,
        pipe_id: u8,
        _transfer_size: usize,
    ) -> Result<Box<dyn BulkInPipe>, ProbeError> {
        if self.fail_bulk_open {
            return Err(ProbeError::CannotOpen(format!(
                "mock refused bulk-in pipe {pipe_id:02x}"
            )));
        }
        Ok(Box::new(MockBulkPipe(self.bulk.clone())))
    }

    fn description(&self) -> String {
        "mock device".to_string()
    }
}
