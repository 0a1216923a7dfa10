//! Serialized vendor control transfers over the endpoint-0 pipe.
//!
//! Commands queue FIFO; only the head is ever submitted to the platform.
//! Every command's continuation runs exactly once, whether the transfer
//! completed, failed at submit, or was terminated synthetically at close.
//! Once a stop-code poisons the channel, new submissions fail immediately.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::backend::{ControlCompletion, ControlPipe, SubmitOutcome};
use super::{DeviceEvent, Direction, SetupPacket};

/// Single-shot callback receiving the command's response.
pub type Continuation = Box<dyn FnOnce(ControlResponse) + Send>;

/// How long the in-flight head may take to finish during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ControlCommand {
    setup: SetupPacket,
    data: Vec<u8>,
    continuation: Continuation,
}

impl ControlCommand {
    pub fn new(setup: SetupPacket, data: Vec<u8>, continuation: Continuation) -> Self {
        Self {
            setup,
            data,
            continuation,
        }
    }

    fn respond(self, result: DeviceEvent, data: Vec<u8>) {
        (self.continuation)(ControlResponse {
            setup: self.setup,
            result,
            data,
        });
    }

    fn fail(self, result: DeviceEvent) {
        self.respond(result, Vec::new());
    }
}

/// Delivered to every continuation. `result` is `Undefined` (the zero-valued
/// event) on success; the payload is empty for OUT transfers and failures.
#[derive(Debug)]
pub struct ControlResponse {
    pub setup: SetupPacket,
    pub result: DeviceEvent,
    pub data: Vec<u8>,
}

impl ControlResponse {
    pub fn ok(&self) -> bool {
        self.result == DeviceEvent::Undefined
    }
}

pub struct ControlChannel {
    pipe: Option<Box<dyn ControlPipe>>,
    commands: VecDeque<ControlCommand>,
    stop_code: DeviceEvent,
    issued_at: Option<Instant>,
}

impl ControlChannel {
    pub fn new(pipe: Box<dyn ControlPipe>) -> Self {
        Self {
            pipe: Some(pipe),
            commands: VecDeque::new(),
            stop_code: DeviceEvent::None,
            issued_at: None,
        }
    }

    pub fn stop_code(&self) -> DeviceEvent {
        self.stop_code
    }

    /// Record a stop cause unless one is already captured.
    pub fn poison(&mut self, stop_code: DeviceEvent) {
        if self.stop_code == DeviceEvent::None {
            self.stop_code = stop_code;
        }
    }

    pub fn queue_len(&self) -> usize {
        self.commands.len()
    }

    /// Enqueue a command. Returns false when the channel is poisoned; the
    /// continuation has then already run with a synthetic failure.
    pub fn pend(&mut self, command: ControlCommand) -> bool {
        if self.stop_code.is_set() {
            let stop_code = self.stop_code;
            command.fail(stop_code);
            return false;
        }
        let was_empty = self.commands.is_empty();
        self.commands.push_back(command);
        if was_empty {
            return self.issue();
        }
        true
    }

    /// Submit the head command. On a synchronous failure the channel is
    /// poisoned and the head fails immediately, keeping delivery exactly
    /// once.
    fn issue(&mut self) -> bool {
        let Some(head) = self.commands.front() else {
            return true;
        };
        let outcome = match self.pipe.as_mut() {
            Some(pipe) => pipe.submit(&head.setup, &head.data),
            None => SubmitOutcome::Rejected("control pipe closed".into()),
        };
        match outcome {
            SubmitOutcome::Submitted => {
                self.issued_at = Some(Instant::now());
                true
            }
            SubmitOutcome::Rejected(err) => {
                log::warn!("control submit failed: {err}");
                self.poison(DeviceEvent::CommunicationError);
                let head = self.commands.pop_front().expect("control queue desync");
                head.fail(DeviceEvent::CommunicationError);
                false
            }
        }
    }

    /// Non-blocking completion check; on completion deliver the response and
    /// submit the next queued command unless the channel is poisoned.
    pub fn poll(&mut self) {
        if self.commands.is_empty() {
            return;
        }
        let completion = match self.pipe.as_mut() {
            Some(pipe) => pipe.poll_complete(),
            None => return,
        };
        match completion {
            ControlCompletion::Pending => {}
            ControlCompletion::Done(data) => {
                let head = self.commands.pop_front().expect("control queue desync");
                if let Some(at) = self.issued_at.take() {
                    log::trace!("control transfer finished in {:?}", at.elapsed());
                }
                let payload = match head.setup.direction {
                    Direction::In => {
                        let mut data = data;
                        data.truncate(head.setup.length as usize);
                        data
                    }
                    Direction::Out => Vec::new(),
                };
                head.respond(DeviceEvent::Undefined, payload);
                if !self.stop_code.is_set() && !self.commands.is_empty() {
                    self.issue();
                }
            }
            ControlCompletion::Failed(err) => {
                log::warn!("control transfer failed: {err}");
                self.poison(DeviceEvent::CommunicationError);
                let head = self.commands.pop_front().expect("control queue desync");
                head.fail(DeviceEvent::CommunicationError);
            }
        }
    }

    /// Park until the in-flight command completes, without consuming it.
    pub fn wait_ready(&mut self, timeout: Duration) -> bool {
        if self.commands.is_empty() {
            return false;
        }
        match self.pipe.as_mut() {
            Some(pipe) => pipe.wait_ready(timeout),
            None => false,
        }
    }

    pub fn ready(&mut self) -> bool {
        self.wait_ready(Duration::ZERO)
    }

    /// Tear the channel down. The head is already pending in the platform
    /// driver, so it gets its real completion path; everything behind it is
    /// terminated synthetically with `Undefined` and an empty payload.
    pub fn close(&mut self) {
        let mut commands = std::mem::take(&mut self.commands);
        if let Some(head) = commands.pop_front() {
            let completion = match self.pipe.as_mut() {
                Some(pipe) => pipe.wait_complete(CLOSE_TIMEOUT),
                None => ControlCompletion::Failed("control pipe closed".into()),
            };
            match completion {
                ControlCompletion::Done(data) => {
                    let payload = match head.setup.direction {
                        Direction::In => {
                            let mut data = data;
                            data.truncate(head.setup.length as usize);
                            data
                        }
                        Direction::Out => Vec::new(),
                    };
                    head.respond(DeviceEvent::Undefined, payload);
                }
                _ => head.fail(DeviceEvent::Undefined),
            }
        }
        for command in commands {
            command.fail(DeviceEvent::Undefined);
        }
        self.pipe = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::backend::ControlCompletion;
    use crate::usb::mock::MockTransport;
    use crate::usb::backend::DeviceTransport;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<ControlResponse>>>;

    fn command(setup: SetupPacket, data: Vec<u8>, seen: &Seen) -> ControlCommand {
        let seen = seen.clone();
        ControlCommand::new(
            setup,
            data,
            Box::new(move |response| seen.lock().unwrap().push(response)),
        )
    }

    fn channel() -> (ControlChannel, MockTransport, Seen) {
        let mut transport = MockTransport::new();
        let channel = ControlChannel::new(transport.open_control().unwrap());
        (channel, transport, Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn fifo_with_single_outstanding() {
        let (mut channel, transport, seen) = channel();
        let first = SetupPacket::vendor_in(4, 0, 0, 8);
        let second = SetupPacket::vendor_out(3, 1, 0, 2);
        assert!(channel.pend(command(first, Vec::new(), &seen)));
        assert!(channel.pend(command(second, vec![0xAA, 0xBB], &seen)));
        // Only the head was submitted; the mock asserts single-outstanding.
        assert_eq!(transport.control.lock().unwrap().submits.len(), 1);

        transport
            .control
            .lock()
            .unwrap()
            .responses
            .push_back(ControlCompletion::Done(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]));
        channel.poll();
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert!(seen[0].ok());
            // IN payloads are clipped to the setup length.
            assert_eq!(seen[0].data.len(), 8);
        }
        // Completion of the head issued the next command.
        assert_eq!(transport.control.lock().unwrap().submits.len(), 2);

        transport
            .control
            .lock()
            .unwrap()
            .responses
            .push_back(ControlCompletion::Done(Vec::new()));
        channel.poll();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        // OUT responses carry no payload.
        assert!(seen[1].data.is_empty());
    }

    #[test]
    fn poisoned_channel_fails_submissions_immediately() {
        let (mut channel, _transport, seen) = channel();
        channel.poison(DeviceEvent::CommunicationError);
        let enqueued = channel.pend(command(
            SetupPacket::vendor_in(4, 0, 0, 4),
            Vec::new(),
            &seen,
        ));
        assert!(!enqueued);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].result, DeviceEvent::CommunicationError);
        assert!(seen[0].data.is_empty());
    }

    #[test]
    fn rejected_submit_poisons_and_fails_the_head_once() {
        let (mut channel, transport, seen) = channel();
        transport.control.lock().unwrap().reject_next = Some("gone".into());
        let enqueued = channel.pend(command(
            SetupPacket::vendor_out(3, 0, 0, 0),
            Vec::new(),
            &seen,
        ));
        assert!(!enqueued);
        assert_eq!(channel.stop_code(), DeviceEvent::CommunicationError);
        assert_eq!(seen.lock().unwrap().len(), 1);
        // Closing afterwards must not touch the already-failed command.
        channel.close();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn close_completes_head_and_synthesizes_the_rest() {
        let (mut channel, transport, seen) = channel();
        for request in 0..3u8 {
            channel.pend(command(
                SetupPacket::vendor_in(request, 0, 0, 2),
                Vec::new(),
                &seen,
            ));
        }
        transport
            .control
            .lock()
            .unwrap()
            .responses
            .push_back(ControlCompletion::Done(vec![7, 7]));
        channel.close();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        // The head ran its real completion path.
        assert_eq!(seen[0].data, vec![7, 7]);
        // Everything queued behind it was terminated synthetically.
        assert_eq!(seen[1].result, DeviceEvent::Undefined);
        assert!(seen[1].data.is_empty());
        assert_eq!(seen[2].result, DeviceEvent::Undefined);
    }

    #[test]
    fn failed_completion_poisons_without_reissue() {
        let (mut channel, transport, seen) = channel();
        channel.pend(command(SetupPacket::vendor_in(4, 0, 0, 4), Vec::new(), &seen));
        channel.pend(command(SetupPacket::vendor_in(5, 0, 0, 4), Vec::new(), &seen));
        transport
            .control
            .lock()
            .unwrap()
            .responses
            .push_back(ControlCompletion::Failed("stall".into()));
        channel.poll();
        assert_eq!(channel.stop_code(), DeviceEvent::CommunicationError);
        // The queued command was not reissued behind a poisoned channel.
        assert_eq!(transport.control.lock().unwrap().submits.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        // It is terminated at close instead, exactly once.
        channel.close();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
