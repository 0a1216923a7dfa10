//! Production transport over the `nusb` host stack.
//!
//! Bulk-in reads ride the endpoint's native transfer queue: submissions are
//! plain `Buffer`s and completions come back in submission order, which is
//! exactly the contract [`super::backend::BulkInPipe`] promises. Control
//! transfers are one-at-a-time by protocol, so each one runs to completion
//! on a short-lived worker thread and is reaped through a channel; the
//! driver-level 1 s timeout bounds the worker's lifetime.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, TransferError};
use nusb::{Endpoint, Interface, MaybeFuture};

use crate::error::ProbeError;

use super::backend::{
    BulkCompletion, BulkInPipe, ControlCompletion, ControlPipe, DeviceTransport, SubmitOutcome,
};
use super::{Direction, Recipient, RequestKind, SetupPacket};

/// Joulescope JS110 vendor and product ids.
pub const VENDOR_ID: u16 = 0x1fc9;
pub const PRODUCT_ID: u16 = 0xfc93;

/// Endpoint-0 pipe timeout policy.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct NusbTransport {
    interface: Interface,
    description: String,
}

impl NusbTransport {
    /// Open the first probe found, or the probe with the given serial number.
    pub fn open(serial: &str) -> Result<Self, ProbeError> {
        let devices = nusb::list_devices()
            .wait()
            .map_err(|e| ProbeError::CannotOpen(e.to_string()))?;
        let mut selected = None;
        for info in devices {
            if info.vendor_id() != VENDOR_ID || info.product_id() != PRODUCT_ID {
                continue;
            }
            if serial.is_empty() || info.serial_number() == Some(serial) {
                selected = Some(info);
                break;
            }
        }
        let Some(info) = selected else {
            return Err(ProbeError::CannotOpen(if serial.is_empty() {
                "no probe found".to_string()
            } else {
                format!("no probe with serial {serial}")
            }));
        };
        let description = format!(
            "{VENDOR_ID:04x}:{PRODUCT_ID:04x} serial {}",
            info.serial_number().unwrap_or("unknown")
        );
        let device = info
            .open()
            .wait()
            .map_err(|e| ProbeError::CannotOpen(e.to_string()))?;
        let interface = device
            .claim_interface(0)
            .wait()
            .map_err(|e| ProbeError::CannotOpen(e.to_string()))?;
        log::info!("opened probe {description}");
        Ok(Self {
            interface,
            description,
        })
    }
}

impl DeviceTransport for NusbTransport {
    fn open_control(&mut self) -> Result<Box<dyn ControlPipe>, ProbeError> {
        Ok(Box::new(NusbControlPipe {
            interface: self.interface.clone(),
            in_flight: None,
            ready: None,
        }))
    }

    fn open_bulk_in(
        &mut self,
        pipe_id: u8,
        _transfer_size: usize,
    ) -> Result<Box<dyn BulkInPipe>, ProbeError> {
        let endpoint = self
            .interface
            .endpoint::<Bulk, In>(pipe_id)
            .map_err(|e| ProbeError::CannotOpen(format!("bulk-in pipe {pipe_id:02x}: {e}")))?;
        Ok(Box::new(NusbBulkPipe {
            endpoint,
            ready: VecDeque::new(),
        }))
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

struct NusbBulkPipe {
    endpoint: Endpoint<Bulk, In>,
    /// Completions consumed by a readiness probe, waiting to be polled.
    ready: VecDeque<BulkCompletion>,
}

fn bulk_completion(completion: nusb::transfer::Completion) -> BulkCompletion {
    match completion.status {
        Ok(()) => BulkCompletion::Done(completion.buffer[..completion.actual_len].to_vec()),
        Err(TransferError::Cancelled) => BulkCompletion::Aborted,
        Err(err) => BulkCompletion::Failed(err.to_string()),
    }
}

impl BulkInPipe for NusbBulkPipe {
    fn submit(&mut self, len: usize) -> SubmitOutcome {
        let mut buffer = Buffer::new(len);
        buffer.set_requested_len(len);
        self.endpoint.submit(buffer);
        SubmitOutcome::Submitted
    }

    fn poll_complete(&mut self) -> BulkCompletion {
        if let Some(completion) = self.ready.pop_front() {
            return completion;
        }
        match self.endpoint.wait_next_complete(Duration::ZERO) {
            Some(completion) => bulk_completion(completion),
            None => BulkCompletion::Pending,
        }
    }

    fn wait_complete(&mut self, timeout: Duration) -> BulkCompletion {
        if let Some(completion) = self.ready.pop_front() {
            return completion;
        }
        match self.endpoint.wait_next_complete(timeout) {
            Some(completion) => bulk_completion(completion),
            None => BulkCompletion::Pending,
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        if !self.ready.is_empty() {
            return true;
        }
        match self.endpoint.wait_next_complete(timeout) {
            Some(completion) => {
                self.ready.push_back(bulk_completion(completion));
                true
            }
            None => false,
        }
    }

    fn abort(&mut self) {
        self.endpoint.cancel_all();
    }
}

struct NusbControlPipe {
    interface: Interface,
    in_flight: Option<mpsc::Receiver<Result<Vec<u8>, String>>>,
    /// A completion consumed by a readiness probe, waiting to be polled.
    ready: Option<ControlCompletion>,
}

fn control_type_of(kind: RequestKind) -> ControlType {
    match kind {
        RequestKind::Standard => ControlType::Standard,
        RequestKind::Class => ControlType::Class,
        RequestKind::Vendor => ControlType::Vendor,
    }
}

fn recipient_of(recipient: Recipient) -> nusb::transfer::Recipient {
    match recipient {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

fn control_result(result: Result<Vec<u8>, String>) -> ControlCompletion {
    match result {
        Ok(data) => ControlCompletion::Done(data),
        Err(err) => ControlCompletion::Failed(err),
    }
}

impl ControlPipe for NusbControlPipe {
    fn submit(&mut self, setup: &SetupPacket, data: &[u8]) -> SubmitOutcome {
        if self.in_flight.is_some() || self.ready.is_some() {
            return SubmitOutcome::Rejected("control transfer already in flight".into());
        }
        let interface = self.interface.clone();
        let setup = *setup;
        let payload = data.to_vec();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = match setup.direction {
                Direction::In => interface
                    .control_in(
                        ControlIn {
                            control_type: control_type_of(setup.kind),
                            recipient: recipient_of(setup.recipient),
                            request: setup.request,
                            value: setup.value,
                            index: setup.index,
                            length: setup.length,
                        },
                        CONTROL_TIMEOUT,
                    )
                    .wait()
                    .map_err(|e| e.to_string()),
                Direction::Out => interface
                    .control_out(
                        ControlOut {
                            control_type: control_type_of(setup.kind),
                            recipient: recipient_of(setup.recipient),
                            request: setup.request,
                            value: setup.value,
                            index: setup.index,
                            data: &payload,
                        },
                        CONTROL_TIMEOUT,
                    )
                    .wait()
                    .map(|_| Vec::new())
                    .map_err(|e| e.to_string()),
            };
            // The receiver may be gone if the channel closed mid-flight.
            let _ = tx.send(result);
        });
        self.in_flight = Some(rx);
        SubmitOutcome::Submitted
    }

    fn poll_complete(&mut self) -> ControlCompletion {
        if let Some(completion) = self.ready.take() {
            return completion;
        }
        let Some(rx) = self.in_flight.as_ref() else {
            return ControlCompletion::Pending;
        };
        match rx.try_recv() {
            Ok(result) => {
                self.in_flight = None;
                control_result(result)
            }
            Err(mpsc::TryRecvError::Empty) => ControlCompletion::Pending,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.in_flight = None;
                ControlCompletion::Failed("control worker vanished".into())
            }
        }
    }

    fn wait_complete(&mut self, timeout: Duration) -> ControlCompletion {
        if let Some(completion) = self.ready.take() {
            return completion;
        }
        let Some(rx) = self.in_flight.as_ref() else {
            return ControlCompletion::Pending;
        };
        match rx.recv_timeout(timeout) {
            Ok(result) => {
                self.in_flight = None;
                control_result(result)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => ControlCompletion::Pending,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.in_flight = None;
                ControlCompletion::Failed("control worker vanished".into())
            }
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        if self.ready.is_some() {
            return true;
        }
        if self.in_flight.is_none() {
            return false;
        }
        match self.wait_complete(timeout) {
            ControlCompletion::Pending => false,
            completion => {
                self.ready = Some(completion);
                true
            }
        }
    }
}
