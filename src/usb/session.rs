//! Device session: owns the transport, the control channel and every
//! streaming endpoint, and advances the whole engine one tick at a time.
//!
//! `process` is the only place transfers make progress, and it is driven by
//! exactly one thread at a time. The synchronous control wrappers re-enter
//! `process` from the caller's thread; they are only legal when no
//! background thread is spinning the session, which the trace supervisor
//! guarantees by locking the session around every tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ProbeError;

use super::backend::DeviceTransport;
use super::control::{ControlChannel, ControlCommand, ControlResponse};
use super::endpoint::{BulkInEndpoint, DataFn, NotifyFn, StopFn};
use super::{DeviceEvent, Direction, SetupPacket};

/// Session-level event callback, invoked exactly once per failure episode.
pub type EventFn = Box<dyn FnMut(DeviceEvent, &str) + Send>;

/// Granularity of the composite wait. One streaming endpoint plus the
/// control pipe keeps the probe cheap; the parked slice bounds idle latency.
const WAIT_SLICE: Duration = Duration::from_millis(2);

/// Tick timeout used while a synchronous wrapper drives the loop.
const SYNC_POLL: Duration = Duration::from_millis(10);

/// Deadline for synchronous control wrappers.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct DeviceSession {
    transport: Box<dyn DeviceTransport>,
    control: ControlChannel,
    endpoints: BTreeMap<u8, BulkInEndpoint>,
    event_fn: Option<EventFn>,
    closed: bool,
}

impl DeviceSession {
    /// Build a session over an opened transport.
    pub fn open(
        mut transport: Box<dyn DeviceTransport>,
        event_fn: Option<EventFn>,
    ) -> Result<Self, ProbeError> {
        let pipe = transport.open_control()?;
        Ok(Self {
            transport,
            control: ControlChannel::new(pipe),
            endpoints: BTreeMap::new(),
            event_fn,
            closed: false,
        })
    }

    /// Stop every endpoint and close the control channel. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for endpoint in self.endpoints.values_mut() {
            endpoint.stop();
        }
        self.endpoints.clear();
        self.control.close();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn description(&self) -> String {
        self.transport.description()
    }

    pub fn control_mut(&mut self) -> &mut ControlChannel {
        &mut self.control
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Start (or restart) a streaming endpoint. An existing endpoint on the
    /// same pipe is stopped and replaced.
    pub fn add_in_stream(
        &mut self,
        endpoint_id: u8,
        pool_size: usize,
        block_size: usize,
        data_fn: DataFn,
        notify_fn: NotifyFn,
        stop_fn: StopFn,
    ) -> Result<(), ProbeError> {
        let pipe_id = (endpoint_id & 0x7f) | 0x80;
        if let Some(mut previous) = self.endpoints.remove(&pipe_id) {
            log::debug!("endpoint {pipe_id:02x} restarted; stopping the old instance");
            previous.stop();
        }
        let mut endpoint =
            BulkInEndpoint::new(pipe_id, pool_size, block_size, data_fn, notify_fn, stop_fn);
        endpoint.start(self.transport.as_mut())?;
        self.endpoints.insert(pipe_id, endpoint);
        Ok(())
    }

    pub fn remove_in_stream(&mut self, endpoint_id: u8) {
        let pipe_id = (endpoint_id & 0x7f) | 0x80;
        if let Some(mut endpoint) = self.endpoints.remove(&pipe_id) {
            endpoint.stop();
        }
    }

    /// Advance the engine by one tick: wait for any completion up to
    /// `timeout`, then poll endpoints, flush notifications, tear down
    /// stopped endpoints and advance the control channel.
    pub fn process(&mut self, timeout: Duration) {
        if !self.wait_any(timeout) {
            return;
        }
        let mut stopped: Vec<u8> = Vec::new();
        for (pipe_id, endpoint) in self.endpoints.iter_mut() {
            if endpoint.poll() {
                stopped.push(*pipe_id);
            }
        }
        for (pipe_id, endpoint) in self.endpoints.iter_mut() {
            if endpoint.notify_if_any() || endpoint.stop_code().is_set() {
                stopped.push(*pipe_id);
            }
        }
        for pipe_id in stopped {
            let Some(mut endpoint) = self.endpoints.remove(&pipe_id) else {
                continue;
            };
            endpoint.stop();
            let msg = format!(
                "endpoint pipe {pipe_id:02x} stopped: {}",
                endpoint.stop_code()
            );
            log::info!("{msg}");
            if endpoint.stop_code() == DeviceEvent::CommunicationError {
                self.abort(endpoint.stop_code(), &msg);
            }
        }
        self.control.poll();
        if self.control.stop_code() == DeviceEvent::CommunicationError {
            let msg = format!("control pipe stopped: {}", self.control.stop_code());
            self.abort(self.control.stop_code(), &msg);
        }
    }

    /// Stop everything and report the failure upward. The event callback is
    /// captured-and-nulled before the call, so an abort can neither re-enter
    /// nor fire twice per episode.
    pub fn abort(&mut self, stop_code: DeviceEvent, msg: &str) {
        for endpoint in self.endpoints.values_mut() {
            endpoint.stop();
        }
        self.endpoints.clear();
        self.control.poison(DeviceEvent::CallbackStop);
        if let Some(mut event_fn) = self.event_fn.take() {
            event_fn(stop_code, msg);
        }
    }

    /// Composite wait over the control pipe and every endpoint pipe.
    /// Returns true as soon as any of them has a completion to reap.
    fn wait_any(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.control.ready() {
                return true;
            }
            for endpoint in self.endpoints.values_mut() {
                if endpoint.ready() {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = WAIT_SLICE.min(deadline - now);
            // Park on the streaming pipe when one exists; otherwise on the
            // control pipe, or just sleep the slice out.
            if let Some(endpoint) = self.endpoints.values_mut().next() {
                if endpoint.wait_ready(slice) {
                    return true;
                }
            } else if self.control.wait_ready(slice) {
                return true;
            } else {
                thread::sleep(slice);
            }
        }
    }

    /// Synchronous control IN: submit, then drive the loop from this thread
    /// until the response lands or the deadline passes.
    pub fn control_in_sync(
        &mut self,
        setup: SetupPacket,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProbeError> {
        debug_assert_eq!(setup.direction, Direction::In);
        let holder = self.submit_with_holder(setup, Vec::new());
        self.drive_until(&holder, timeout)
    }

    /// Synchronous control OUT, same driving rules as `control_in_sync`.
    pub fn control_out_sync(
        &mut self,
        setup: SetupPacket,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        debug_assert_eq!(setup.direction, Direction::Out);
        let holder = self.submit_with_holder(setup, data);
        self.drive_until(&holder, timeout).map(|_| ())
    }

    fn submit_with_holder(
        &mut self,
        setup: SetupPacket,
        data: Vec<u8>,
    ) -> Arc<Mutex<Option<ControlResponse>>> {
        let holder: Arc<Mutex<Option<ControlResponse>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&holder);
        self.control.pend(ControlCommand::new(
            setup,
            data,
            Box::new(move |response| {
                *slot.lock().expect("response holder poisoned") = Some(response);
            }),
        ));
        holder
    }

    fn drive_until(
        &mut self,
        holder: &Arc<Mutex<Option<ControlResponse>>>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = holder.lock().expect("response holder poisoned").take() {
                return if response.ok() {
                    Ok(response.data)
                } else {
                    Err(ProbeError::Communication(format!(
                        "control transfer failed: {}",
                        response.result
                    )))
                };
            }
            if Instant::now() >= deadline {
                return Err(ProbeError::Timeout);
            }
            self.process(SYNC_POLL);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
