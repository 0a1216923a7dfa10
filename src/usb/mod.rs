//! Asynchronous USB transfer engine.
//!
//! The engine is split the way the hardware is: [`endpoint::BulkInEndpoint`]
//! keeps a sliding window of bulk-in reads alive, [`control::ControlChannel`]
//! serializes vendor control transfers with at most one in flight, and
//! [`session::DeviceSession`] owns both and advances them one tick at a time
//! from a single thread. The platform USB stack sits behind the traits in
//! [`backend`], with the production implementation in [`host`].

pub mod backend;
pub mod control;
pub mod endpoint;
pub mod host;
#[cfg(test)]
pub mod mock;
pub mod session;

use std::fmt;

/// Event vocabulary shared by endpoints, the control channel and the session.
///
/// `None` is the "not yet signaled" state and is distinct from every real
/// event; `Undefined` is the zero-valued event used for orderly stops and
/// synthetic shutdown responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    None,
    Undefined,
    /// Unrecoverable I/O on a bulk or control pipe.
    CommunicationError,
    /// A data sink asked for orderly teardown.
    CallbackStop,
    /// A data sink or notify callback failed.
    CallbackException,
}

impl DeviceEvent {
    pub fn is_set(self) -> bool {
        self != DeviceEvent::None
    }

    /// Events that mean the endpoint died rather than stopped on request.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            DeviceEvent::CommunicationError | DeviceEvent::CallbackException
        )
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceEvent::None => "none",
            DeviceEvent::Undefined => "undefined",
            DeviceEvent::CommunicationError => "communication error",
            DeviceEvent::CallbackStop => "callback stop",
            DeviceEvent::CallbackException => "callback exception",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// USB control setup packet, with the direction kept explicit rather than
/// packed into the request-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub direction: Direction,
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn vendor_in(request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            direction: Direction::In,
            kind: RequestKind::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
            length,
        }
    }

    pub fn vendor_out(request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            direction: Direction::Out,
            ..Self::vendor_in(request, value, index, length)
        }
    }
}

/// One reusable bulk-in transfer.
///
/// A slot's identity is its index in the endpoint's pool; the free and
/// pending queues store indices, so queue churn can never invalidate a
/// reference into a reallocated container.
#[derive(Debug, Default)]
pub struct TransferSlot {
    buffer: Vec<u8>,
}

impl TransferSlot {
    /// Park the received bytes in the slot until the sink has seen them.
    pub fn fill(&mut self, data: Vec<u8>) {
        self.buffer = data;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}
