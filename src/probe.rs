//! Device-level driver for the JS110 probe.
//!
//! Wraps a [`DeviceSession`] with the vendor protocol: the EXTIO and
//! SETTINGS state packets, the status poll used for the voltage readout,
//! the calibration record fetch, and streaming start/stop on the bulk
//! endpoint. All control traffic here is synchronous; callers must not run
//! it while a background thread is spinning the session.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::calibration::{self, Calibration};
use crate::error::ProbeError;
use crate::packet::{PacketType, PACKET_VERSION};
use crate::usb::backend::DeviceTransport;
use crate::usb::endpoint::{DataFn, NotifyFn, StopFn};
use crate::usb::host::NusbTransport;
use crate::usb::session::{DeviceSession, CONTROL_TIMEOUT};
use crate::usb::{DeviceEvent, SetupPacket};

/// Streaming data arrives on endpoint 2.
pub const STREAMING_ENDPOINT_ID: u8 = 2;

/// Vendor request codes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeRequest {
    LoopbackWvalue = 1,
    LoopbackBuffer = 2,
    Settings = 3,
    Status = 4,
    SensorBootloader = 5,
    ControllerBootloader = 6,
    SerialNumber = 7,
    Calibration = 8,
    Extio = 9,
    Info = 10,
    TestMode = 11,
}

/// STATUS reply length; the 2-second mean bus voltage lives at offset 80.
const STATUS_LENGTH: u16 = 104;
const STATUS_VOLTAGE_OFFSET: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TriggerSource {
    Auto = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SignalLsb {
    Normal = 0,
    Gpi0 = 2,
}

/// IRange controls the MOSFET that connects +IN to +OUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum IRange {
    Off = 0,
    Auto = 0x80,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Streaming {
    Off = 0,
    Normal = 3,
}

/// Device-side state mirrored by the host; pushed whole on every change.
#[derive(Debug, Clone, Copy)]
struct ProbeState {
    trigger_source: TriggerSource,
    current_lsb: SignalLsb,
    voltage_lsb: SignalLsb,
    gpi0: u8,
    gpi1: u8,
    i_range: IRange,
    sensor_power: u8,
    streaming: Streaming,
    options: u8,
    source: u8,
}

impl Default for ProbeState {
    fn default() -> Self {
        Self {
            trigger_source: TriggerSource::Auto,
            current_lsb: SignalLsb::Normal,
            voltage_lsb: SignalLsb::Normal,
            gpi0: 0,
            gpi1: 0,
            i_range: IRange::Off,
            sensor_power: 1,
            streaming: Streaming::Off,
            options: 0,
            source: 0xc0, // raw ADC samples
        }
    }
}

fn extio_packet(state: &ProbeState) -> Vec<u8> {
    let mut buffer = vec![0u8; 24];
    buffer[0] = PACKET_VERSION;
    buffer[1] = buffer.len() as u8;
    buffer[2] = PacketType::Extio as u8;
    buffer[9] = state.trigger_source as u8;
    buffer[10] = state.current_lsb as u8;
    buffer[11] = state.voltage_lsb as u8;
    buffer[12] = state.gpi0;
    buffer[13] = state.gpi1;
    // io_voltage, 5000 mV
    buffer[20..24].copy_from_slice(&5000u32.to_le_bytes());
    buffer
}

fn settings_packet(state: &ProbeState) -> Vec<u8> {
    let mut buffer = vec![0u8; 16];
    buffer[0] = PACKET_VERSION;
    buffer[1] = buffer.len() as u8;
    buffer[2] = PacketType::Settings as u8;
    buffer[8] = state.sensor_power;
    buffer[9] = state.i_range as u8;
    buffer[10] = state.source;
    buffer[11] = state.options;
    buffer[12] = state.streaming as u8;
    buffer
}

/// Last session-level failure, readable by the shell after the fact.
pub type AbortSlot = Arc<Mutex<Option<(DeviceEvent, String)>>>;

pub struct Js110 {
    session: Arc<Mutex<DeviceSession>>,
    state: ProbeState,
    calibration: Calibration,
    aborted: AbortSlot,
    open: bool,
}

impl Js110 {
    /// Open the first probe, or the probe with the given serial number,
    /// push the initial device state and read the active calibration.
    pub fn open(serial: &str) -> Result<Self, ProbeError> {
        let transport = NusbTransport::open(serial)?;
        Self::open_with_transport(Box::new(transport))
    }

    pub fn open_with_transport(transport: Box<dyn DeviceTransport>) -> Result<Self, ProbeError> {
        let aborted: AbortSlot = Arc::new(Mutex::new(None));
        let slot = aborted.clone();
        let session = DeviceSession::open(
            transport,
            Some(Box::new(move |code: DeviceEvent, msg: &str| {
                log::error!("device failed: {code}: {msg}");
                let mut slot = slot.lock().expect("abort slot poisoned");
                if slot.is_none() {
                    *slot = Some((code, msg.to_string()));
                }
            })),
        )?;
        let mut probe = Self {
            session: Arc::new(Mutex::new(session)),
            state: ProbeState::default(),
            calibration: Calibration::default(),
            aborted,
            open: false,
        };
        probe.update_extio()?;
        probe.update_settings()?;
        probe.calibration = probe.read_calibration()?;
        probe.open = true;
        Ok(probe)
    }

    pub fn close(&mut self) {
        self.lock_session().close();
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_powered(&self) -> bool {
        self.state.i_range == IRange::Auto
    }

    pub fn is_tracing(&self) -> bool {
        self.state.streaming != Streaming::Off
    }

    pub fn description(&self) -> String {
        self.lock_session().description()
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Shared session handle for the trace thread.
    pub fn session(&self) -> Arc<Mutex<DeviceSession>> {
        Arc::clone(&self.session)
    }

    /// First session-level failure since open, if any.
    pub fn take_abort(&self) -> Option<(DeviceEvent, String)> {
        self.aborted.lock().expect("abort slot poisoned").take()
    }

    /// Switch the output rail. Powering on also routes GPI0 onto the
    /// current LSB so external lap marks reach the sample stream.
    pub fn power_on(&mut self, on: bool) -> Result<(), ProbeError> {
        if on {
            self.state.current_lsb = SignalLsb::Gpi0;
            self.state.i_range = IRange::Auto;
        } else {
            self.state.current_lsb = SignalLsb::Normal;
            self.state.i_range = IRange::Off;
        }
        self.update_extio()?;
        self.update_settings()
    }

    /// Blocking status read; returns the 2-second mean bus voltage in mV.
    pub fn voltage_mv(&mut self) -> Result<u32, ProbeError> {
        let data = self.control_in(ProbeRequest::Status, 0, 0, STATUS_LENGTH)?;
        if data.len() != STATUS_LENGTH as usize {
            return Err(ProbeError::Communication(format!(
                "status reply was {} bytes, expected {STATUS_LENGTH}",
                data.len()
            )));
        }
        let raw = u32::from_le_bytes(
            data[STATUS_VOLTAGE_OFFSET..STATUS_VOLTAGE_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let volts = raw as f32 / (1u32 << 17) as f32;
        Ok((volts * 1000.0) as u32)
    }

    /// Enable streaming and start the bulk-in endpoint.
    pub fn start_streaming(
        &mut self,
        pool_size: usize,
        block_size: usize,
        data_fn: DataFn,
        notify_fn: NotifyFn,
        stop_fn: StopFn,
    ) -> Result<(), ProbeError> {
        self.state.streaming = Streaming::Normal;
        self.update_settings()?;
        self.lock_session().add_in_stream(
            STREAMING_ENDPOINT_ID,
            pool_size,
            block_size,
            data_fn,
            notify_fn,
            stop_fn,
        )
    }

    /// Stop the bulk-in endpoint and tell the device to stop streaming.
    pub fn stop_streaming(&mut self) -> Result<(), ProbeError> {
        self.lock_session().remove_in_stream(STREAMING_ENDPOINT_ID);
        self.state.streaming = Streaming::Off;
        self.update_settings()
    }

    fn update_extio(&mut self) -> Result<(), ProbeError> {
        let packet = extio_packet(&self.state);
        self.control_out(ProbeRequest::Extio, 0, 0, packet)
    }

    fn update_settings(&mut self) -> Result<(), ProbeError> {
        let packet = settings_packet(&self.state);
        self.control_out(ProbeRequest::Settings, 0, 0, packet)
    }

    /// Fetch and parse the active calibration record: a 32-byte header
    /// giving the total length, then as many 4 KiB reads as it takes.
    fn read_calibration(&mut self) -> Result<Calibration, ProbeError> {
        let header = self.control_in(
            ProbeRequest::Calibration,
            1, // active (0 selects factory)
            0,
            calibration::HEADER_LENGTH as u16,
        )?;
        let length = calibration::record_length(&header)?;
        let mut raw: Vec<u8> = Vec::with_capacity(length as usize);
        while (raw.len() as u64) < length {
            let chunk = self.control_in(ProbeRequest::Calibration, 1, 0, 4096)?;
            if chunk.is_empty() {
                return Err(ProbeError::Communication(
                    "short read inside the calibration record".into(),
                ));
            }
            raw.extend_from_slice(&chunk);
        }
        Calibration::parse_datafile(&raw)
    }

    fn control_in(
        &mut self,
        request: ProbeRequest,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, ProbeError> {
        let setup = SetupPacket::vendor_in(request as u8, value, index, length);
        self.lock_session().control_in_sync(setup, CONTROL_TIMEOUT)
    }

    fn control_out(
        &mut self,
        request: ProbeRequest,
        value: u16,
        index: u16,
        data: Vec<u8>,
    ) -> Result<(), ProbeError> {
        let setup = SetupPacket::vendor_out(request as u8, value, index, data.len() as u16);
        self.lock_session().control_out_sync(setup, data, CONTROL_TIMEOUT)
    }

    fn lock_session(&self) -> MutexGuard<'_, DeviceSession> {
        self.session.lock().expect("device session poisoned")
    }
}
