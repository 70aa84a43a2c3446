//! In-memory sensor for tests
//!
//! [`FakeSensor`] answers the SP-420 command set from its own state,
//! [`FakeTransport`] exposes it through the [`Transport`] capability set, and
//! [`FakePlatform`] plugs sensors in and out at bus locations. Failures can be
//! injected per command to exercise retry and error paths without hardware.
//!
//! # Example
//!
//! ```
//! use sensor::test_utils::FakeSensor;
//! use sensor::{Device, LightSource};
//! use common::UsbLocation;
//!
//! let sensor = FakeSensor::new().with_voltage(1.0).with_calibration(2.0, 0.0);
//! let mut device = Device::new(UsbLocation::new(1, 2), sensor.open_transport(), LightSource::Electric);
//! device.read_calibration().unwrap();
//! assert_eq!(device.read().unwrap(), 2000.0);
//! ```

use crate::error::{Error, OpenFailure, Result};
use crate::platform::{HotplugWatch, UsbPlatform};
use crate::transport::{Transport, hex_dump};
use common::{HotplugEvent, HotplugSender, UsbLocation};
use protocol::{Command, FLOAT_LEN, TERMINATOR, decode_float, encode_float_param};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
struct FakeSensorState {
    voltage: f32,
    calibration: (f32, f32),
    permanent_calibration: (f32, f32),
    serial: f32,
    firmware_version: u8,
    sensor_type: String,
    /// Calibration the device stores instead of what it is sent
    calibration_override: Option<(f32, f32)>,
    pending: Option<Vec<u8>>,
    failures: HashMap<Command, u32>,
    corrupt: u32,
    requests: Vec<Vec<u8>>,
    opens: u32,
    closes: u32,
}

impl Default for FakeSensorState {
    fn default() -> Self {
        Self {
            voltage: 2.0,
            calibration: (3.0, 0.5),
            permanent_calibration: (2.9, 0.4),
            serial: 1234.0,
            firmware_version: 7,
            sensor_type: "SP-420".to_string(),
            calibration_override: None,
            pending: None,
            failures: HashMap::new(),
            corrupt: 0,
            requests: Vec::new(),
            opens: 0,
            closes: 0,
        }
    }
}

impl FakeSensorState {
    fn respond(&mut self, command: Command, request: &[u8]) -> Vec<u8> {
        let mut response = vec![command.opcode()];
        match command {
            Command::ReadVoltage => response.extend_from_slice(&encode_float_param(self.voltage)),
            Command::ReadSerial => response.extend_from_slice(&encode_float_param(self.serial)),
            Command::ReadCalibration => push_pair(&mut response, self.calibration),
            Command::ReadPermanentCalibration => {
                push_pair(&mut response, self.permanent_calibration)
            }
            Command::SetCalibration => {
                let requested = (float_param(request, 0), float_param(request, 1));
                self.calibration = self.calibration_override.unwrap_or(requested);
                push_pair(&mut response, self.calibration);
            }
            Command::ReadFirmwareVersion => {
                response.extend_from_slice(&[self.firmware_version, TERMINATOR, 0]);
            }
            Command::ReadSensorType => {
                response.extend_from_slice(self.sensor_type.as_bytes());
                response.push(TERMINATOR);
            }
        }

        if self.corrupt > 0 {
            self.corrupt -= 1;
            response[0] = !response[0];
        }
        response
    }
}

fn push_pair(response: &mut Vec<u8>, (first, second): (f32, f32)) {
    response.extend_from_slice(&encode_float_param(first));
    response.extend_from_slice(&encode_float_param(second));
}

fn float_param(request: &[u8], index: usize) -> f32 {
    let start = 1 + index * FLOAT_LEN;
    request
        .get(start..start + FLOAT_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .map(decode_float)
        .unwrap_or_default()
}

/// Scripted SP-420; clones share state
#[derive(Clone, Default)]
pub struct FakeSensor {
    state: Arc<Mutex<FakeSensorState>>,
}

impl FakeSensor {
    /// Sensor at 2.0 V with calibration (3.0, 0.5), firmware 7, serial 1234
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeSensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_voltage(self, voltage: f32) -> Self {
        self.set_voltage(voltage);
        self
    }

    pub fn with_calibration(self, multiplier: f32, offset: f32) -> Self {
        self.lock().calibration = (multiplier, offset);
        self
    }

    pub fn with_permanent_calibration(self, multiplier: f32, offset: f32) -> Self {
        self.lock().permanent_calibration = (multiplier, offset);
        self
    }

    pub fn with_serial(self, serial: f32) -> Self {
        self.lock().serial = serial;
        self
    }

    pub fn with_firmware_version(self, version: u8) -> Self {
        self.lock().firmware_version = version;
        self
    }

    pub fn with_sensor_type(self, sensor_type: &str) -> Self {
        self.lock().sensor_type = sensor_type.to_string();
        self
    }

    /// Store `calibration` on set-calibration regardless of the request
    pub fn with_calibration_override(self, multiplier: f32, offset: f32) -> Self {
        self.lock().calibration_override = Some((multiplier, offset));
        self
    }

    pub fn set_voltage(&self, voltage: f32) {
        self.lock().voltage = voltage;
    }

    /// Time out the next `times` requests for `command`
    pub fn fail_next(&self, command: Command, times: u32) {
        *self.lock().failures.entry(command).or_default() += times;
    }

    /// Flip the prefix byte of the next `times` responses
    pub fn corrupt_next(&self, times: u32) {
        self.lock().corrupt += times;
    }

    /// Every request written so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.clone()
    }

    /// Number of requests written for `command`
    pub fn request_count(&self, command: Command) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.first() == Some(&command.opcode()))
            .count()
    }

    /// Times a transport to this sensor was opened
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Times an open transport to this sensor was actually closed
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    /// Closed transport to this sensor
    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            sensor: self.clone(),
            open: false,
            debug: false,
        }
    }

    /// Opened transport to this sensor, boxed for [`crate::Device::new`]
    pub fn open_transport(&self) -> Box<dyn Transport> {
        let mut transport = self.transport();
        self.lock().opens += 1;
        transport.open = true;
        Box::new(transport)
    }
}

/// [`Transport`] backed by a [`FakeSensor`]
pub struct FakeTransport {
    sensor: FakeSensor,
    open: bool,
    debug: bool,
}

impl Transport for FakeTransport {
    fn open(&mut self, debug: bool) -> Result<()> {
        if !self.open {
            self.sensor.lock().opens += 1;
            self.open = true;
        }
        self.debug = debug;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_debug(&self) -> bool {
        self.debug
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        if self.debug {
            debug!("fake write {}", hex_dump(bytes));
        }

        let mut state = self.sensor.lock();
        state.requests.push(bytes.to_vec());
        state.pending = None;

        let Some(command) = bytes.first().copied().and_then(Command::from_opcode) else {
            return Ok(bytes.len());
        };

        if let Some(remaining) = state.failures.get_mut(&command)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::Timeout);
        }

        let response = state.respond(command, bytes);
        state.pending = Some(response);
        Ok(bytes.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let response = self.sensor.lock().pending.take().ok_or(Error::Timeout)?;
        let count = response.len().min(buffer.len());
        buffer[..count].copy_from_slice(&response[..count]);
        if self.debug {
            debug!("fake read {}", hex_dump(&buffer[..count]));
        }
        Ok(count)
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.sensor.lock().closes += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakePlatformState {
    sensors: BTreeMap<UsbLocation, FakeSensor>,
    hotplug: bool,
    events: Option<HotplugSender>,
    open_failures: HashMap<UsbLocation, OpenFailure>,
    /// Attached silently once the next scan has returned
    after_scan: Vec<(UsbLocation, FakeSensor)>,
    scans: u32,
    shutdowns: u32,
}

/// [`UsbPlatform`] with sensors plugged in by the test
#[derive(Clone, Default)]
pub struct FakePlatform {
    vendor_id: u16,
    product_id: u16,
    state: Arc<Mutex<FakePlatformState>>,
}

impl FakePlatform {
    /// Polled platform (no hot-plug) reporting the SP-420 ids
    pub fn new() -> Self {
        Self {
            vendor_id: protocol::VENDOR_ID,
            product_id: protocol::PRODUCT_ID,
            state: Arc::default(),
        }
    }

    /// Deliver plug/unplug as hot-plug events once watched
    pub fn with_hotplug(self) -> Self {
        self.lock().hotplug = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakePlatformState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach `sensor` at `location`
    pub fn plug(&self, location: UsbLocation, sensor: FakeSensor) {
        let mut state = self.lock();
        state.sensors.insert(location, sensor);
        if let Some(events) = &state.events {
            let _ = events.send(HotplugEvent::arrived(
                location,
                self.vendor_id,
                self.product_id,
            ));
        }
    }

    /// Detach whatever is at `location`
    pub fn unplug(&self, location: UsbLocation) {
        let mut state = self.lock();
        state.sensors.remove(&location);
        if let Some(events) = &state.events {
            let _ = events.send(HotplugEvent::left(
                location,
                self.vendor_id,
                self.product_id,
            ));
        }
    }

    /// Attach `sensor` right after the next scan, without an event
    ///
    /// Models a sensor plugged in between enumeration and the hot-plug watch.
    pub fn plug_after_next_scan(&self, location: UsbLocation, sensor: FakeSensor) {
        self.lock().after_scan.push((location, sensor));
    }

    /// Make connecting to `location` fail with `failure`
    pub fn fail_open(&self, location: UsbLocation, failure: OpenFailure) {
        self.lock().open_failures.insert(location, failure);
    }

    pub fn scans(&self) -> u32 {
        self.lock().scans
    }

    pub fn shutdowns(&self) -> u32 {
        self.lock().shutdowns
    }

    /// Whether a hot-plug watch is active
    pub fn is_watched(&self) -> bool {
        self.lock().events.is_some()
    }
}

impl UsbPlatform for FakePlatform {
    fn scan(&self) -> Result<Vec<UsbLocation>> {
        let mut state = self.lock();
        state.scans += 1;
        let present = state.sensors.keys().copied().collect();
        let late = std::mem::take(&mut state.after_scan);
        state.sensors.extend(late);
        Ok(present)
    }

    fn connect(&self, location: UsbLocation, debug: bool) -> Result<Box<dyn Transport>> {
        let sensor = {
            let state = self.lock();
            if let Some(failure) = state.open_failures.get(&location) {
                return Err(Error::Open(*failure));
            }
            state
                .sensors
                .get(&location)
                .cloned()
                .ok_or(Error::Open(OpenFailure::NotFound))?
        };

        let mut transport = sensor.transport();
        transport.open(debug)?;
        Ok(Box::new(transport))
    }

    fn watch(&self, events: HotplugSender) -> Result<Option<HotplugWatch>> {
        let mut state = self.lock();
        if !state.hotplug {
            return Ok(None);
        }

        // Replay what is already attached, as libusb enumeration does
        for location in state.sensors.keys() {
            let _ = events.send(HotplugEvent::arrived(
                *location,
                self.vendor_id,
                self.product_id,
            ));
        }
        state.events = Some(events);

        let shared = Arc::clone(&self.state);
        Ok(Some(HotplugWatch::new(move || {
            shared.lock().unwrap_or_else(|e| e.into_inner()).events = None;
        })))
    }

    fn shutdown(&self) -> Result<()> {
        self.lock().shutdowns += 1;
        Ok(())
    }
}
