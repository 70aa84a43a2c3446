//! SP-420 sensor abstraction
//!
//! A [`Device`] owns exactly one open [`Transport`] and layers the command
//! protocol, calibration and identity on top of it. Calibration values are
//! zero until the registry's bootstrap has read them.

use crate::bootstrap::BootstrapReport;
use crate::error::{Error, Result};
use crate::transport::Transport;
use common::UsbLocation;
use protocol::Command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Human name of the sensor family
pub const DEVICE_NAME: &str = "SP-420";

/// Light source the sensor is measuring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightSource {
    Electric,
    #[default]
    Sunlight,
}

impl LightSource {
    /// Light-type correction factor for this source and firmware version
    ///
    /// Electric is always 1.0. Sunlight is 1.12 for firmware 5 through 9 and
    /// 1.14 for anything else.
    pub fn multiplier(self, firmware_version: u8) -> f32 {
        match self {
            LightSource::Electric => 1.0,
            LightSource::Sunlight if (5..10).contains(&firmware_version) => 1.12,
            LightSource::Sunlight => 1.14,
        }
    }
}

impl fmt::Display for LightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightSource::Electric => f.write_str("electric"),
            LightSource::Sunlight => f.write_str("sunlight"),
        }
    }
}

impl FromStr for LightSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "electric" => Ok(LightSource::Electric),
            "sunlight" | "sun" => Ok(LightSource::Sunlight),
            other => Err(format!(
                "unknown light source '{}' (expected electric or sunlight)",
                other
            )),
        }
    }
}

/// Calibration pair stored on the sensor
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub multiplier: f32,
    /// Volts
    pub offset: f32,
}

impl Calibration {
    pub fn new(multiplier: f32, offset: f32) -> Self {
        Self { multiplier, offset }
    }

    /// Convert raw volts to W/m²
    pub fn apply(&self, raw_volts: f32, light_type_multiplier: f32) -> f32 {
        (raw_volts - self.offset) * self.multiplier * 1000.0 * light_type_multiplier
    }
}

/// One physical SP-420 sensor
pub struct Device {
    location: UsbLocation,
    uuid: String,
    transport: Box<dyn Transport>,
    calibration: Calibration,
    permanent_calibration: Option<Calibration>,
    light_source: LightSource,
    light_type_multiplier: f32,
    firmware_version: u8,
    serial: f32,
    bootstrap: Option<BootstrapReport>,
}

impl Device {
    /// Wrap an open transport
    ///
    /// Identity and calibration stay at their zero defaults until read.
    pub fn new(location: UsbLocation, transport: Box<dyn Transport>, light_source: LightSource) -> Self {
        let mut device = Self {
            location,
            uuid: location.uuid(),
            transport,
            calibration: Calibration::default(),
            permanent_calibration: None,
            light_source,
            light_type_multiplier: 1.0,
            firmware_version: 0,
            serial: 0.0,
            bootstrap: None,
        };
        device.set_light_source(light_source);
        device
    }

    pub fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    /// Identifier derived from the bus/address the device was found at
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn location(&self) -> UsbLocation {
        self.location
    }

    pub fn firmware_version(&self) -> u8 {
        self.firmware_version
    }

    /// Serial number; the device reports it as a float
    pub fn serial(&self) -> f32 {
        self.serial
    }

    /// Last calibration read from (or echoed by) the device
    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn light_source(&self) -> LightSource {
        self.light_source
    }

    pub fn light_type_multiplier(&self) -> f32 {
        self.light_type_multiplier
    }

    /// Outcome of the bootstrap sequence, if one ran
    pub fn bootstrap_report(&self) -> Option<&BootstrapReport> {
        self.bootstrap.as_ref()
    }

    /// Whether every bootstrap read eventually succeeded
    pub fn is_fully_bootstrapped(&self) -> bool {
        self.bootstrap
            .as_ref()
            .is_some_and(BootstrapReport::is_complete)
    }

    pub(crate) fn set_bootstrap_report(&mut self, report: BootstrapReport) {
        self.bootstrap = Some(report);
    }

    /// Select the light source and recompute the light-type multiplier
    pub fn set_light_source(&mut self, light_source: LightSource) {
        self.light_source = light_source;
        self.light_type_multiplier = light_source.multiplier(self.firmware_version);
    }

    /// Calibrated reading in W/m²
    ///
    /// A negative value means the sensor needs calibration; clamping is left
    /// to the caller.
    pub fn read(&mut self) -> Result<f32> {
        let volts = self.read_raw_volts()?;
        Ok(self.calibration.apply(volts, self.light_type_multiplier))
    }

    /// Uncalibrated voltage, useful when calibrating by hand
    pub fn read_raw_volts(&mut self) -> Result<f32> {
        let response = self.exchange(Command::ReadVoltage, &[])?;
        Ok(protocol::decode_single(Command::ReadVoltage, &response)?)
    }

    /// Refresh the calibration from the device
    pub fn read_calibration(&mut self) -> Result<Calibration> {
        let response = self.exchange(Command::ReadCalibration, &[])?;
        let (multiplier, offset) = protocol::decode_pair(Command::ReadCalibration, &response)?;
        self.calibration = Calibration::new(multiplier, offset);
        Ok(self.calibration)
    }

    /// Read the firmware version; the light-type multiplier follows it
    pub fn read_firmware_version(&mut self) -> Result<u8> {
        let response = self.exchange(Command::ReadFirmwareVersion, &[])?;
        self.firmware_version = protocol::decode_u8(Command::ReadFirmwareVersion, &response)?;
        self.set_light_source(self.light_source);
        Ok(self.firmware_version)
    }

    pub fn read_serial(&mut self) -> Result<f32> {
        let response = self.exchange(Command::ReadSerial, &[])?;
        self.serial = protocol::decode_single(Command::ReadSerial, &response)?;
        Ok(self.serial)
    }

    /// Factory calibration, fetched from the device on first call
    pub fn permanent_calibration(&mut self) -> Result<Calibration> {
        if let Some(calibration) = self.permanent_calibration {
            return Ok(calibration);
        }

        let response = self.exchange(Command::ReadPermanentCalibration, &[])?;
        let (multiplier, offset) =
            protocol::decode_pair(Command::ReadPermanentCalibration, &response)?;
        let calibration = Calibration::new(multiplier, offset);
        self.permanent_calibration = Some(calibration);
        Ok(calibration)
    }

    /// Store a new calibration on the device
    ///
    /// The values the device echoes back are kept, not the requested ones.
    pub fn set_calibration(&mut self, multiplier: f32, offset: f32) -> Result<Calibration> {
        let response = self.exchange(Command::SetCalibration, &[multiplier, offset])?;
        let (multiplier, offset) = protocol::decode_pair(Command::SetCalibration, &response)?;
        self.calibration = Calibration::new(multiplier, offset);
        Ok(self.calibration)
    }

    /// ASCII sensor type reported by the firmware
    pub fn sensor_type(&mut self) -> Result<String> {
        let response = self.exchange(Command::ReadSensorType, &[])?;
        Ok(protocol::decode_ascii(Command::ReadSensorType, &response)?)
    }

    /// Close the underlying transport
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// One request/response round trip with prefix validation
    fn exchange(&mut self, command: Command, params: &[f32]) -> Result<Vec<u8>> {
        if !self.transport.is_open() {
            return Err(Error::NotOpen);
        }

        let request = protocol::encode(command, params)?;
        let written = self.transport.write(&request)?;
        if self.transport.is_debug() {
            debug!("{}: wrote {} bytes ({})", self.uuid, written, command);
        }

        let mut response = vec![0u8; command.response_len()];
        let read = self.transport.read(&mut response)?;
        if self.transport.is_debug() {
            debug!("{}: read {} bytes ({})", self.uuid, read, command);
        }
        response.truncate(read);

        protocol::validate(command, &response)?;
        Ok(response)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}], FW version {}, Serial {:.6}, Offset {:.6}, Multiplier {:.6}",
            self.name(),
            self.uuid,
            self.firmware_version,
            self.serial,
            self.calibration.offset,
            self.calibration.multiplier
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("uuid", &self.uuid)
            .field("firmware_version", &self.firmware_version)
            .field("serial", &self.serial)
            .field("calibration", &self.calibration)
            .field("light_source", &self.light_source)
            .field("open", &self.transport.is_open())
            .finish()
    }
}
