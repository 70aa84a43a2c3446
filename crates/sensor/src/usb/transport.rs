//! rusb-backed transport
//!
//! Opens the sensor's vendor interface (configuration 1, interface 1,
//! alternate setting 0) and talks to it over bulk endpoint 2 in both
//! directions. Every step of `open` records what it acquired so that a failure
//! part way through, and `close`, release exactly what is held.

use crate::error::{Error, OpenFailure, Result};
use crate::transport::{ENDPOINT_TIMEOUT, Transport, TransportState, hex_dump};
use common::UsbLocation;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, warn};

/// Configuration value selected on open
pub const CONFIGURATION: u8 = 1;
/// Interface claimed on open
pub const INTERFACE: u8 = 1;
/// Alternate setting selected on the claimed interface
pub const ALT_SETTING: u8 = 0;
/// Bulk OUT endpoint
pub const ENDPOINT_OUT: u8 = 0x02;
/// Bulk IN endpoint
pub const ENDPOINT_IN: u8 = 0x82;

/// Which device a transport opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Restrict to one bus position; `None` opens the first id match
    pub location: Option<UsbLocation>,
}

impl DeviceSelector {
    /// Select the first device with the given ids
    pub fn any(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            location: None,
        }
    }

    /// Select the device at `location` with the given ids
    pub fn at(vendor_id: u16, product_id: u16, location: UsbLocation) -> Self {
        Self {
            vendor_id,
            product_id,
            location: Some(location),
        }
    }

    fn matches<T: UsbContext>(&self, device: &Device<T>) -> bool {
        if let Some(location) = self.location
            && (device.bus_number() != location.bus || device.address() != location.address)
        {
            return false;
        }

        match device.device_descriptor() {
            Ok(desc) => desc.vendor_id() == self.vendor_id && desc.product_id() == self.product_id,
            Err(e) => {
                debug!(
                    "Skipping device bus={}, addr={}: descriptor unreadable: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                false
            }
        }
    }
}

/// Hardware transport for one sensor
pub struct UsbTransport {
    selector: DeviceSelector,
    state: TransportState,
    debug: bool,
    context: Option<Context>,
    handle: Option<DeviceHandle<Context>>,
    /// Interface currently claimed
    claimed: Option<u8>,
}

impl UsbTransport {
    /// Create a closed transport for the selected device
    pub fn new(selector: DeviceSelector) -> Self {
        Self {
            selector,
            state: TransportState::Idle,
            debug: false,
            context: None,
            handle: None,
            claimed: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransportState {
        self.state
    }

    fn try_open(&mut self) -> Result<()> {
        let context = self.context.insert(Context::new().map_err(open_failure)?);

        let device = context
            .devices()
            .map_err(open_failure)?
            .iter()
            .find(|device| self.selector.matches(device))
            .ok_or(Error::Open(OpenFailure::NotFound))?;

        if self.debug {
            match device.config_descriptor(CONFIGURATION - 1) {
                Ok(config) => debug!("Configuration {}: {:?}", CONFIGURATION, config),
                Err(e) => debug!("Configuration {} unreadable: {}", CONFIGURATION, e),
            }
        }

        let handle = self.handle.insert(device.open().map_err(open_failure)?);
        debug!(
            "Opened device bus={}, addr={}",
            device.bus_number(),
            device.address()
        );

        // Detaches a competing kernel driver on claim and reattaches it on release
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        if handle.active_configuration().ok() != Some(CONFIGURATION) {
            handle
                .set_active_configuration(CONFIGURATION)
                .map_err(open_failure)?;
        }

        handle.claim_interface(INTERFACE).map_err(open_failure)?;
        self.claimed = Some(INTERFACE);
        debug!("Claimed interface {}", INTERFACE);

        handle
            .set_alternate_setting(INTERFACE, ALT_SETTING)
            .map_err(open_failure)?;

        if self.debug {
            debug!(
                "Bound bulk endpoints out={:#04x} in={:#04x}, timeout {:?}",
                ENDPOINT_OUT, ENDPOINT_IN, ENDPOINT_TIMEOUT
            );
        }

        Ok(())
    }

    fn open_handle(&self) -> Result<&DeviceHandle<Context>> {
        match (&self.handle, self.state) {
            (Some(handle), TransportState::Open) => Ok(handle),
            _ => Err(Error::NotOpen),
        }
    }
}

impl Transport for UsbTransport {
    fn open(&mut self, debug: bool) -> Result<()> {
        match self.state {
            TransportState::Open => return Ok(()),
            TransportState::Closed => return Err(Error::TransportClosed),
            TransportState::Idle | TransportState::Opening => {}
        }

        self.state = TransportState::Opening;
        self.debug = debug;

        if let Err(e) = self.try_open() {
            warn!(
                "Failed to open {:04x}:{:04x}: {}",
                self.selector.vendor_id, self.selector.product_id, e
            );
            let _ = self.close();
            return Err(e);
        }

        self.state = TransportState::Open;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == TransportState::Open
    }

    fn is_debug(&self) -> bool {
        self.debug
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let result = self
            .open_handle()?
            .write_bulk(ENDPOINT_OUT, bytes, ENDPOINT_TIMEOUT);

        if self.debug {
            match &result {
                Ok(written) => debug!("write {} bytes: {}", written, hex_dump(bytes)),
                Err(e) => debug!("write failed: {}", e),
            }
        }

        result.map_err(Error::from)
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let result = self
            .open_handle()?
            .read_bulk(ENDPOINT_IN, buffer, ENDPOINT_TIMEOUT);

        if self.debug {
            match &result {
                Ok(read) => debug!("read {} bytes: {}", read, hex_dump(&buffer[..*read])),
                Err(e) => debug!("read failed: {}", e),
            }
        }

        result.map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(interface) = self.claimed.take()
            && let Some(handle) = self.handle.as_mut()
        {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            } else {
                debug!("Released interface {}", interface);
            }
        }

        // The selected configuration has nothing to release; dropping the
        // handle is enough
        if self.handle.take().is_some() {
            debug!("Closed device handle");
        }

        if self.context.take().is_some() {
            debug!("Released USB context");
        }

        self.state = TransportState::Closed;
        Ok(())
    }
}

fn open_failure(err: rusb::Error) -> Error {
    Error::Open(OpenFailure::from_usb(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_constructors() {
        let any = DeviceSelector::any(0x1916, 0x0031);
        assert_eq!(any.location, None);

        let at = DeviceSelector::at(0x1916, 0x0031, UsbLocation::new(1, 5));
        assert_eq!(at.location, Some(UsbLocation::new(1, 5)));
    }

    #[test]
    fn test_new_transport_is_closed() {
        let transport = UsbTransport::new(DeviceSelector::any(0x1916, 0x0031));
        assert!(!transport.is_open());
        assert!(!transport.is_debug());
        assert_eq!(transport.state(), TransportState::Idle);
    }

    #[test]
    fn test_transfers_require_open() {
        let mut transport = UsbTransport::new(DeviceSelector::any(0x1916, 0x0031));
        assert!(matches!(transport.write(b"U!"), Err(Error::NotOpen)));

        let mut buffer = [0u8; 5];
        assert!(matches!(transport.read(&mut buffer), Err(Error::NotOpen)));
    }

    #[test]
    fn test_double_close_is_safe() {
        let mut transport = UsbTransport::new(DeviceSelector::any(0x1916, 0x0031));
        assert!(transport.close().is_ok());
        assert!(transport.close().is_ok());
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(transport.handle.is_none());
        assert!(transport.claimed.is_none());
        assert!(matches!(transport.open(false), Err(Error::TransportClosed)));
    }
}
