//! SP-420 light sensor core
//!
//! This crate opens the sensor's USB interface, speaks its command protocol
//! and keeps track of which sensors are attached:
//!
//! - [`Transport`]: blocking byte transport to one device, [`usb::UsbTransport`]
//!   on real hardware
//! - [`Device`]: calibrated readings, identity and calibration management
//! - [`BootstrapPlan`]: best-effort initial reads of a freshly opened sensor
//! - [`Registry`]: discovery, hot-plug tracking and observer notification
//!
//! # Example
//!
//! ```no_run
//! use sensor::{Registry, RegistryOptions};
//!
//! # fn main() -> sensor::Result<()> {
//! let registry = Registry::new(RegistryOptions::default());
//! let device = registry.find_one()?;
//! let watts = device.lock().unwrap().read()?;
//! println!("{:.2} W/m²", watts);
//! registry.close()?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod device;
pub mod error;
pub mod platform;
pub mod registry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod usb;

pub use bootstrap::{BootstrapPlan, BootstrapReport, BootstrapStep, PlannedStep, StepOutcome};
pub use device::{Calibration, DEVICE_NAME, Device, LightSource};
pub use error::{Error, OpenFailure, Result};
pub use platform::{HotplugWatch, UsbPlatform};
pub use registry::{HotplugObserver, Registry, RegistryOptions, SharedDevice};
pub use transport::{ENDPOINT_TIMEOUT, Transport, TransportState};
