//! Platform USB access used by the registry
//!
//! The registry never talks to rusb directly: discovery, opening transports and
//! hotplug delivery go through [`UsbPlatform`], so the registry logic can run
//! against `test_utils::FakePlatform` as well as real hardware.

use crate::Result;
use crate::transport::Transport;
use common::{HotplugSender, UsbLocation};

/// Discovery, connection and hotplug delivery for one vendor/product pair
pub trait UsbPlatform: Send + Sync {
    /// Bus locations of every attached sensor
    fn scan(&self) -> Result<Vec<UsbLocation>>;

    /// Open a transport to the sensor at `location`
    fn connect(&self, location: UsbLocation, debug: bool) -> Result<Box<dyn Transport>>;

    /// Start delivering hotplug events into `events`
    ///
    /// Sensors attached when the watch starts are delivered as arrivals
    /// first. Returns `None` when the platform has no hotplug support.
    fn watch(&self, events: HotplugSender) -> Result<Option<HotplugWatch>>;

    /// Release the platform context. Later calls are no-ops.
    fn shutdown(&self) -> Result<()>;
}

/// Running hotplug subscription; stopping it deregisters the callback
pub struct HotplugWatch {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl HotplugWatch {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// Stop delivery and wait for the delivering thread to finish
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}
