//! rusb platform: enumeration, connection and hot-plug delivery
//!
//! The shared libusb context is created lazily on first use and released once
//! by [`UsbPlatform::shutdown`]. Each transport opens its own context, so a
//! sensor stays usable independently of the registry.

use crate::error::Result;
use crate::platform::{HotplugWatch, UsbPlatform};
use crate::transport::Transport;
use crate::usb::transport::{DeviceSelector, UsbTransport};
use common::{HotplugEvent, HotplugKind, HotplugSender, UsbLocation};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long one `handle_events` call may block before the stop flag is rechecked
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Platform implementation on top of libusb
pub struct RusbPlatform {
    vendor_id: u16,
    product_id: u16,
    context: Mutex<Option<Context>>,
}

impl RusbPlatform {
    /// Platform filtering on the given vendor/product pair
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            context: Mutex::new(None),
        }
    }

    /// Shared context, created on first use
    fn context(&self) -> Result<Context> {
        let mut guard = self.lock_context();
        if let Some(context) = guard.as_ref() {
            return Ok(context.clone());
        }

        let context = Context::new()?;
        debug!("Created USB context");
        *guard = Some(context.clone());
        Ok(context)
    }

    fn lock_context(&self) -> MutexGuard<'_, Option<Context>> {
        self.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_sensor<T: UsbContext>(&self, device: &Device<T>) -> bool {
        device
            .device_descriptor()
            .map(|desc| desc.vendor_id() == self.vendor_id && desc.product_id() == self.product_id)
            .unwrap_or(false)
    }
}

impl UsbPlatform for RusbPlatform {
    fn scan(&self) -> Result<Vec<UsbLocation>> {
        let context = self.context()?;
        let locations: Vec<UsbLocation> = context
            .devices()?
            .iter()
            .filter(|device| self.is_sensor(device))
            .map(|device| UsbLocation::new(device.bus_number(), device.address()))
            .collect();

        debug!("Enumerated {} sensors", locations.len());
        Ok(locations)
    }

    fn connect(&self, location: UsbLocation, debug: bool) -> Result<Box<dyn Transport>> {
        let selector = DeviceSelector::at(self.vendor_id, self.product_id, location);
        let mut transport = UsbTransport::new(selector);
        transport.open(debug)?;
        Ok(Box::new(transport))
    }

    fn watch(&self, events: HotplugSender) -> Result<Option<HotplugWatch>> {
        if !rusb::has_hotplug() {
            info!("libusb has no hot-plug support on this platform");
            return Ok(None);
        }

        let context = self.context()?;
        let registration = HotplugBuilder::new()
            .vendor_id(self.vendor_id)
            .product_id(self.product_id)
            .enumerate(true) // covers sensors attached since the registry's scan
            .register(
                &context,
                Box::new(HotplugCallback::new(events)) as Box<dyn Hotplug<Context>>,
            )?;
        debug!("Hot-plug callbacks registered");

        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run_event_loop(context, stop)
            })?;

        Ok(Some(HotplugWatch::new(move || {
            stop.store(true, Ordering::SeqCst);
            if thread.join().is_err() {
                warn!("USB event thread panicked");
            }
            drop(registration);
            debug!("Hot-plug callbacks deregistered");
        })))
    }

    fn shutdown(&self) -> Result<()> {
        if self.lock_context().take().is_some() {
            debug!("Released USB context");
        }
        Ok(())
    }
}

/// libusb event loop; hot-plug callbacks fire from inside `handle_events`
fn run_event_loop(context: Context, stop: Arc<AtomicBool>) {
    info!("USB event thread started");

    while !stop.load(Ordering::SeqCst) {
        match context.handle_events(Some(EVENT_POLL_INTERVAL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        }
    }

    info!("USB event thread stopped");
}

/// Hot-plug callback handler
///
/// Runs inside libusb event handling, where synchronous I/O is not allowed:
/// it converts the device into a [`HotplugEvent`] and queues it for the
/// registry.
struct HotplugCallback {
    events: HotplugSender,
}

impl HotplugCallback {
    fn new(events: HotplugSender) -> Self {
        Self { events }
    }

    fn forward<T: UsbContext>(&self, kind: HotplugKind, device: &Device<T>) {
        let location = UsbLocation::new(device.bus_number(), device.address());
        debug!("Hot-plug callback: {:?} ({})", kind, location);

        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Failed to read descriptor of device {}: {}", location, e);
                return;
            }
        };

        let event = HotplugEvent {
            kind,
            location,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        };

        if let Err(e) = self.events.send(event) {
            warn!("Dropped hot-plug event for {}: {}", location, e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward(HotplugKind::Arrived, &device);
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward(HotplugKind::Left, &device);
    }
}
