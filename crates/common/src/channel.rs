//! Hotplug event channel between the platform USB thread and the registry
//!
//! The platform hotplug callback runs inside the USB library's event loop and
//! must never block, so the sending side only ever uses a non-blocking send on
//! an unbounded channel. The registry actor drains the receiving side.

use async_channel::{Receiver, Sender, unbounded};
use std::fmt;

/// Bus position of a USB device
///
/// The pair is only stable while the device stays plugged in: a device that
/// reconnects at a reused bus/address is indistinguishable from the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbLocation {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl UsbLocation {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }

    /// Identifier derived from the bus/address pair
    pub fn uuid(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for UsbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.address)
    }
}

/// Direction of a hotplug event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugKind {
    /// Device plugged in
    Arrived,
    /// Device unplugged
    Left,
}

/// One hotplug notification from the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub kind: HotplugKind,
    pub location: UsbLocation,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl HotplugEvent {
    /// Device arrival event
    pub fn arrived(location: UsbLocation, vendor_id: u16, product_id: u16) -> Self {
        Self {
            kind: HotplugKind::Arrived,
            location,
            vendor_id,
            product_id,
        }
    }

    /// Device departure event
    pub fn left(location: UsbLocation, vendor_id: u16, product_id: u16) -> Self {
        Self {
            kind: HotplugKind::Left,
            location,
            vendor_id,
            product_id,
        }
    }

    /// Whether the event concerns the given vendor/product pair
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Sending half, owned by the platform hotplug callback
#[derive(Clone)]
pub struct HotplugSender {
    tx: Sender<HotplugEvent>,
}

impl HotplugSender {
    /// Queue an event without blocking
    pub fn send(&self, event: HotplugEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Close the channel; the receiver drains what is queued and then stops
    pub fn close(&self) -> bool {
        self.tx.close()
    }
}

/// Receiving half, owned by the registry actor
#[derive(Clone)]
pub struct HotplugReceiver {
    rx: Receiver<HotplugEvent>,
}

impl HotplugReceiver {
    /// Receive the next event (blocking)
    ///
    /// Returns an error once the channel is closed and empty.
    pub fn recv_blocking(&self) -> crate::Result<HotplugEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<HotplugEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<HotplugEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create the hotplug channel
///
/// Returns (HotplugSender for the platform callback, HotplugReceiver for the registry)
pub fn create_hotplug_channel() -> (HotplugSender, HotplugReceiver) {
    let (tx, rx) = unbounded();
    (HotplugSender { tx }, HotplugReceiver { rx })
}
