//! Registry handling shared by the commands

use sensor::{Device, HotplugObserver, Registry, SharedDevice};
use std::sync::MutexGuard;
use tracing::warn;

/// Change in the set of attached sensors, as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Added(String),
    Removed(String),
}

/// Forwards registry notifications to the async side
///
/// A departed sensor is no longer tracked by the registry, so it is closed
/// here.
pub struct Forwarder {
    tx: async_channel::Sender<Notice>,
}

impl Forwarder {
    pub fn new(tx: async_channel::Sender<Notice>) -> Self {
        Self { tx }
    }
}

impl HotplugObserver for Forwarder {
    fn added(&self, device: &SharedDevice) {
        let _ = self.tx.try_send(Notice::Added(lock(device).to_string()));
    }

    fn removed(&self, device: &SharedDevice) {
        let mut device = lock(device);
        let description = device.to_string();
        if let Err(e) = device.close() {
            warn!("Failed to close {}: {}", device.uuid(), e);
        }
        let _ = self.tx.try_send(Notice::Removed(description));
    }
}

/// Stop the registry, then close every sensor it still tracks
///
/// The registry goes first so no sensor is bootstrapped after the snapshot.
pub fn shutdown(registry: &Registry) -> sensor::Result<()> {
    if registry.is_closed() {
        return Ok(());
    }

    let closed = registry.close();
    for device in registry.snapshot() {
        let mut device = lock(&device);
        if let Err(e) = device.close() {
            warn!("Failed to close {}: {}", device.uuid(), e);
        }
    }

    closed
}

/// Lock a device, recovering it from a panicked holder
pub fn lock(device: &SharedDevice) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(|e| e.into_inner())
}
