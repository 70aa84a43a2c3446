//! Integration tests for registry handling in the CLI
//!
//! Runs the watch forwarder and shutdown against the fake platform:
//! - Notices for arrivals and departures
//! - Departed sensors are closed
//! - Shutdown closes what the registry still tracks
//!
//! Run with: `cargo test -p cli --test session_tests`

use cli::session::{Forwarder, Notice, shutdown};
use common::UsbLocation;
use sensor::test_utils::{FakePlatform, FakeSensor};
use sensor::{BootstrapPlan, Registry, RegistryOptions};
use std::sync::Arc;
use std::time::Duration;

fn registry(platform: &FakePlatform) -> Registry {
    let options = RegistryOptions {
        bootstrap: BootstrapPlan::standard(Duration::ZERO, Duration::ZERO, 2),
        ..RegistryOptions::default()
    };
    Registry::with_platform(Arc::new(platform.clone()), options)
}

fn is_added(notice: Notice, uuid: &str) -> bool {
    matches!(notice, Notice::Added(text) if text.contains(&format!("[{}]", uuid)))
}

fn is_removed(notice: Notice, uuid: &str) -> bool {
    matches!(notice, Notice::Removed(text) if text.contains(&format!("[{}]", uuid)))
}

// ============================================================================
// Forwarder
// ============================================================================

#[test]
fn test_forwarder_reports_changes() {
    let platform = FakePlatform::new();
    let registry = registry(&platform);
    let (tx, rx) = async_channel::unbounded();
    registry.register(Arc::new(Forwarder::new(tx)));

    let location = UsbLocation::new(1, 4);
    platform.plug(location, FakeSensor::new());
    registry.list().unwrap();
    assert!(is_added(rx.try_recv().unwrap(), "1:4"));

    platform.unplug(location);
    registry.list().unwrap();
    assert!(is_removed(rx.try_recv().unwrap(), "1:4"));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_departed_sensor_is_closed() {
    let platform = FakePlatform::new();
    let sensor = FakeSensor::new();
    let location = UsbLocation::new(2, 7);
    platform.plug(location, sensor.clone());

    let registry = registry(&platform);
    let (tx, _rx) = async_channel::unbounded();
    registry.register(Arc::new(Forwarder::new(tx)));

    let device = registry.find_one().unwrap();
    platform.unplug(location);
    registry.list().unwrap();

    assert_eq!(sensor.closes(), 1);
    assert!(!device.lock().unwrap().is_open());
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_closes_tracked_sensors() {
    let platform = FakePlatform::new().with_hotplug();
    let first = FakeSensor::new();
    let second = FakeSensor::new();
    platform.plug(UsbLocation::new(1, 1), first.clone());
    platform.plug(UsbLocation::new(1, 2), second.clone());

    let registry = registry(&platform);
    registry.init().unwrap();
    shutdown(&registry).unwrap();

    assert!(registry.is_closed());
    assert!(!platform.is_watched());
    assert_eq!(platform.shutdowns(), 1);
    assert_eq!(first.closes(), 1);
    assert_eq!(second.closes(), 1);
}

#[test]
fn test_shutdown_twice() {
    let platform = FakePlatform::new();
    let sensor = FakeSensor::new();
    platform.plug(UsbLocation::new(3, 3), sensor.clone());

    let registry = registry(&platform);
    registry.init().unwrap();
    shutdown(&registry).unwrap();
    shutdown(&registry).unwrap();

    assert_eq!(platform.shutdowns(), 1);
    assert_eq!(sensor.closes(), 1);
}

#[test]
fn test_shutdown_uninitialized_registry() {
    let platform = FakePlatform::new();
    let registry = registry(&platform);

    shutdown(&registry).unwrap();
    assert!(registry.is_closed());
    assert_eq!(platform.scans(), 0);
}
