//! Registry tests
//!
//! Drives the registry against the fake platform:
//! - Discovery and `find_one`
//! - Observer registration and notification
//! - Hot-plug delivery through the actor thread
//! - Rescanning on platforms without hot-plug
//! - Observers calling back into the registry
//! - Shutdown
//!
//! Run with: `cargo test -p sensor --test registry_tests`

use common::{HotplugEvent, UsbLocation};
use sensor::test_utils::{FakePlatform, FakeSensor};
use sensor::{
    BootstrapPlan, Error, HotplugObserver, OpenFailure, Registry, RegistryOptions, SharedDevice,
};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Notification {
    Added(String),
    Removed(String),
}

/// Forwards notifications into a channel the test can wait on
struct Recorder {
    tx: Mutex<Sender<Notification>>,
}

impl Recorder {
    fn new() -> (Arc<Self>, Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }

    fn send(&self, notification: Notification) {
        let _ = self.tx.lock().unwrap().send(notification);
    }
}

impl HotplugObserver for Recorder {
    fn added(&self, device: &SharedDevice) {
        let uuid = device.lock().unwrap().uuid().to_string();
        self.send(Notification::Added(uuid));
    }

    fn removed(&self, device: &SharedDevice) {
        let uuid = device.lock().unwrap().uuid().to_string();
        self.send(Notification::Removed(uuid));
    }
}

struct Panicker;

impl HotplugObserver for Panicker {
    fn added(&self, _device: &SharedDevice) {
        panic!("observer failure");
    }

    fn removed(&self, _device: &SharedDevice) {}
}

/// Lists the registry from inside `added` and reports the count
struct Relister {
    registry: Weak<Registry>,
    tx: Mutex<Sender<usize>>,
}

impl Relister {
    fn new(registry: &Arc<Registry>) -> (Arc<Self>, Receiver<usize>) {
        let (tx, rx) = mpsc::channel();
        let relister = Self {
            registry: Arc::downgrade(registry),
            tx: Mutex::new(tx),
        };
        (Arc::new(relister), rx)
    }
}

impl HotplugObserver for Relister {
    fn added(&self, _device: &SharedDevice) {
        if let Some(registry) = self.registry.upgrade() {
            let count = registry.list().map(|devices| devices.len()).unwrap_or(0);
            let _ = self.tx.lock().unwrap().send(count);
        }
    }

    fn removed(&self, _device: &SharedDevice) {}
}

/// Run `op` on its own thread, failing the test if it does not return
fn within_timeout<T, F>(op: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(op());
    });
    rx.recv_timeout(EVENT_TIMEOUT)
        .expect("registry call did not return")
}

fn registry(platform: &FakePlatform) -> Registry {
    let options = RegistryOptions {
        bootstrap: BootstrapPlan::standard(Duration::ZERO, Duration::ZERO, 2),
        ..RegistryOptions::default()
    };
    Registry::with_platform(Arc::new(platform.clone()), options)
}

fn event_at(location: UsbLocation, arrived: bool) -> HotplugEvent {
    if arrived {
        HotplugEvent::arrived(location, protocol::VENDOR_ID, protocol::PRODUCT_ID)
    } else {
        HotplugEvent::left(location, protocol::VENDOR_ID, protocol::PRODUCT_ID)
    }
}

fn uuids(devices: &[SharedDevice]) -> Vec<String> {
    devices
        .iter()
        .map(|d| d.lock().unwrap().uuid().to_string())
        .collect()
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_find_one_without_sensors() {
    let platform = FakePlatform::new();
    let registry = registry(&platform);

    let result = registry.find_one();
    assert!(matches!(result, Err(Error::NoDevice)));
    assert_eq!(result.unwrap_err().to_string(), "no device found");
}

#[test]
fn test_discovery_order() {
    let platform = FakePlatform::new();
    platform.plug(UsbLocation::new(2, 1), FakeSensor::new());
    platform.plug(UsbLocation::new(1, 8), FakeSensor::new());

    let registry = registry(&platform);
    let devices = registry.list().unwrap();
    assert_eq!(uuids(&devices), vec!["1:8", "2:1"]);

    let first = registry.find_one().unwrap();
    assert!(Arc::ptr_eq(&first, &devices[0]));
}

#[test]
fn test_open_failure_skips_device() {
    let platform = FakePlatform::new();
    platform.plug(UsbLocation::new(1, 2), FakeSensor::new());
    platform.plug(UsbLocation::new(1, 3), FakeSensor::new());
    platform.fail_open(UsbLocation::new(1, 2), OpenFailure::Busy);

    let registry = registry(&platform);
    assert_eq!(uuids(&registry.list().unwrap()), vec!["1:3"]);
}

#[test]
fn test_init_runs_once() {
    let platform = FakePlatform::new().with_hotplug();
    let registry = registry(&platform);

    registry.init().unwrap();
    registry.init().unwrap();
    registry.list().unwrap();
    assert_eq!(platform.scans(), 1);
    registry.close().unwrap();
}

// ============================================================================
// Observers
// ============================================================================

#[test]
fn test_unregister_unknown_observer() {
    let platform = FakePlatform::new();
    let registry = registry(&platform);
    let (recorder, rx) = Recorder::new();
    let (stranger, _stranger_rx) = Recorder::new();

    registry.register(recorder.clone());
    registry.unregister(&stranger);

    let location = UsbLocation::new(1, 5);
    platform.plug(location, FakeSensor::new());
    registry.handle_event(&event_at(location, true));

    assert_eq!(rx.try_recv().unwrap(), Notification::Added("1:5".into()));
}

#[test]
fn test_arrival_notifies_once() {
    let platform = FakePlatform::new();
    let registry = registry(&platform);
    registry.init().unwrap();
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);

    let location = UsbLocation::new(4, 2);
    platform.plug(location, FakeSensor::new());
    registry.handle_event(&event_at(location, true));
    registry.handle_event(&event_at(location, true));

    assert_eq!(rx.try_recv().unwrap(), Notification::Added("4:2".into()));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_departure_of_unknown_device() {
    let platform = FakePlatform::new();
    let registry = registry(&platform);
    registry.init().unwrap();
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);

    registry.handle_event(&event_at(UsbLocation::new(7, 7), false));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_departure_uses_last_state() {
    let platform = FakePlatform::new();
    let location = UsbLocation::new(1, 6);
    platform.plug(location, FakeSensor::new().with_serial(99.0));

    let registry = registry(&platform);
    registry.init().unwrap();

    let removed: Arc<Mutex<Vec<f32>>> = Arc::default();
    struct SerialRecorder(Arc<Mutex<Vec<f32>>>);
    impl HotplugObserver for SerialRecorder {
        fn added(&self, _device: &SharedDevice) {}
        fn removed(&self, device: &SharedDevice) {
            self.0.lock().unwrap().push(device.lock().unwrap().serial());
        }
    }
    registry.register(Arc::new(SerialRecorder(removed.clone())));

    platform.unplug(location);
    registry.handle_event(&event_at(location, false));

    assert_eq!(*removed.lock().unwrap(), vec![99.0]);
    assert!(matches!(registry.find_one(), Err(Error::NoDevice)));
}

// ============================================================================
// Hot-plug delivery
// ============================================================================

#[test]
fn test_hotplug_arrival_and_departure() {
    let platform = FakePlatform::new().with_hotplug();
    let registry = registry(&platform);
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);
    registry.init().unwrap();
    assert!(platform.is_watched());

    let location = UsbLocation::new(3, 4);
    platform.plug(location, FakeSensor::new());
    assert_eq!(
        rx.recv_timeout(EVENT_TIMEOUT).unwrap(),
        Notification::Added("3:4".into())
    );
    assert_eq!(uuids(&registry.list().unwrap()), vec!["3:4"]);

    platform.unplug(location);
    assert_eq!(
        rx.recv_timeout(EVENT_TIMEOUT).unwrap(),
        Notification::Removed("3:4".into())
    );
    assert!(registry.list().unwrap().is_empty());

    registry.close().unwrap();
}

#[test]
fn test_actor_survives_panicking_observer() {
    let platform = FakePlatform::new().with_hotplug();
    let registry = registry(&platform);
    registry.init().unwrap();

    let panicker = Arc::new(Panicker);
    registry.register(panicker.clone());
    platform.plug(UsbLocation::new(1, 1), FakeSensor::new());

    // Wait for the first arrival to be tracked before swapping observers
    let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
    while registry.list().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline, "arrival not handled");
        std::thread::sleep(Duration::from_millis(10));
    }
    registry.unregister(&panicker);

    let (recorder, rx) = Recorder::new();
    registry.register(recorder);
    platform.plug(UsbLocation::new(1, 2), FakeSensor::new());
    assert_eq!(
        rx.recv_timeout(EVENT_TIMEOUT).unwrap(),
        Notification::Added("1:2".into())
    );

    registry.close().unwrap();
}

#[test]
fn test_sensor_attached_during_init_is_found() {
    let platform = FakePlatform::new().with_hotplug();
    let registry = registry(&platform);
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);

    platform.plug_after_next_scan(UsbLocation::new(2, 3), FakeSensor::new());
    registry.init().unwrap();

    assert_eq!(
        rx.recv_timeout(EVENT_TIMEOUT).unwrap(),
        Notification::Added("2:3".into())
    );
    assert_eq!(uuids(&registry.list().unwrap()), vec!["2:3"]);
    registry.close().unwrap();
}

#[test]
fn test_replayed_sensor_is_not_reopened() {
    let platform = FakePlatform::new().with_hotplug();
    let sensor = FakeSensor::new();
    platform.plug(UsbLocation::new(1, 1), sensor.clone());

    let registry = registry(&platform);
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);
    registry.init().unwrap();

    // Closing drains the replayed arrival before returning
    registry.close().unwrap();

    assert_eq!(rx.try_recv().unwrap(), Notification::Added("1:1".into()));
    assert!(rx.try_recv().is_err());
    assert_eq!(sensor.opens(), 1);
}

// ============================================================================
// Platforms without hot-plug
// ============================================================================

#[test]
fn test_polled_list_rescans() {
    let platform = FakePlatform::new();
    platform.plug(UsbLocation::new(1, 1), FakeSensor::new());

    let registry = registry(&platform);
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);

    assert_eq!(uuids(&registry.list().unwrap()), vec!["1:1"]);
    assert_eq!(rx.try_recv().unwrap(), Notification::Added("1:1".into()));

    platform.plug(UsbLocation::new(1, 2), FakeSensor::new());
    platform.unplug(UsbLocation::new(1, 1));
    assert_eq!(uuids(&registry.list().unwrap()), vec!["1:2"]);
    assert_eq!(rx.try_recv().unwrap(), Notification::Removed("1:1".into()));
    assert_eq!(rx.try_recv().unwrap(), Notification::Added("1:2".into()));

    // A listing is a snapshot: nothing changes until the next one
    platform.plug(UsbLocation::new(1, 3), FakeSensor::new());
    assert!(matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty)));
    assert_eq!(platform.scans(), 2);
}

// ============================================================================
// Re-entrant observers
// ============================================================================

#[test]
fn test_observer_lists_during_rescan() {
    let platform = FakePlatform::new();
    let registry = Arc::new(registry(&platform));
    registry.init().unwrap();

    let (relister, rx) = Relister::new(&registry);
    registry.register(relister);
    platform.plug(UsbLocation::new(1, 1), FakeSensor::new());

    let listing = Arc::clone(&registry);
    let listed = within_timeout(move || listing.list().map(|devices| devices.len()));
    assert_eq!(listed.unwrap(), 1);
    assert_eq!(rx.try_recv().unwrap(), 1);
}

#[test]
fn test_observer_lists_during_init() {
    let platform = FakePlatform::new();
    platform.plug(UsbLocation::new(1, 1), FakeSensor::new());
    platform.plug(UsbLocation::new(1, 2), FakeSensor::new());
    let registry = Arc::new(registry(&platform));

    let (relister, rx) = Relister::new(&registry);
    registry.register(relister);

    let starting = Arc::clone(&registry);
    within_timeout(move || starting.init()).unwrap();
    assert_eq!(rx.try_recv().unwrap(), 2);
    assert_eq!(rx.try_recv().unwrap(), 2);
}

#[test]
fn test_concurrent_init_waits_for_first() {
    let platform = FakePlatform::new().with_hotplug();
    platform.plug(UsbLocation::new(1, 1), FakeSensor::new());
    let registry = Arc::new(registry(&platform));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.list().map(|devices| devices.len()))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 1);
    }

    assert_eq!(platform.scans(), 1);
    registry.close().unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_close_is_idempotent() {
    let platform = FakePlatform::new().with_hotplug();
    let registry = registry(&platform);
    registry.init().unwrap();

    registry.close().unwrap();
    registry.close().unwrap();

    assert_eq!(platform.shutdowns(), 1);
    assert!(!platform.is_watched());
    assert!(matches!(registry.list(), Err(Error::RegistryClosed)));
}

#[test]
fn test_close_leaves_devices_open() {
    let platform = FakePlatform::new().with_hotplug();
    let sensor = FakeSensor::new();
    platform.plug(UsbLocation::new(1, 1), sensor.clone());

    let registry = registry(&platform);
    let device = registry.find_one().unwrap();
    registry.close().unwrap();

    assert!(device.lock().unwrap().is_open());
    assert_eq!(sensor.closes(), 0);

    device.lock().unwrap().close().unwrap();
    assert_eq!(sensor.closes(), 1);
}

#[test]
fn test_no_events_after_close() {
    let platform = FakePlatform::new().with_hotplug();
    let registry = registry(&platform);
    let (recorder, rx) = Recorder::new();
    registry.register(recorder);
    registry.init().unwrap();
    registry.close().unwrap();

    platform.plug(UsbLocation::new(5, 5), FakeSensor::new());
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    ));
}
