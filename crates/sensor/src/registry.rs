//! Device registry
//!
//! Tracks every attached SP-420 and tells observers about arrivals and
//! departures. The first call to [`Registry::init`] (or anything that needs
//! it) enumerates the sensors already plugged in, bootstraps them, and then
//! subscribes to hot-plug events when the platform supports them.
//!
//! Hot-plug events are queued by the platform's event thread and consumed by
//! a single `sensor-registry` actor thread, which does the USB I/O of opening
//! and bootstrapping. One mutex guards both the device list and the observer
//! list. It is held only while the lists change; opening, bootstrapping and
//! observer callbacks all run outside it. List changes are collected as
//! [`Notification`]s and delivered once no registry lock is held, so an
//! observer may call back into the registry.
//!
//! On platforms without hot-plug, each [`Registry::list`] rescans the bus and
//! reports the difference to observers as the same added/removed events.

use crate::bootstrap::BootstrapPlan;
use crate::device::{Device, LightSource};
use crate::error::{Error, Result};
use crate::platform::{HotplugWatch, UsbPlatform};
use crate::usb::RusbPlatform;
use common::{
    HotplugEvent, HotplugKind, HotplugReceiver, HotplugSender, UsbLocation, create_hotplug_channel,
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// A tracked device; the registry keeps a reference after handing it out
pub type SharedDevice = Arc<Mutex<Device>>;

/// Receives device arrival and departure notifications
///
/// Callbacks run on the registry actor thread (or the thread calling
/// [`Registry::list`] on platforms without hot-plug) with no registry lock
/// held.
pub trait HotplugObserver: Send + Sync {
    /// A sensor was opened and bootstrapped
    fn added(&self, device: &SharedDevice);

    /// A tracked sensor was unplugged; `device` is its last known state
    fn removed(&self, device: &SharedDevice);
}

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Light source given to every discovered device
    pub light_source: LightSource,
    /// Verbose transport logging
    pub debug: bool,
    pub bootstrap: BootstrapPlan,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            vendor_id: protocol::VENDOR_ID,
            product_id: protocol::PRODUCT_ID,
            light_source: LightSource::default(),
            debug: false,
            bootstrap: BootstrapPlan::default(),
        }
    }
}

/// A list change owed to the observers registered when it happened
struct Notification {
    kind: HotplugKind,
    device: SharedDevice,
    observers: Vec<Arc<dyn HotplugObserver>>,
}

impl Notification {
    fn deliver(&self) {
        for observer in &self.observers {
            match self.kind {
                HotplugKind::Arrived => observer.added(&self.device),
                HotplugKind::Left => observer.removed(&self.device),
            }
        }
    }
}

fn deliver_all(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

struct TrackedDevice {
    uuid: String,
    location: UsbLocation,
    device: SharedDevice,
}

#[derive(Default)]
struct RegistryState {
    /// In discovery order
    devices: Vec<TrackedDevice>,
    /// In registration order
    observers: Vec<Arc<dyn HotplugObserver>>,
}

/// State shared between the registry handle and its actor thread
struct RegistryCore {
    platform: Arc<dyn UsbPlatform>,
    options: RegistryOptions,
    state: Mutex<RegistryState>,
    /// Serializes rescans; never held while observers run
    scan_lock: Mutex<()>,
}

impl RegistryCore {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<SharedDevice> {
        self.state()
            .devices
            .iter()
            .map(|tracked| Arc::clone(&tracked.device))
            .collect()
    }

    fn is_tracked(&self, uuid: &str) -> bool {
        self.state().devices.iter().any(|tracked| tracked.uuid == uuid)
    }

    /// Reconcile the tracked list with what is attached now
    ///
    /// The caller delivers the returned notifications.
    fn rescan(&self) -> Result<Vec<Notification>> {
        let _scan = self.scan_lock.lock().unwrap_or_else(|e| e.into_inner());

        let present = self.platform.scan()?;
        let known: Vec<UsbLocation> = self
            .state()
            .devices
            .iter()
            .map(|tracked| tracked.location)
            .collect();

        let departed = known
            .iter()
            .filter(|l| !present.contains(l))
            .filter_map(|l| self.depart(*l));
        let mut notifications: Vec<Notification> = departed.collect();
        notifications.extend(
            present
                .iter()
                .filter(|l| !known.contains(l))
                .filter_map(|l| self.arrive(*l)),
        );

        Ok(notifications)
    }

    fn handle_event(&self, event: &HotplugEvent) -> Option<Notification> {
        if !event.matches(self.options.vendor_id, self.options.product_id) {
            debug!(
                "Ignoring hot-plug event for {:04x}:{:04x} at {}",
                event.vendor_id, event.product_id, event.location
            );
            return None;
        }

        match event.kind {
            HotplugKind::Arrived => self.arrive(event.location),
            HotplugKind::Left => self.depart(event.location),
        }
    }

    /// Open, bootstrap and track the sensor at `location`
    fn arrive(&self, location: UsbLocation) -> Option<Notification> {
        let uuid = location.uuid();
        if self.is_tracked(&uuid) {
            debug!("Sensor {} already tracked", uuid);
            return None;
        }

        let transport = match self.platform.connect(location, self.options.debug) {
            Ok(transport) => transport,
            Err(Error::Open(failure)) => {
                warn!("Failed to open sensor at {}: {}", location, failure);
                if let Some(hint) = failure.remediation() {
                    warn!("{}", hint);
                }
                return None;
            }
            Err(e) => {
                warn!("Failed to open sensor at {}: {}", location, e);
                return None;
            }
        };

        let mut device = Device::new(location, transport, self.options.light_source);
        let report = self.options.bootstrap.run(&mut device);
        if !report.is_complete() {
            warn!(
                "Sensor {} partially bootstrapped, failed: {:?}",
                uuid,
                report.failed_steps()
            );
        }
        device.set_bootstrap_report(report);
        info!("Found {}", device);

        let device = Arc::new(Mutex::new(device));
        let observers = {
            let mut state = self.state();
            if state.devices.iter().any(|tracked| tracked.uuid == uuid) {
                None
            } else {
                state.devices.push(TrackedDevice {
                    uuid: uuid.clone(),
                    location,
                    device: Arc::clone(&device),
                });
                Some(state.observers.clone())
            }
        };

        let Some(observers) = observers else {
            // Tracked by a concurrent arrival while this one bootstrapped
            debug!("Sensor {} tracked twice, closing duplicate", uuid);
            if let Err(e) = lock_device(&device).close() {
                warn!("Failed to close duplicate of {}: {}", uuid, e);
            }
            return None;
        };

        Some(Notification {
            kind: HotplugKind::Arrived,
            device,
            observers,
        })
    }

    /// Forget the sensor at `location`; observers get its last state
    fn depart(&self, location: UsbLocation) -> Option<Notification> {
        let uuid = location.uuid();
        let removed = {
            let mut state = self.state();
            state
                .devices
                .iter()
                .position(|tracked| tracked.uuid == uuid)
                .map(|index| (state.devices.remove(index).device, state.observers.clone()))
        };

        let Some((device, observers)) = removed else {
            debug!("Departure of untracked device {}", uuid);
            return None;
        };

        info!("Sensor {} removed", uuid);
        Some(Notification {
            kind: HotplugKind::Left,
            device,
            observers,
        })
    }
}

fn lock_device(device: &SharedDevice) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hot-plug subscription plus the thread consuming it
struct HotplugActor {
    watch: HotplugWatch,
    events: HotplugSender,
    thread: JoinHandle<()>,
}

impl HotplugActor {
    fn spawn(
        core: Arc<RegistryCore>,
        watch: HotplugWatch,
        events: HotplugSender,
        receiver: HotplugReceiver,
    ) -> Result<Self> {
        let spawned = std::thread::Builder::new()
            .name("sensor-registry".to_string())
            .spawn(move || run_actor(core, receiver));

        match spawned {
            Ok(thread) => Ok(Self {
                watch,
                events,
                thread,
            }),
            Err(e) => {
                watch.stop();
                Err(e.into())
            }
        }
    }

    /// Stop delivery, drain queued events and wait for the thread
    fn stop(self) {
        self.watch.stop();
        self.events.close();
        if self.thread.join().is_err() {
            error!("Registry actor thread panicked");
        }
    }
}

fn run_actor(core: Arc<RegistryCore>, events: HotplugReceiver) {
    info!("Registry actor started");

    while let Ok(event) = events.recv_blocking() {
        debug!("Hot-plug event: {:?} at {}", event.kind, event.location);

        // A panicking observer must not end hot-plug handling
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if let Some(notification) = core.handle_event(&event) {
                notification.deliver();
            }
        }));
        if result.is_err() {
            error!("Panic while handling hot-plug event at {}", event.location);
        }
    }

    info!("Registry actor stopped");
}

enum Lifecycle {
    Uninitialized,
    /// First enumeration in progress on some thread
    Initializing,
    /// `None` when the platform has no hot-plug and `list` rescans instead
    Running(Option<HotplugActor>),
    Closed,
}

/// Set of attached sensors
pub struct Registry {
    core: Arc<RegistryCore>,
    lifecycle: Mutex<Lifecycle>,
    /// Signalled when `Initializing` ends
    settled: Condvar,
}

impl Registry {
    /// Registry over libusb
    pub fn new(options: RegistryOptions) -> Self {
        let platform = RusbPlatform::new(options.vendor_id, options.product_id);
        Self::with_platform(Arc::new(platform), options)
    }

    /// Registry over a custom platform
    pub fn with_platform(platform: Arc<dyn UsbPlatform>, options: RegistryOptions) -> Self {
        Self {
            core: Arc::new(RegistryCore {
                platform,
                options,
                state: Mutex::new(RegistryState::default()),
                scan_lock: Mutex::new(()),
            }),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            settled: Condvar::new(),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.core.options
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lifecycle once no initialization is in progress
    fn settled_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        let mut lifecycle = self.lifecycle();
        while matches!(*lifecycle, Lifecycle::Initializing) {
            lifecycle = self
                .settled
                .wait(lifecycle)
                .unwrap_or_else(|e| e.into_inner());
        }
        lifecycle
    }

    fn settle(&self, next: Lifecycle) {
        *self.lifecycle() = next;
        self.settled.notify_all();
    }

    /// Enumerate and bootstrap attached sensors, then subscribe to hot-plug
    ///
    /// Runs once; later calls return immediately, or wait while another thread
    /// initializes. A failed enumeration leaves the registry uninitialized so
    /// the next call retries. Observers hear about the initial sensors after
    /// the registry is running.
    pub fn init(&self) -> Result<()> {
        self.start().map(|_| ())
    }

    /// Returns whether `list` has to rescan to be current
    fn start(&self) -> Result<bool> {
        {
            let mut lifecycle = self.settled_lifecycle();
            match &*lifecycle {
                Lifecycle::Closed => return Err(Error::RegistryClosed),
                Lifecycle::Running(actor) => return Ok(actor.is_none()),
                Lifecycle::Uninitialized | Lifecycle::Initializing => {}
            }
            *lifecycle = Lifecycle::Initializing;
        }

        let notifications = match self.core.rescan() {
            Ok(notifications) => notifications,
            Err(e) => {
                self.settle(Lifecycle::Uninitialized);
                return Err(e);
            }
        };

        let started = match self.subscribe() {
            Ok(actor) => {
                info!(
                    "Registry initialized with {} sensors",
                    self.core.state().devices.len()
                );
                self.settle(Lifecycle::Running(actor));
                Ok(false)
            }
            Err(e) => {
                self.settle(Lifecycle::Uninitialized);
                Err(e)
            }
        };

        deliver_all(notifications);
        started
    }

    /// Hot-plug actor, or `None` when the platform has to be polled
    ///
    /// The platform replays sensors already attached when the watch starts;
    /// those that are tracked by now are skipped by the actor.
    fn subscribe(&self) -> Result<Option<HotplugActor>> {
        let (sender, receiver) = create_hotplug_channel();
        match self.core.platform.watch(sender.clone())? {
            Some(watch) => {
                let actor = HotplugActor::spawn(Arc::clone(&self.core), watch, sender, receiver)?;
                Ok(Some(actor))
            }
            None => {
                info!("No hot-plug support, sensors are rescanned on every listing");
                Ok(None)
            }
        }
    }

    /// Tracked sensors in discovery order
    ///
    /// With hot-plug this is the continuously updated list; without it the
    /// bus is rescanned first.
    pub fn list(&self) -> Result<Vec<SharedDevice>> {
        if self.start()? {
            deliver_all(self.core.rescan()?);
        }
        Ok(self.core.snapshot())
    }

    /// Tracked sensors as they are now, without initializing or rescanning
    pub fn snapshot(&self) -> Vec<SharedDevice> {
        self.core.snapshot()
    }

    /// First tracked sensor
    pub fn find_one(&self) -> Result<SharedDevice> {
        self.list()?.into_iter().next().ok_or(Error::NoDevice)
    }

    /// Add an observer; it sees only events after this call
    pub fn register(&self, observer: Arc<dyn HotplugObserver>) {
        self.core.state().observers.push(observer);
    }

    /// Remove an observer; unknown observers are ignored
    pub fn unregister<O: HotplugObserver + ?Sized>(&self, observer: &Arc<O>) {
        let target = Arc::as_ptr(observer).cast::<()>();
        self.core
            .state()
            .observers
            .retain(|registered| Arc::as_ptr(registered).cast::<()>() != target);
    }

    /// Apply one hot-plug event as if the platform had delivered it
    ///
    /// Arrivals of tracked sensors and departures of untracked ones are
    /// ignored.
    pub fn handle_event(&self, event: &HotplugEvent) {
        if let Some(notification) = self.core.handle_event(event) {
            notification.deliver();
        }
    }

    /// Stop hot-plug delivery and release the platform context
    ///
    /// Tracked devices stay open; closing them is up to their owners. Waits
    /// for an initialization in progress. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.settled_lifecycle(), Lifecycle::Closed);
        match previous {
            Lifecycle::Closed | Lifecycle::Uninitialized | Lifecycle::Initializing => Ok(()),
            Lifecycle::Running(actor) => {
                if let Some(actor) = actor {
                    actor.stop();
                }
                self.core.platform.shutdown()?;
                info!("Registry closed");
                Ok(())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakePlatform, FakeSensor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl HotplugObserver for Counter {
        fn added(&self, _device: &SharedDevice) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn removed(&self, _device: &SharedDevice) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry(platform: &FakePlatform) -> Registry {
        let options = RegistryOptions {
            bootstrap: BootstrapPlan::standard(Duration::ZERO, Duration::ZERO, 2),
            ..RegistryOptions::default()
        };
        Registry::with_platform(Arc::new(platform.clone()), options)
    }

    fn arrived(bus: u8, address: u8) -> HotplugEvent {
        HotplugEvent::arrived(
            UsbLocation::new(bus, address),
            protocol::VENDOR_ID,
            protocol::PRODUCT_ID,
        )
    }

    #[test]
    fn test_init_bootstraps_attached_sensors() {
        let platform = FakePlatform::new();
        platform.plug(UsbLocation::new(1, 4), FakeSensor::new().with_serial(42.0));

        let registry = registry(&platform);
        let devices = registry.list().unwrap();
        assert_eq!(devices.len(), 1);

        let device = lock_device(&devices[0]);
        assert_eq!(device.uuid(), "1:4");
        assert_eq!(device.serial(), 42.0);
        assert!(device.is_fully_bootstrapped());
    }

    #[test]
    fn test_duplicate_arrival_is_ignored() {
        let platform = FakePlatform::new();
        let sensor = FakeSensor::new();
        platform.plug(UsbLocation::new(1, 4), sensor.clone());

        let registry = registry(&platform);
        registry.init().unwrap();
        let counter = Arc::new(Counter::default());
        registry.register(counter.clone());

        registry.handle_event(&arrived(1, 4));
        assert_eq!(counter.added.load(Ordering::SeqCst), 0);
        assert_eq!(sensor.opens(), 1);
    }

    #[test]
    fn test_foreign_event_is_ignored() {
        let platform = FakePlatform::new();
        let registry = registry(&platform);
        registry.init().unwrap();
        let counter = Arc::new(Counter::default());
        registry.register(counter.clone());

        platform.plug(UsbLocation::new(2, 2), FakeSensor::new());
        registry.handle_event(&HotplugEvent::arrived(UsbLocation::new(2, 2), 0x046d, 0xc077));

        assert_eq!(counter.added.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_keeps_other_observers() {
        let platform = FakePlatform::new();
        let registry = registry(&platform);
        registry.init().unwrap();

        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        let third = Arc::new(Counter::default());
        registry.register(first.clone());
        registry.register(second.clone());
        registry.register(third.clone());
        registry.unregister(&second);

        platform.plug(UsbLocation::new(1, 9), FakeSensor::new());
        registry.handle_event(&arrived(1, 9));

        assert_eq!(first.added.load(Ordering::SeqCst), 1);
        assert_eq!(second.added.load(Ordering::SeqCst), 0);
        assert_eq!(third.added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_use_after_close() {
        let platform = FakePlatform::new();
        let registry = registry(&platform);
        registry.init().unwrap();
        registry.close().unwrap();

        assert!(registry.is_closed());
        assert!(matches!(registry.list(), Err(Error::RegistryClosed)));
        assert!(matches!(registry.init(), Err(Error::RegistryClosed)));
    }

    #[test]
    fn test_close_without_init_skips_shutdown() {
        let platform = FakePlatform::new();
        let registry = registry(&platform);
        registry.close().unwrap();
        assert_eq!(platform.shutdowns(), 0);
        assert_eq!(platform.scans(), 0);
    }
}
