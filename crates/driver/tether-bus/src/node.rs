//! Registry entries and the handles that refer to them.

use core::fmt;
use core::ops::Deref;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tether_driver_api::{Bus, DeviceInfo, DeviceState, Driver, DriverError, DrvData};

use crate::matcher::MatchReport;
use crate::scope::CommittedScope;

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub(crate) struct BusNode {
    pub(crate) name: String,
    pub(crate) bus: Box<dyn Bus>,
    pub(crate) inner: Mutex<BusInner>,
}

/// Everything guarded by one bus lock.
#[derive(Default)]
pub(crate) struct BusInner {
    pub(crate) live: bool,
    pub(crate) devices: Vec<Arc<DeviceNode>>,
    pub(crate) drivers: Vec<Arc<DriverNode>>,
    pub(crate) deferred: VecDeque<DeferredPair>,
    /// Matching passes started on this bus.
    pub(crate) passes: u64,
}

pub(crate) struct DeferredPair {
    pub(crate) device: Arc<DeviceNode>,
    pub(crate) driver: Arc<DriverNode>,
    pub(crate) attempts: u32,
    /// Pass that last deferred the pair.
    pub(crate) queued_in: u64,
}

impl BusInner {
    /// Numbers a new matching pass. Never returns 0.
    pub(crate) fn next_pass(&mut self) -> u64 {
        self.passes += 1;
        self.passes
    }

    pub(crate) fn find_device(&self, name: &str) -> Option<&Arc<DeviceNode>> {
        self.devices.iter().find(|d| d.info.name == name)
    }

    pub(crate) fn find_driver(&self, name: &str) -> Option<&Arc<DriverNode>> {
        self.drivers.iter().find(|d| d.name == name)
    }

    /// Forgets every queued pair involving `device`.
    pub(crate) fn forget_device(&mut self, device: &Arc<DeviceNode>) {
        self.deferred.retain(|p| !Arc::ptr_eq(&p.device, device));
    }

    /// Forgets every queued pair involving `driver`.
    pub(crate) fn forget_driver(&mut self, driver: &Arc<DriverNode>) {
        self.deferred.retain(|p| !Arc::ptr_eq(&p.driver, driver));
    }
}

impl BusNode {
    pub(crate) fn new(bus: Box<dyn Bus>) -> Self {
        Self {
            name: bus.name().to_owned(),
            bus,
            inner: Mutex::new(BusInner {
                live: true,
                ..BusInner::default()
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Mutable half of a device, guarded by its own lock.
#[derive(Default)]
pub(crate) struct DeviceLife {
    pub(crate) state: DeviceState,
    /// Set from reservation (`Binding`) until the device is `Unbound` again.
    pub(crate) driver: Option<Arc<DriverNode>>,
    pub(crate) drvdata: Option<DrvData>,
    pub(crate) scope: Option<CommittedScope>,
    pub(crate) last_probe_error: Option<DriverError>,
}

pub(crate) struct DeviceNode {
    pub(crate) info: DeviceInfo,
    pub(crate) bus: Weak<BusNode>,
    pub(crate) bus_name: String,
    pub(crate) life: Mutex<DeviceLife>,
    /// Signalled whenever `life.state` leaves a transitional state.
    pub(crate) changed: Condvar,
    pub(crate) registered: AtomicBool,
}

impl DeviceNode {
    pub(crate) fn new(info: DeviceInfo, bus: &Arc<BusNode>) -> Self {
        Self {
            info,
            bus: Arc::downgrade(bus),
            bus_name: bus.name.clone(),
            life: Mutex::new(DeviceLife::default()),
            changed: Condvar::new(),
            registered: AtomicBool::new(true),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Locks the lifecycle, waiting out any in-flight probe or remove.
    pub(crate) fn settled(&self) -> MutexGuard<'_, DeviceLife> {
        let mut life = self.life.lock();
        while life.state.is_transitional() {
            self.changed.wait(&mut life);
        }
        life
    }

    pub(crate) fn is_bound_to(&self, driver: &Arc<DriverNode>) -> bool {
        self.life
            .lock()
            .driver
            .as_ref()
            .is_some_and(|d| Arc::ptr_eq(d, driver))
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) struct DriverNode {
    pub(crate) name: String,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) bus: Weak<BusNode>,
    pub(crate) registered: AtomicBool,
}

impl DriverNode {
    pub(crate) fn new(driver: Box<dyn Driver>, bus: &Arc<BusNode>) -> Self {
        Self {
            name: driver.name().to_owned(),
            driver,
            bus: Arc::downgrade(bus),
            registered: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! handle_common {
    ($handle:ident) => {
        impl PartialEq for $handle {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $handle {}

        impl fmt::Debug for $handle {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($handle)).field(&self.name()).finish()
            }
        }
    };
}

/// Reference to a registered bus.
#[derive(Clone)]
pub struct BusHandle(pub(crate) Arc<BusNode>);

impl BusHandle {
    /// The bus name.
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Reference to a registered device.
#[derive(Clone)]
pub struct DeviceHandle(pub(crate) Arc<DeviceNode>);

impl DeviceHandle {
    /// The device name.
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The descriptor supplied at registration.
    pub fn info(&self) -> &DeviceInfo {
        &self.0.info
    }

    /// Name of the bus the device was registered on.
    pub fn bus_name(&self) -> &str {
        &self.0.bus_name
    }

    /// Returns `false` once the device has been unregistered.
    pub fn is_registered(&self) -> bool {
        self.0.is_registered()
    }
}

/// Reference to a registered driver.
#[derive(Clone)]
pub struct DriverHandle(pub(crate) Arc<DriverNode>);

impl DriverHandle {
    /// The driver name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns `false` once the driver has been unregistered.
    pub fn is_registered(&self) -> bool {
        self.0.is_registered()
    }
}

handle_common!(BusHandle);
handle_common!(DeviceHandle);
handle_common!(DriverHandle);

/// A freshly registered entity plus what its matching pass did.
#[derive(Debug, Clone)]
pub struct Registered<H> {
    /// Handle to the new entity.
    pub handle: H,
    /// Bindings, probe failures, and deferrals triggered by the registration.
    pub report: MatchReport,
}

impl<H> Registered<H> {
    /// Discards the report.
    pub fn into_handle(self) -> H {
        self.handle
    }
}

impl<H> Deref for Registered<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}
