//! The device/driver registry.
//!
//! [`Registry`] is the single entry point: buses are registered on it,
//! devices and drivers are registered on a bus, and every registration runs
//! a matching pass whose outcome is returned as a [`MatchReport`].

use core::any::Any;
use core::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;
use log::{debug, info};
use parking_lot::RwLock;
use tether_driver_api::{
    Bus, DeviceInfo, DeviceState, Driver, DriverError, MatchResult, UeventAction,
};

use crate::config::RegistryConfig;
use crate::error::{BusError, EntityKind};
use crate::irq::Dispatcher;
use crate::lifecycle::{self, Runtime, UnbindOutcome, UnbindRecord};
use crate::matcher::{
    self, MatchReport, Pairing, PendingProbes, Plan, ProbeFailure, Reservation,
};
use crate::node::{
    BusHandle, BusNode, DeviceHandle, DeviceNode, DriverHandle, DriverNode, Registered,
};
use crate::platform::{Allocator, HeapAllocator};
use crate::sysfs::{BusSnapshot, Uevent, UeventHub};

const TARGET: &str = "tether::registry";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`Registry`].
#[derive(Default)]
#[must_use]
pub struct RegistryBuilder {
    config: RegistryConfig,
    allocator: Option<Arc<dyn Allocator>>,
}

impl RegistryBuilder {
    /// Uses `config` instead of the defaults.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Charges driver data to `allocator` instead of an unlimited
    /// [`HeapAllocator`].
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Starts the registry and its interrupt dispatcher.
    ///
    /// # Errors
    ///
    /// [`BusError::Spawn`] if the notifier thread cannot be started.
    pub fn build(self) -> Result<Registry, BusError> {
        let dispatcher = Dispatcher::new(&self.config.irq).map_err(BusError::Spawn)?;
        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(HeapAllocator::unlimited()));
        debug!(target: TARGET, "registry started");
        Ok(Registry {
            buses: RwLock::new(Vec::new()),
            rt: Runtime {
                allocator,
                dispatcher,
                uevents: UeventHub::default(),
            },
            config: self.config,
            shut_down: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns every bus, device, driver, and binding.
///
/// All methods take `&self`; the registry is meant to be shared between
/// threads (for example behind an `Arc`). Dropping it runs
/// [`shutdown`](Self::shutdown).
pub struct Registry {
    buses: RwLock<Vec<Arc<BusNode>>>,
    rt: Runtime,
    config: RegistryConfig,
    shut_down: AtomicBool,
}

impl Registry {
    /// Starts a registry with the default configuration.
    ///
    /// # Errors
    ///
    /// [`BusError::Spawn`] if the notifier thread cannot be started.
    pub fn new() -> Result<Self, BusError> {
        Self::builder().build()
    }

    /// Returns a builder for a customised registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The configuration the registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The interrupt dispatcher. Interrupt sources raise lines through it.
    pub fn irq(&self) -> &Dispatcher {
        &self.rt.dispatcher
    }

    /// The allocator driver data is charged to.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.rt.allocator
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(BusError::ShutDown)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Buses
    // -----------------------------------------------------------------------

    /// Registers a bus.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateIdentity`] if a bus with the same name exists,
    /// [`BusError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn register_bus(&self, bus: impl Bus + 'static) -> Result<BusHandle, BusError> {
        let mut buses = self.buses.write();
        self.ensure_running()?;
        if buses.iter().any(|b| b.name == bus.name()) {
            return Err(BusError::DuplicateIdentity {
                kind: EntityKind::Bus,
                name: bus.name().to_owned(),
            });
        }
        let node = Arc::new(BusNode::new(Box::new(bus)));
        buses.push(Arc::clone(&node));
        info!(target: TARGET, "registered bus '{}'", node.name);
        Ok(BusHandle(node))
    }

    /// Unregisters a bus: its drivers (newest first), then its devices
    /// (newest first). Every binding is removed on the way.
    ///
    /// # Errors
    ///
    /// [`BusError::NotRegistered`] if the bus is already gone.
    pub fn unregister_bus(&self, bus: &BusHandle) -> Result<(), BusError> {
        {
            let mut buses = self.buses.write();
            let before = buses.len();
            buses.retain(|b| !Arc::ptr_eq(b, &bus.0));
            if buses.len() == before {
                return Err(BusError::not_registered(EntityKind::Bus, bus.name()));
            }
        }
        self.teardown_bus(&bus.0);
        Ok(())
    }

    fn teardown_bus(&self, bus: &Arc<BusNode>) {
        let (drivers, devices) = {
            let mut inner = bus.inner.lock();
            if !inner.live {
                return;
            }
            inner.live = false;
            inner.deferred.clear();
            for drv in &inner.drivers {
                drv.registered.store(false, Ordering::Release);
            }
            for dev in &inner.devices {
                dev.registered.store(false, Ordering::Release);
            }
            (mem::take(&mut inner.drivers), mem::take(&mut inner.devices))
        };
        for drv in drivers.iter().rev() {
            let bound: Vec<_> = devices
                .iter()
                .filter(|d| d.is_bound_to(drv))
                .cloned()
                .collect();
            self.detach_driver(drv, &bound);
        }
        for dev in devices.iter().rev() {
            self.detach_device(dev);
        }
        info!(target: TARGET, "unregistered bus '{}'", bus.name);
    }

    // -----------------------------------------------------------------------
    // Devices and drivers
    // -----------------------------------------------------------------------

    /// Registers a device on `bus` and binds it to the first compatible
    /// driver, in driver registration order.
    ///
    /// A failing probe does not fail the registration; it is reported in
    /// the returned [`MatchReport`] and the device stays unbound.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateIdentity`] if the bus already has a device with
    /// this name, [`BusError::MatchError`] if the bus predicate failed (the
    /// device is not registered), [`BusError::NotRegistered`] for a stale
    /// bus handle.
    pub fn register_device(
        &self,
        bus: &BusHandle,
        info: DeviceInfo,
    ) -> Result<Registered<DeviceHandle>, BusError> {
        self.ensure_running()?;
        let node = &bus.0;
        let (device, plan) = {
            let mut inner = node.inner.lock();
            if !inner.live {
                return Err(BusError::not_registered(EntityKind::Bus, &node.name));
            }
            if inner.find_device(&info.name).is_some() {
                return Err(BusError::DuplicateIdentity {
                    kind: EntityKind::Device,
                    name: info.name,
                });
            }
            let device = Arc::new(DeviceNode::new(info, node));
            inner.devices.push(Arc::clone(&device));
            match matcher::plan_for_device(node, &mut inner, &device) {
                Ok(plan) => (device, plan),
                Err(failure) => {
                    inner.devices.pop();
                    device.registered.store(false, Ordering::Release);
                    return Err(failure.into());
                }
            }
        };

        info!(target: TARGET, "{}: registered device '{}'", node.name, device.name());
        self.rt.uevents.emit(UeventAction::Add, &device, None);
        let report = self.run_plan(node, plan);
        Ok(Registered {
            handle: DeviceHandle(device),
            report,
        })
    }

    /// Registers a driver on `bus` and binds it to every compatible unbound
    /// device, in device registration order.
    ///
    /// # Errors
    ///
    /// As for [`register_device`](Self::register_device).
    pub fn register_driver(
        &self,
        bus: &BusHandle,
        driver: impl Driver + 'static,
    ) -> Result<Registered<DriverHandle>, BusError> {
        self.ensure_running()?;
        let node = &bus.0;
        let (driver, plan) = {
            let mut inner = node.inner.lock();
            if !inner.live {
                return Err(BusError::not_registered(EntityKind::Bus, &node.name));
            }
            if inner.find_driver(driver.name()).is_some() {
                return Err(BusError::DuplicateIdentity {
                    kind: EntityKind::Driver,
                    name: driver.name().to_owned(),
                });
            }
            let driver = Arc::new(DriverNode::new(Box::new(driver), node));
            inner.drivers.push(Arc::clone(&driver));
            match matcher::plan_for_driver(node, &mut inner, &driver) {
                Ok(plan) => (driver, plan),
                Err(failure) => {
                    inner.drivers.pop();
                    driver.registered.store(false, Ordering::Release);
                    return Err(failure.into());
                }
            }
        };

        info!(target: TARGET, "{}: registered driver '{}'", node.name, driver.name);
        let report = self.run_plan(node, plan);
        Ok(Registered {
            handle: DriverHandle(driver),
            report,
        })
    }

    /// Unregisters a device, first removing its driver if it has one.
    ///
    /// Blocks until any in-flight probe or remove of the device finishes.
    ///
    /// # Errors
    ///
    /// [`BusError::NotRegistered`] if the device is already gone.
    pub fn unregister_device(&self, device: &DeviceHandle) -> Result<UnbindOutcome, BusError> {
        let node = &device.0;
        let stale = || BusError::not_registered(EntityKind::Device, node.name());
        let bus = node.bus.upgrade().ok_or_else(stale)?;
        {
            let mut inner = bus.inner.lock();
            if !node.registered.swap(false, Ordering::AcqRel) {
                return Err(stale());
            }
            inner.devices.retain(|d| !Arc::ptr_eq(d, node));
            inner.forget_device(node);
        }
        Ok(self.detach_device(node))
    }

    fn detach_device(&self, device: &Arc<DeviceNode>) -> UnbindOutcome {
        let outcome = lifecycle::unbind(&self.rt, device, None)
            .map_or(UnbindOutcome::NotBound, |record| record.outcome);
        info!(target: TARGET, "{}: unregistered device '{}'", device.bus_name, device.name());
        self.rt.uevents.emit(UeventAction::Remove, device, None);
        outcome
    }

    /// Unregisters a driver, first removing it from every device it is
    /// bound to. Those devices stay registered and unbound.
    ///
    /// # Errors
    ///
    /// [`BusError::NotRegistered`] if the driver is already gone.
    pub fn unregister_driver(&self, driver: &DriverHandle) -> Result<Vec<UnbindRecord>, BusError> {
        let node = &driver.0;
        let stale = || BusError::not_registered(EntityKind::Driver, &node.name);
        let bus = node.bus.upgrade().ok_or_else(stale)?;
        let bound: Vec<_> = {
            let mut inner = bus.inner.lock();
            if !node.registered.swap(false, Ordering::AcqRel) {
                return Err(stale());
            }
            inner.drivers.retain(|d| !Arc::ptr_eq(d, node));
            inner.forget_driver(node);
            inner
                .devices
                .iter()
                .filter(|d| d.is_bound_to(node))
                .cloned()
                .collect()
        };
        Ok(self.detach_driver(node, &bound))
    }

    fn detach_driver(&self, driver: &Arc<DriverNode>, bound: &[Arc<DeviceNode>]) -> Vec<UnbindRecord> {
        let records: Vec<_> = bound
            .iter()
            .filter_map(|dev| lifecycle::unbind(&self.rt, dev, Some(driver)))
            .collect();
        info!(
            target: TARGET,
            "unregistered driver '{}' ({} devices released)",
            driver.name,
            records.len()
        );
        records
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Binds `device` to `driver` explicitly.
    ///
    /// The bus predicate must still answer [`MatchResult::Compatible`].
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyBound`] if the device has a driver,
    /// [`BusError::Incompatible`] if the pair is not compatible (or lives on
    /// different buses), [`BusError::MatchError`] if the predicate failed,
    /// [`BusError::ProbeFailed`] if probe failed.
    pub fn bind(&self, device: &DeviceHandle, driver: &DriverHandle) -> Result<MatchReport, BusError> {
        self.ensure_running()?;
        let (dev, drv) = (&device.0, &driver.0);
        let incompatible = || BusError::Incompatible {
            device: dev.name().to_owned(),
            driver: drv.name.clone(),
        };
        let bus = dev
            .bus
            .upgrade()
            .ok_or_else(|| BusError::not_registered(EntityKind::Device, dev.name()))?;
        if !drv.bus.ptr_eq(&dev.bus) {
            return Err(incompatible());
        }

        let reservation = {
            let _decision = bus.inner.lock();
            if !dev.is_registered() {
                return Err(BusError::not_registered(EntityKind::Device, dev.name()));
            }
            if !drv.is_registered() {
                return Err(BusError::not_registered(EntityKind::Driver, &drv.name));
            }
            let already_bound = || BusError::AlreadyBound {
                device: dev.name().to_owned(),
            };
            if dev.life.lock().state != DeviceState::Unbound {
                return Err(already_bound());
            }
            match bus.bus.matches(&dev.info, drv.driver.as_ref()) {
                MatchResult::Compatible => matcher::reserve(dev, drv).ok_or_else(already_bound)?,
                MatchResult::Incompatible | MatchResult::Deferred => return Err(incompatible()),
                MatchResult::Error(cause) => {
                    return Err(BusError::MatchError {
                        device: dev.name().to_owned(),
                        driver: drv.name.clone(),
                        cause,
                    });
                }
            }
        };

        let mut report = MatchReport::default();
        self.probe_all(vec![reservation], &mut report);
        if let Some(err) = report.first_failure() {
            return Err(err);
        }
        self.settle(&bus, &mut report, None);
        Ok(report)
    }

    /// Detaches `device` from its driver, if it has one.
    ///
    /// Concurrent or repeated calls produce exactly one remove; the others
    /// return [`UnbindOutcome::NotBound`]. The device stays registered and
    /// is not re-matched.
    pub fn unbind(&self, device: &DeviceHandle) -> UnbindOutcome {
        lifecycle::unbind(&self.rt, &device.0, None)
            .map_or(UnbindOutcome::NotBound, |record| record.outcome)
    }

    /// Runs deferred passes on `bus` now.
    ///
    /// # Errors
    ///
    /// [`BusError::NotRegistered`] for a stale bus handle.
    pub fn retry_deferred(&self, bus: &BusHandle) -> Result<MatchReport, BusError> {
        self.ensure_running()?;
        if !bus.0.inner.lock().live {
            return Err(BusError::not_registered(EntityKind::Bus, bus.name()));
        }
        let mut report = MatchReport::default();
        self.settle(&bus.0, &mut report, None);
        Ok(report)
    }

    fn run_plan(&self, bus: &BusNode, plan: Plan) -> MatchReport {
        let mut report = MatchReport {
            deferred: plan.deferred,
            ..MatchReport::default()
        };
        self.probe_all(plan.reservations, &mut report);
        self.settle(bus, &mut report, Some(plan.pass));
        report
    }

    /// Probes every reservation in order; returns `true` if any bound.
    ///
    /// Reservations left unprobed by an unwind are released.
    fn probe_all(&self, reservations: Vec<Reservation>, report: &mut MatchReport) -> bool {
        let mut bound_any = false;
        for r in PendingProbes::new(reservations) {
            let device = r.device.name().to_owned();
            let driver = r.driver.name.clone();
            match lifecycle::probe(&self.rt, &r.device, &r.driver) {
                Ok(()) => {
                    bound_any = true;
                    report.bound.push(Pairing { device, driver });
                }
                Err(cause) => report.probe_failures.push(ProbeFailure {
                    device,
                    driver,
                    cause,
                }),
            }
        }
        bound_any
    }

    /// Runs a deferred pass, then keeps going while passes make progress
    /// and `retry_after_bind` is set. Pairs deferred by pass `skip` wait for
    /// a later call.
    fn settle(&self, bus: &BusNode, report: &mut MatchReport, skip: Option<u64>) {
        let policy = &self.config.deferred;
        loop {
            let plan = {
                let mut inner = bus.inner.lock();
                if inner.deferred.is_empty() {
                    return;
                }
                matcher::plan_deferred(bus, &mut inner, policy.max_attempts, skip)
            };
            let mut pass = MatchReport {
                deferred: plan.deferred,
                ..MatchReport::default()
            };
            let progressed = self.probe_all(plan.reservations, &mut pass);
            report.merge(pass);
            if !(policy.retry_after_bind && progressed) {
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Match queries
    // -----------------------------------------------------------------------

    /// Evaluates the bus predicate for `device` against every driver,
    /// without binding. Empty unless the device is unbound.
    ///
    /// # Errors
    ///
    /// [`BusError::NotRegistered`] if the device is gone.
    pub fn find_device_candidates(
        &self,
        device: &DeviceHandle,
    ) -> Result<Vec<(DriverHandle, MatchResult)>, BusError> {
        let dev = &device.0;
        let stale = || BusError::not_registered(EntityKind::Device, dev.name());
        let bus = dev.bus.upgrade().ok_or_else(stale)?;
        let inner = bus.inner.lock();
        if !dev.is_registered() {
            return Err(stale());
        }
        Ok(matcher::device_candidates(&bus, &inner, dev)
            .into_iter()
            .map(|(drv, result)| (DriverHandle(drv), result))
            .collect())
    }

    /// Evaluates the bus predicate for `driver` against every unbound
    /// device, without binding.
    ///
    /// # Errors
    ///
    /// [`BusError::NotRegistered`] if the driver is gone.
    pub fn find_driver_candidates(
        &self,
        driver: &DriverHandle,
    ) -> Result<Vec<(DeviceHandle, MatchResult)>, BusError> {
        let drv = &driver.0;
        let stale = || BusError::not_registered(EntityKind::Driver, &drv.name);
        let bus = drv.bus.upgrade().ok_or_else(stale)?;
        let inner = bus.inner.lock();
        if !drv.is_registered() {
            return Err(stale());
        }
        Ok(matcher::driver_candidates(&bus, &inner, drv)
            .into_iter()
            .map(|(dev, result)| (DeviceHandle(dev), result))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Presentation
    // -----------------------------------------------------------------------

    /// Every registered bus, in registration order.
    pub fn list_buses(&self) -> Vec<BusHandle> {
        self.buses.read().iter().cloned().map(BusHandle).collect()
    }

    /// Looks a bus up by name.
    pub fn find_bus(&self, name: &str) -> Option<BusHandle> {
        self.buses
            .read()
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .map(BusHandle)
    }

    /// Looks a device up by name.
    pub fn find_device(&self, bus: &BusHandle, name: &str) -> Option<DeviceHandle> {
        bus.0.inner.lock().find_device(name).cloned().map(DeviceHandle)
    }

    /// Looks a driver up by name.
    pub fn find_driver(&self, bus: &BusHandle, name: &str) -> Option<DriverHandle> {
        bus.0.inner.lock().find_driver(name).cloned().map(DriverHandle)
    }

    /// Devices on `bus`, in registration order.
    pub fn list_devices(&self, bus: &BusHandle) -> Vec<DeviceHandle> {
        bus.0
            .inner
            .lock()
            .devices
            .iter()
            .cloned()
            .map(DeviceHandle)
            .collect()
    }

    /// Drivers on `bus`, in registration order.
    pub fn list_drivers(&self, bus: &BusHandle) -> Vec<DriverHandle> {
        bus.0
            .inner
            .lock()
            .drivers
            .iter()
            .cloned()
            .map(DriverHandle)
            .collect()
    }

    /// The driver `device` is bound to. `None` unless the device is `Bound`.
    pub fn binding_of(&self, device: &DeviceHandle) -> Option<DriverHandle> {
        let life = device.0.life.lock();
        if life.state == DeviceState::Bound {
            life.driver.clone().map(DriverHandle)
        } else {
            None
        }
    }

    /// Current lifecycle state of `device`.
    pub fn device_state(&self, device: &DeviceHandle) -> DeviceState {
        device.0.life.lock().state
    }

    /// Why the last probe of `device` failed, if it did.
    pub fn last_probe_error(&self, device: &DeviceHandle) -> Option<DriverError> {
        device.0.life.lock().last_probe_error
    }

    /// Runs `f` on the driver data of a bound device, if it is a `T`.
    ///
    /// `f` runs under the device's lock and must not call back into the
    /// registry for the same device.
    pub fn with_drvdata<T: Any, R>(&self, device: &DeviceHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let life = device.0.life.lock();
        life.drvdata
            .as_ref()
            .and_then(|data| data.downcast_ref::<T>())
            .map(f)
    }

    /// Captures `bus` for display or serialization.
    pub fn snapshot(&self, bus: &BusHandle) -> BusSnapshot {
        BusSnapshot::capture(&bus.0)
    }

    /// Subscribes to device events from every bus.
    pub fn subscribe_uevents(&self) -> Receiver<Uevent> {
        self.rt.uevents.subscribe()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Unregisters every bus (newest first) and stops the interrupt
    /// dispatcher. Every bound driver's remove runs. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let buses = mem::take(&mut *self.buses.write());
        for bus in buses.iter().rev() {
            self.teardown_bus(bus);
        }
        self.rt.dispatcher.shutdown();
        info!(target: TARGET, "registry shut down");
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
