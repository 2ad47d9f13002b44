//! Match engine.
//!
//! Every function here runs with the bus lock held, so the decision to pair
//! a device with a driver is atomic with the registration that prompted it.
//! A positive decision *reserves* the device (`Binding`, driver recorded);
//! the probe itself runs later, after the lock is dropped.

use core::mem;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Serialize, Serializer};
use tether_driver_api::{DeviceState, DriverError, MatchResult};

use crate::error::BusError;
use crate::node::{BusInner, BusNode, DeferredPair, DeviceNode, DriverNode};

const TARGET: &str = "tether::match";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A device and driver, by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Pairing {
    /// Device name.
    pub device: String,
    /// Driver name.
    pub driver: String,
}

impl Pairing {
    fn of(device: &DeviceNode, driver: &DriverNode) -> Self {
        Self {
            device: device.name().to_owned(),
            driver: driver.name.clone(),
        }
    }
}

fn serialize_display<S: Serializer>(cause: &DriverError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(cause)
}

/// A probe that failed during a matching pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    /// Device name.
    pub device: String,
    /// Driver name.
    pub driver: String,
    /// What probe returned.
    #[serde(serialize_with = "serialize_display")]
    pub cause: DriverError,
}

impl ProbeFailure {
    /// The failure as a registry error.
    pub fn to_error(&self) -> BusError {
        BusError::ProbeFailed {
            device: self.device.clone(),
            driver: self.driver.clone(),
            cause: self.cause,
        }
    }
}

/// What one matching pass (plus the deferred passes it triggered) did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    /// Pairs whose probe succeeded, in probe order.
    pub bound: Vec<Pairing>,
    /// Pairs whose probe failed; those devices are unbound.
    pub probe_failures: Vec<ProbeFailure>,
    /// Pairs the bus asked to retry later.
    pub deferred: Vec<Pairing>,
}

impl MatchReport {
    /// Returns `true` if the pass did nothing.
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty() && self.probe_failures.is_empty() && self.deferred.is_empty()
    }

    /// Returns `true` if `device` was bound to `driver` by this pass.
    pub fn is_bound(&self, device: &str, driver: &str) -> bool {
        self.bound
            .iter()
            .any(|p| p.device == device && p.driver == driver)
    }

    /// The first probe failure, as a registry error.
    pub fn first_failure(&self) -> Option<BusError> {
        self.probe_failures.first().map(ProbeFailure::to_error)
    }

    pub(crate) fn merge(&mut self, other: MatchReport) {
        self.bound.extend(other.bound);
        self.probe_failures.extend(other.probe_failures);
        for pair in other.deferred {
            if !self.deferred.contains(&pair) {
                self.deferred.push(pair);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// A device reserved for a driver, awaiting probe.
pub(crate) struct Reservation {
    pub(crate) device: Arc<DeviceNode>,
    pub(crate) driver: Arc<DriverNode>,
}

/// Reservations still waiting for their probe.
///
/// Dropping it, unwinding included, puts every unprobed device back to
/// `Unbound`.
pub(crate) struct PendingProbes(std::vec::IntoIter<Reservation>);

impl PendingProbes {
    pub(crate) fn new(reservations: Vec<Reservation>) -> Self {
        Self(reservations.into_iter())
    }
}

impl Iterator for PendingProbes {
    type Item = Reservation;

    fn next(&mut self) -> Option<Reservation> {
        self.0.next()
    }
}

impl Drop for PendingProbes {
    fn drop(&mut self) {
        let rest: Vec<_> = self.0.by_ref().collect();
        release_reservations(&rest);
    }
}

/// Decisions taken under the bus lock.
#[derive(Default)]
pub(crate) struct Plan {
    pub(crate) reservations: Vec<Reservation>,
    pub(crate) deferred: Vec<Pairing>,
    /// Pass that produced the plan; pairs it deferred wait for a later one.
    pub(crate) pass: u64,
}

/// The bus predicate failed for this pair.
pub(crate) struct MatchFailure {
    pub(crate) pairing: Pairing,
    pub(crate) cause: DriverError,
}

impl From<MatchFailure> for BusError {
    fn from(failure: MatchFailure) -> Self {
        Self::MatchError {
            device: failure.pairing.device,
            driver: failure.pairing.driver,
            cause: failure.cause,
        }
    }
}

fn is_unbound(device: &DeviceNode) -> bool {
    device.life.lock().state == DeviceState::Unbound
}

/// Moves `device` to `Binding` for `driver` if it is still unbound.
pub(crate) fn reserve(device: &Arc<DeviceNode>, driver: &Arc<DriverNode>) -> Option<Reservation> {
    let mut life = device.life.lock();
    if life.state != DeviceState::Unbound {
        return None;
    }
    life.state = DeviceState::Binding;
    life.driver = Some(Arc::clone(driver));
    Some(Reservation {
        device: Arc::clone(device),
        driver: Arc::clone(driver),
    })
}

/// Undoes reservations that will not be probed.
pub(crate) fn release_reservations(reservations: &[Reservation]) {
    for r in reservations {
        {
            let mut life = r.device.life.lock();
            life.state = DeviceState::Unbound;
            life.driver = None;
        }
        r.device.changed.notify_all();
    }
}

fn queue_deferred(
    inner: &mut BusInner,
    pass: u64,
    device: &Arc<DeviceNode>,
    driver: &Arc<DriverNode>,
) -> Pairing {
    let queued = inner
        .deferred
        .iter_mut()
        .find(|p| Arc::ptr_eq(&p.device, device) && Arc::ptr_eq(&p.driver, driver));
    match queued {
        Some(pair) => pair.queued_in = pass,
        None => inner.deferred.push_back(DeferredPair {
            device: Arc::clone(device),
            driver: Arc::clone(driver),
            attempts: 0,
            queued_in: pass,
        }),
    }
    Pairing::of(device, driver)
}

/// Evaluates every registered driver against `device`, in registration order.
///
/// Returns nothing if the device is not unbound.
pub(crate) fn device_candidates(
    bus: &BusNode,
    inner: &BusInner,
    device: &DeviceNode,
) -> Vec<(Arc<DriverNode>, MatchResult)> {
    if !is_unbound(device) {
        return Vec::new();
    }
    inner
        .drivers
        .iter()
        .map(|drv| (Arc::clone(drv), bus.bus.matches(&device.info, drv.driver.as_ref())))
        .collect()
}

/// Evaluates every unbound device against `driver`, in registration order.
pub(crate) fn driver_candidates(
    bus: &BusNode,
    inner: &BusInner,
    driver: &DriverNode,
) -> Vec<(Arc<DeviceNode>, MatchResult)> {
    inner
        .devices
        .iter()
        .filter(|dev| is_unbound(dev))
        .map(|dev| (Arc::clone(dev), bus.bus.matches(&dev.info, driver.driver.as_ref())))
        .collect()
}

/// Plans the pass for a newly registered device: the first compatible
/// driver wins.
pub(crate) fn plan_for_device(
    bus: &BusNode,
    inner: &mut BusInner,
    device: &Arc<DeviceNode>,
) -> Result<Plan, MatchFailure> {
    let mut plan = Plan {
        pass: inner.next_pass(),
        ..Plan::default()
    };
    let mut deferred = Vec::new();
    for (driver, result) in device_candidates(bus, inner, device) {
        match result {
            MatchResult::Incompatible => {}
            MatchResult::Compatible => {
                plan.reservations.extend(reserve(device, &driver));
                break;
            }
            MatchResult::Deferred => deferred.push(driver),
            MatchResult::Error(cause) => {
                release_reservations(&plan.reservations);
                return Err(MatchFailure {
                    pairing: Pairing::of(device, &driver),
                    cause,
                });
            }
        }
    }
    for driver in deferred {
        plan.deferred.push(queue_deferred(inner, plan.pass, device, &driver));
    }
    Ok(plan)
}

/// Plans the pass for a newly registered driver: every compatible unbound
/// device is reserved, in registration order.
pub(crate) fn plan_for_driver(
    bus: &BusNode,
    inner: &mut BusInner,
    driver: &Arc<DriverNode>,
) -> Result<Plan, MatchFailure> {
    let mut plan = Plan {
        pass: inner.next_pass(),
        ..Plan::default()
    };
    let mut deferred = Vec::new();
    for (device, result) in driver_candidates(bus, inner, driver) {
        match result {
            MatchResult::Incompatible => {}
            MatchResult::Compatible => plan.reservations.extend(reserve(&device, driver)),
            MatchResult::Deferred => deferred.push(device),
            MatchResult::Error(cause) => {
                release_reservations(&plan.reservations);
                return Err(MatchFailure {
                    pairing: Pairing::of(&device, driver),
                    cause,
                });
            }
        }
    }
    for device in deferred {
        plan.deferred.push(queue_deferred(inner, plan.pass, &device, driver));
    }
    Ok(plan)
}

/// Re-evaluates the deferred queue once.
///
/// Pairs whose device is bound, or whose device or driver has gone away,
/// are dropped. Pairs caught mid-transition, and pairs deferred by pass
/// `skip`, are requeued untouched.
pub(crate) fn plan_deferred(
    bus: &BusNode,
    inner: &mut BusInner,
    max_attempts: u32,
    skip: Option<u64>,
) -> Plan {
    let mut plan = Plan::default();
    for mut pair in mem::take(&mut inner.deferred) {
        if !pair.device.is_registered() || !pair.driver.is_registered() {
            continue;
        }
        if skip == Some(pair.queued_in) {
            inner.deferred.push_back(pair);
            continue;
        }
        let state = pair.device.life.lock().state;
        match state {
            DeviceState::Bound => continue,
            DeviceState::Binding | DeviceState::Unbinding => {
                inner.deferred.push_back(pair);
                continue;
            }
            DeviceState::Unbound => {}
        }

        pair.attempts += 1;
        let pairing = Pairing::of(&pair.device, &pair.driver);
        match bus.bus.matches(&pair.device.info, pair.driver.driver.as_ref()) {
            MatchResult::Compatible => {
                plan.reservations.extend(reserve(&pair.device, &pair.driver));
            }
            MatchResult::Incompatible => {
                debug!(target: TARGET, "{}: deferred '{}'/'{}' now incompatible", bus.name, pairing.device, pairing.driver);
            }
            MatchResult::Deferred if pair.attempts < max_attempts => {
                plan.deferred.push(pairing);
                inner.deferred.push_back(pair);
            }
            MatchResult::Deferred => {
                warn!(
                    target: TARGET,
                    "{}: giving up on '{}'/'{}' after {} attempts",
                    bus.name, pairing.device, pairing.driver, pair.attempts
                );
            }
            MatchResult::Error(cause) => {
                warn!(
                    target: TARGET,
                    "{}: dropping deferred '{}'/'{}': {cause}",
                    bus.name, pairing.device, pairing.driver
                );
            }
        }
    }
    plan
}
