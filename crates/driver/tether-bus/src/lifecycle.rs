//! Lifecycle manager: drives a device through
//! `Unbound -> Binding -> Bound -> Unbinding -> Unbound`.
//!
//! Both transitions run with no bus lock held. A device in a transitional
//! state is owned by exactly one thread; everyone else waits on the
//! device's condvar until it settles.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tether_driver_api::{DeviceState, DriverError, ProbeContext, RemoveContext, UeventAction};

use crate::error::BusError;
use crate::irq::Dispatcher;
use crate::node::{DeviceNode, DriverNode};
use crate::platform::Allocator;
use crate::scope::{CommittedScope, ResourceScope};
use crate::services::ScopeServices;
use crate::sysfs::UeventHub;

const TARGET: &str = "tether::lifecycle";

/// Collaborators every transition needs.
pub(crate) struct Runtime {
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) uevents: UeventHub,
}

/// Result of detaching a device from its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    /// The device had no driver; nothing was done.
    NotBound,
    /// The driver's remove ran and succeeded.
    Removed,
    /// The driver's remove failed. The device is unbound regardless.
    RemoveFailed(DriverError),
}

impl UnbindOutcome {
    /// Returns `true` if a remove actually ran.
    pub const fn was_bound(self) -> bool {
        !matches!(self, Self::NotBound)
    }
}

/// One completed unbind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbindRecord {
    /// Device name.
    pub device: String,
    /// Name of the driver that was detached.
    pub driver: String,
    /// How the remove went.
    pub outcome: UnbindOutcome,
}

impl UnbindRecord {
    /// The remove failure as a registry error, if there was one.
    pub fn error(&self) -> Option<BusError> {
        match self.outcome {
            UnbindOutcome::RemoveFailed(cause) => Some(BusError::RemoveFailed {
                device: self.device.clone(),
                driver: self.driver.clone(),
                cause,
            }),
            _ => None,
        }
    }
}

/// Puts a device back to `Unbound` if a driver callback unwinds mid-transition.
struct TransitionGuard<'a> {
    device: &'a DeviceNode,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(device: &'a DeviceNode) -> Self {
        Self {
            device,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut life = self.device.life.lock();
            error!(
                target: TARGET,
                "'{}': callback unwound while {}, forcing unbound",
                self.device.name(),
                life.state
            );
            life.state = DeviceState::Unbound;
            life.driver = None;
            life.drvdata = None;
        }
        self.device.changed.notify_all();
    }
}

/// Runs a driver callback, turning a panic into [`DriverError::Panicked`].
fn contain<F>(
    device: &DeviceNode,
    driver: &DriverNode,
    what: &str,
    callback: F,
) -> Result<(), DriverError>
where
    F: FnOnce() -> Result<(), DriverError>,
{
    panic::catch_unwind(AssertUnwindSafe(callback)).unwrap_or_else(|_| {
        error!(
            target: TARGET,
            "{what} of '{}' by '{}' panicked",
            device.name(),
            driver.name
        );
        Err(DriverError::Panicked)
    })
}

/// Runs `driver`'s probe on a device already reserved for it.
///
/// On failure (a panic included) every resource the probe acquired has been
/// released and the device is `Unbound` again when this returns.
pub(crate) fn probe(
    rt: &Runtime,
    device: &Arc<DeviceNode>,
    driver: &Arc<DriverNode>,
) -> Result<(), DriverError> {
    let mut guard = TransitionGuard::new(device);
    let mut scope = ResourceScope::new(device.name());
    debug!(target: TARGET, "probing '{}' with '{}'", device.name(), driver.name);

    let (result, drvdata) = {
        let mut services = ScopeServices::new(&mut scope, &rt.allocator, &rt.dispatcher);
        let mut ctx = ProbeContext::new(&device.info, &mut services);
        let result = contain(device, driver, "probe", || driver.driver.probe(&mut ctx));
        (result, ctx.into_drvdata())
    };

    match result {
        Ok(()) => {
            let committed = scope.commit();
            let resources = committed.len();
            {
                let mut life = device.life.lock();
                life.state = DeviceState::Bound;
                life.drvdata = drvdata;
                life.scope = Some(committed);
                life.last_probe_error = None;
            }
            guard.disarm();
            device.changed.notify_all();
            info!(
                target: TARGET,
                "'{}' bound to '{}' ({resources} resources)",
                device.name(),
                driver.name
            );
            rt.uevents.emit(UeventAction::Bind, device, Some(driver.name.as_str()));
            Ok(())
        }
        Err(cause) => {
            drop(drvdata);
            let released = scope.unwind();
            {
                let mut life = device.life.lock();
                life.state = DeviceState::Unbound;
                life.driver = None;
                life.last_probe_error = Some(cause);
            }
            guard.disarm();
            device.changed.notify_all();
            warn!(
                target: TARGET,
                "probe of '{}' by '{}' failed: {cause} ({released} resources released)",
                device.name(),
                driver.name
            );
            Err(cause)
        }
    }
}

/// Detaches `device` from its driver, waiting out any in-flight transition.
///
/// With `expected` set, only a binding to that driver is undone. Returns
/// `None` if there was nothing to undo. Concurrent callers for one device
/// produce exactly one remove; the others observe `Unbound`.
pub(crate) fn unbind(
    rt: &Runtime,
    device: &Arc<DeviceNode>,
    expected: Option<&Arc<DriverNode>>,
) -> Option<UnbindRecord> {
    let mut life = device.settled();
    let driver = life.driver.clone()?;
    if expected.is_some_and(|exp| !Arc::ptr_eq(exp, &driver)) {
        return None;
    }
    life.state = DeviceState::Unbinding;
    let drvdata = life.drvdata.take();
    let scope = life.scope.take();
    drop(life);

    let mut guard = TransitionGuard::new(device);
    debug!(target: TARGET, "removing '{}' from '{}'", device.name(), driver.name);
    let result = {
        let mut ctx = RemoveContext::new(&device.info, drvdata);
        contain(device, &driver, "remove", || driver.driver.remove(&mut ctx))
    };
    let released = scope.map_or(0, CommittedScope::release);
    {
        let mut life = device.life.lock();
        life.state = DeviceState::Unbound;
        life.driver = None;
    }
    guard.disarm();
    device.changed.notify_all();

    let outcome = match result {
        Ok(()) => {
            info!(
                target: TARGET,
                "'{}' unbound from '{}' ({released} resources released)",
                device.name(),
                driver.name
            );
            UnbindOutcome::Removed
        }
        Err(cause) => {
            warn!(
                target: TARGET,
                "remove of '{}' by '{}' failed: {cause}; unbound anyway",
                device.name(),
                driver.name
            );
            UnbindOutcome::RemoveFailed(cause)
        }
    };
    rt.uevents.emit(UeventAction::Unbind, device, Some(driver.name.as_str()));
    Some(UnbindRecord {
        device: device.name().to_owned(),
        driver: driver.name.clone(),
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_helpers() {
        assert!(!UnbindOutcome::NotBound.was_bound());
        assert!(UnbindOutcome::RemoveFailed(DriverError::IoError).was_bound());

        let record = UnbindRecord {
            device: "d".into(),
            driver: "a".into(),
            outcome: UnbindOutcome::RemoveFailed(DriverError::IoError),
        };
        assert!(matches!(
            record.error(),
            Some(BusError::RemoveFailed { cause: DriverError::IoError, .. })
        ));
        let clean = UnbindRecord {
            outcome: UnbindOutcome::Removed,
            ..record
        };
        assert!(clean.error().is_none());
    }
}
