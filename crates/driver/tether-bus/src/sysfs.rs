//! Read-only presentation: bus snapshots and device events.
//!
//! A [`BusSnapshot`] renders like the `/sys/bus/<name>` tree (via
//! `Display`) and serializes with serde. [`Uevent`]s are pushed to every
//! receiver obtained from [`Registry::subscribe_uevents`].
//!
//! [`Registry::subscribe_uevents`]: crate::Registry::subscribe_uevents

use core::fmt;

use crossbeam_channel::{Receiver, Sender};
use log::{trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tether_driver_api::{DeviceState, DriverError, IrqNumber, UeventAction, UeventEnv};

use crate::node::{BusNode, DeviceNode};

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One device as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    /// Device name.
    pub name: String,
    /// Lifecycle state.
    pub state: DeviceState,
    /// Bound (or binding) driver.
    pub driver: Option<String>,
    /// Compatible strings from the descriptor.
    pub compatible: Vec<String>,
    /// Interrupt line from the descriptor.
    pub irq: Option<IrqNumber>,
    /// Resources held by the active binding.
    pub resources: usize,
    /// Most recent probe failure, if the last probe failed.
    pub last_probe_error: Option<String>,
}

/// One driver as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverSnapshot {
    /// Driver name.
    pub name: String,
    /// Compatible strings the driver claims.
    pub compatible: Vec<String>,
    /// Devices currently bound to it.
    pub devices: Vec<String>,
}

/// A bus and everything registered on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusSnapshot {
    /// Bus name.
    pub name: String,
    /// Devices, in registration order.
    pub devices: Vec<DeviceSnapshot>,
    /// Drivers, in registration order.
    pub drivers: Vec<DriverSnapshot>,
    /// Pairs waiting in the deferred queue.
    pub deferred: usize,
}

impl BusSnapshot {
    pub(crate) fn capture(bus: &BusNode) -> Self {
        let inner = bus.inner.lock();
        let devices: Vec<DeviceSnapshot> = inner
            .devices
            .iter()
            .map(|dev| {
                let life = dev.life.lock();
                DeviceSnapshot {
                    name: dev.info.name.clone(),
                    state: life.state,
                    driver: life.driver.as_ref().map(|d| d.name.clone()),
                    compatible: dev.info.compatible.clone(),
                    irq: dev.info.irq,
                    resources: life.scope.as_ref().map_or(0, |s| s.len()),
                    last_probe_error: life.last_probe_error.map(|e| e.to_string()),
                }
            })
            .collect();
        let drivers = inner
            .drivers
            .iter()
            .map(|drv| DriverSnapshot {
                name: drv.name.clone(),
                compatible: drv
                    .driver
                    .compatible()
                    .iter()
                    .map(|c| (*c).to_owned())
                    .collect(),
                devices: devices
                    .iter()
                    .filter(|d| {
                        d.state == DeviceState::Bound && d.driver.as_deref() == Some(drv.name.as_str())
                    })
                    .map(|d| d.name.clone())
                    .collect(),
            })
            .collect();
        Self {
            name: bus.name.clone(),
            devices,
            drivers,
            deferred: inner.deferred.len(),
        }
    }

    /// Looks a device up by name.
    pub fn device(&self, name: &str) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Looks a driver up by name.
    pub fn driver(&self, name: &str) -> Option<&DriverSnapshot> {
        self.drivers.iter().find(|d| d.name == name)
    }
}

fn branch(last: bool) -> &'static str {
    if last { "└── " } else { "├── " }
}

fn stem(last: bool) -> &'static str {
    if last { "    " } else { "│   " }
}

impl fmt::Display for BusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "/sys/bus/{}/", self.name)?;

        writeln!(f, "├── devices/")?;
        for (i, dev) in self.devices.iter().enumerate() {
            let last = i + 1 == self.devices.len();
            write!(f, "│   {}{} [{}]", branch(last), dev.name, dev.state)?;
            if let Some(driver) = &dev.driver {
                write!(f, " -> ../drivers/{driver}")?;
            }
            if let Some(err) = &dev.last_probe_error {
                write!(f, " (probe failed: {err})")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "├── drivers/")?;
        for (i, drv) in self.drivers.iter().enumerate() {
            let last = i + 1 == self.drivers.len();
            writeln!(f, "│   {}{}/", branch(last), drv.name)?;
            for (j, dev) in drv.devices.iter().enumerate() {
                let dev_last = j + 1 == drv.devices.len();
                writeln!(
                    f,
                    "│   {}{}{dev} -> ../../devices/{dev}",
                    stem(last),
                    branch(dev_last)
                )?;
            }
        }

        write!(f, "└── drivers_deferred: {}", self.deferred)
    }
}

// ---------------------------------------------------------------------------
// Uevents
// ---------------------------------------------------------------------------

/// A device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    /// What happened.
    pub action: UeventAction,
    /// Device it happened to.
    pub device: String,
    /// `KEY=VALUE` environment, standard keys first.
    pub env: UeventEnv,
}

fn standard_vars(
    env: &mut UeventEnv,
    action: UeventAction,
    device: &DeviceNode,
    driver: Option<&str>,
) -> Result<(), DriverError> {
    env.add_var("ACTION", action)?;
    env.add_var("SUBSYSTEM", &device.bus_name)?;
    env.add_var("DEVNAME", device.name())?;
    if let Some(driver) = driver {
        env.add_var("DRIVER", driver)?;
    }
    Ok(())
}

/// Fan-out of device events to subscribers.
#[derive(Default)]
pub(crate) struct UeventHub {
    subscribers: Mutex<Vec<Sender<Uevent>>>,
}

impl UeventHub {
    pub(crate) fn subscribe(&self) -> Receiver<Uevent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Builds and delivers one event. Subscribers that hung up are dropped.
    pub(crate) fn emit(&self, action: UeventAction, device: &DeviceNode, driver: Option<&str>) {
        if self.subscribers.lock().is_empty() {
            return;
        }

        let mut env = UeventEnv::new();
        let built = standard_vars(&mut env, action, device, driver).and_then(|()| {
            match device.bus.upgrade() {
                Some(bus) => bus.bus.uevent(&device.info, &mut env),
                None => Ok(()),
            }
        });
        if let Err(cause) = built {
            warn!(
                target: "tether::uevent",
                "{action} event for '{}' suppressed: {cause}",
                device.name()
            );
            return;
        }

        trace!(target: "tether::uevent", "{action} '{}'", device.name());
        let event = Uevent {
            action,
            device: device.name().to_owned(),
            env,
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BusSnapshot {
        BusSnapshot {
            name: "my_bus".into(),
            devices: vec![
                DeviceSnapshot {
                    name: "my_device".into(),
                    state: DeviceState::Bound,
                    driver: Some("my_driver".into()),
                    compatible: Vec::new(),
                    irq: None,
                    resources: 1,
                    last_probe_error: None,
                },
                DeviceSnapshot {
                    name: "spare".into(),
                    state: DeviceState::Unbound,
                    driver: None,
                    compatible: Vec::new(),
                    irq: None,
                    resources: 0,
                    last_probe_error: Some("out of memory".into()),
                },
            ],
            drivers: vec![DriverSnapshot {
                name: "my_driver".into(),
                compatible: Vec::new(),
                devices: vec!["my_device".into()],
            }],
            deferred: 0,
        }
    }

    #[test]
    fn renders_sysfs_tree() {
        let text = sample().to_string();
        let expected = "\
/sys/bus/my_bus/
├── devices/
│   ├── my_device [bound] -> ../drivers/my_driver
│   └── spare [unbound] (probe failed: out of memory)
├── drivers/
│   └── my_driver/
│       └── my_device -> ../../devices/my_device
└── drivers_deferred: 0";
        assert_eq!(text, expected);
    }

    #[test]
    fn lookups_and_json() {
        let snap = sample();
        assert_eq!(snap.device("spare").map(|d| d.state), Some(DeviceState::Unbound));
        assert!(snap.driver("nope").is_none());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["devices"][0]["state"], "bound");
        assert_eq!(json["drivers"][0]["devices"][0], "my_device");
    }
}
