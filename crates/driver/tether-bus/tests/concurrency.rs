//! Registration and unbinding racing from many threads.

mod common;

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use common::{Journal, TestDriver};
use crossbeam_channel::{Receiver, Sender};
use tether_bus::{Registry, UnbindOutcome};
use tether_driver_api::{
    DeviceInfo, DeviceState, Driver, DriverError, FnBus, ProbeContext, RemoveContext,
};

const DEVICES: usize = 16;

#[test]
fn concurrent_registration_binds_each_device_once() {
    let registry = Registry::new().unwrap();
    let journal = Journal::default();
    let bus = registry.register_bus(FnBus::always("B")).unwrap();
    let barrier = Barrier::new(DEVICES + 2);

    thread::scope(|s| {
        for i in 0..DEVICES {
            let (registry, bus, barrier) = (&registry, &bus, &barrier);
            s.spawn(move || {
                barrier.wait();
                registry
                    .register_device(bus, DeviceInfo::new(format!("d{i}")))
                    .unwrap();
            });
        }
        for name in ["A", "B"] {
            let (registry, bus, barrier, journal) = (&registry, &bus, &barrier, &journal);
            s.spawn(move || {
                barrier.wait();
                registry
                    .register_driver(bus, TestDriver::new(name, journal))
                    .unwrap();
            });
        }
    });

    assert_eq!(journal.count("probe"), DEVICES);
    for dev in registry.list_devices(&bus) {
        assert_eq!(registry.device_state(&dev), DeviceState::Bound);
        assert!(registry.binding_of(&dev).is_some());
    }
    let bound: usize = registry
        .snapshot(&bus)
        .drivers
        .iter()
        .map(|d| d.devices.len())
        .sum();
    assert_eq!(bound, DEVICES);
}

#[test]
fn concurrent_unbind_removes_once() {
    let registry = Registry::new().unwrap();
    let journal = Journal::default();
    let bus = registry.register_bus(FnBus::always("B")).unwrap();
    registry
        .register_driver(&bus, TestDriver::new("A", &journal))
        .unwrap();
    let dev = registry
        .register_device(&bus, DeviceInfo::new("d"))
        .unwrap()
        .into_handle();
    let barrier = Barrier::new(8);

    let outcomes: Vec<UnbindOutcome> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    registry.unbind(&dev)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let removed = outcomes
        .iter()
        .filter(|o| **o == UnbindOutcome::Removed)
        .count();
    assert_eq!(removed, 1);
    assert_eq!(journal.count("remove"), 1);
    assert_eq!(registry.device_state(&dev), DeviceState::Unbound);
}

#[test]
fn buses_progress_independently() {
    let registry = Registry::new().unwrap();
    let journal = Journal::default();
    let buses: Vec<_> = (0..4)
        .map(|i| registry.register_bus(FnBus::always(format!("bus{i}"))).unwrap())
        .collect();

    thread::scope(|s| {
        for bus in &buses {
            let (registry, journal) = (&registry, &journal);
            s.spawn(move || {
                registry
                    .register_driver(bus, TestDriver::new("A", journal))
                    .unwrap();
                for i in 0..4 {
                    registry
                        .register_device(bus, DeviceInfo::new(format!("d{i}")))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(journal.count("probe"), 16);
}

/// Probe blocks until the test lets it go.
struct Gate {
    started: Sender<()>,
    release: Receiver<()>,
    journal: Journal,
}

impl Driver for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<(), DriverError> {
        self.journal.push(format!("probe {}", ctx.device().name));
        self.started.send(()).map_err(|_| DriverError::IoError)?;
        self.release.recv().map_err(|_| DriverError::IoError)?;
        Ok(())
    }

    fn remove(&self, ctx: &mut RemoveContext<'_>) -> Result<(), DriverError> {
        self.journal.push(format!("remove {}", ctx.device().name));
        Ok(())
    }
}

#[test]
fn unregister_waits_for_in_flight_probe() {
    let registry = Registry::new().unwrap();
    let journal = Journal::default();
    let bus = registry.register_bus(FnBus::always("B")).unwrap();
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    registry
        .register_driver(
            &bus,
            Gate {
                started: started_tx,
                release: release_rx,
                journal: journal.clone(),
            },
        )
        .unwrap();

    let registry = &registry;
    let bus = &bus;
    thread::scope(|s| {
        let registering = s.spawn(move || {
            registry
                .register_device(bus, DeviceInfo::new("d"))
                .unwrap()
                .into_handle()
        });
        started_rx.recv().unwrap();

        let dev = registry.find_device(bus, "d").unwrap();
        assert_eq!(registry.device_state(&dev), DeviceState::Binding);
        let unregistering = s.spawn(move || registry.unregister_device(&dev));

        thread::sleep(Duration::from_millis(50));
        assert!(!unregistering.is_finished());
        release_tx.send(()).unwrap();

        assert_eq!(unregistering.join().unwrap().unwrap(), UnbindOutcome::Removed);
        let dev = registering.join().unwrap();
        assert!(!dev.is_registered());
        assert_eq!(registry.device_state(&dev), DeviceState::Unbound);
    });

    assert_eq!(journal.entries(), ["probe d", "remove d"]);
}

#[test]
fn unregister_driver_waits_for_in_flight_probe() {
    let registry = Registry::new().unwrap();
    let journal = Journal::default();
    let bus = registry.register_bus(FnBus::always("B")).unwrap();
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let gate = registry
        .register_driver(
            &bus,
            Gate {
                started: started_tx,
                release: release_rx,
                journal: journal.clone(),
            },
        )
        .unwrap()
        .into_handle();

    let registry = &registry;
    let bus = &bus;
    thread::scope(|s| {
        let registering = s.spawn(move || {
            registry
                .register_device(bus, DeviceInfo::new("d"))
                .unwrap()
                .into_handle()
        });
        started_rx.recv().unwrap();

        let dev = registry.find_device(bus, "d").unwrap();
        assert_eq!(registry.device_state(&dev), DeviceState::Binding);
        let unregistering = s.spawn(|| registry.unregister_driver(&gate));

        thread::sleep(Duration::from_millis(50));
        assert!(!unregistering.is_finished());
        release_tx.send(()).unwrap();

        let records = unregistering.join().unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device, "d");
        assert_eq!(records[0].outcome, UnbindOutcome::Removed);
        let dev = registering.join().unwrap();
        assert!(dev.is_registered());
        assert_eq!(registry.device_state(&dev), DeviceState::Unbound);
        assert!(registry.binding_of(&dev).is_none());
    });

    assert_eq!(journal.entries(), ["probe d", "remove d"]);
    assert!(registry.list_drivers(bus).is_empty());
}
