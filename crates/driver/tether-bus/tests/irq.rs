//! Interrupt lines claimed by drivers through their probe context.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tether_bus::Registry;
use tether_driver_api::{
    DeviceInfo, Driver, DriverError, IrqError, IrqEvent, IrqNumber, IrqReturn, PlatformBus,
    ProbeContext, TriggerFlags,
};

/// Claims the device's line and counts deliveries.
struct Button {
    name: &'static str,
    presses: Arc<AtomicUsize>,
    fail_after_claim: bool,
}

impl Button {
    fn new(name: &'static str) -> (Self, Arc<AtomicUsize>) {
        let presses = Arc::new(AtomicUsize::new(0));
        let button = Self {
            name,
            presses: Arc::clone(&presses),
            fail_after_claim: false,
        };
        (button, presses)
    }
}

impl Driver for Button {
    fn name(&self) -> &str {
        self.name
    }

    fn compatible(&self) -> &[&str] {
        &["btn_lkm_irq"]
    }

    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<(), DriverError> {
        let line = ctx.device().irq.ok_or(DriverError::DeviceNotFound)?;
        let presses = Arc::clone(&self.presses);
        ctx.request_irq(line, TriggerFlags::BOTH_EDGES, move |_: &IrqEvent| {
            presses.fetch_add(1, Ordering::SeqCst);
            IrqReturn::Handled
        })?;
        if self.fail_after_claim {
            return Err(DriverError::InitFailed);
        }
        Ok(())
    }
}

fn button_device(name: &str, line: u32) -> DeviceInfo {
    DeviceInfo::new(name)
        .with_compatible("btn_lkm_irq")
        .with_irq(IrqNumber::new(line))
}

#[test]
fn unbind_releases_the_line_for_the_next_driver() {
    let registry = Registry::new().unwrap();
    let line = IrqNumber::new(5);
    let bus = registry.register_bus(PlatformBus::default()).unwrap();
    let (first, first_presses) = Button::new("btn-a");
    let first = registry.register_driver(&bus, first).unwrap().into_handle();
    let dev = registry
        .register_device(&bus, button_device("button0", 5))
        .unwrap();
    assert!(dev.report.is_bound("button0", "btn-a"));
    assert!(registry.irq().is_claimed(line));
    assert_eq!(registry.irq().stats().line(line).unwrap().owner, "button0");

    registry.irq().trigger(line);
    registry.irq().flush();
    assert_eq!(first_presses.load(Ordering::SeqCst), 1);

    registry.unregister_driver(&first).unwrap();
    assert!(!registry.irq().is_claimed(line));

    let (second, second_presses) = Button::new("btn-b");
    let second = registry.register_driver(&bus, second).unwrap();
    assert!(second.report.is_bound("button0", "btn-b"));
    assert!(registry.irq().is_claimed(line));

    registry.irq().trigger_edge(line, TriggerFlags::FALLING);
    registry.irq().flush();
    assert_eq!(first_presses.load(Ordering::SeqCst), 1);
    assert_eq!(second_presses.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_probe_gives_the_line_back() {
    let registry = Registry::new().unwrap();
    let bus = registry.register_bus(PlatformBus::default()).unwrap();
    let (mut button, _) = Button::new("btn");
    button.fail_after_claim = true;
    registry.register_driver(&bus, button).unwrap();

    let dev = registry
        .register_device(&bus, button_device("button0", 9))
        .unwrap();
    assert_eq!(dev.report.probe_failures[0].cause, DriverError::InitFailed);
    assert!(!registry.irq().is_claimed(IrqNumber::new(9)));
    assert!(registry.irq().stats().lines.is_empty());
}

#[test]
fn shared_line_conflict_fails_the_second_probe() {
    let registry = Registry::new().unwrap();
    let bus = registry.register_bus(PlatformBus::default()).unwrap();
    let (button, presses) = Button::new("btn");
    registry.register_driver(&bus, button).unwrap();

    registry
        .register_device(&bus, button_device("button0", 3))
        .unwrap();
    let clash = registry
        .register_device(&bus, button_device("button1", 3))
        .unwrap();
    assert_eq!(
        clash.report.probe_failures[0].cause,
        DriverError::Irq(IrqError::AlreadyClaimed(IrqNumber::new(3)))
    );

    // The first claim is untouched.
    registry.irq().trigger(IrqNumber::new(3));
    registry.irq().flush();
    assert_eq!(presses.load(Ordering::SeqCst), 1);
    assert_eq!(registry.irq().stats().line(IrqNumber::new(3)).unwrap().owner, "button0");
}

#[test]
fn out_of_range_line_fails_probe() {
    let registry = Registry::new().unwrap();
    let bus = registry.register_bus(PlatformBus::default()).unwrap();
    let (button, _) = Button::new("btn");
    registry.register_driver(&bus, button).unwrap();

    let max = registry.irq().max_lines();
    let dev = registry
        .register_device(&bus, button_device("button0", max))
        .unwrap();
    assert_eq!(
        dev.report.probe_failures[0].cause,
        DriverError::Irq(IrqError::InvalidLine(IrqNumber::new(max)))
    );
}

#[test]
fn unclaimed_trigger_is_spurious() {
    let registry = Registry::new().unwrap();
    registry.irq().trigger(IrqNumber::new(40));
    registry.irq().flush();
    let stats = registry.irq().stats();
    assert_eq!(stats.spurious, 1);
    assert_eq!(stats.delivered, 0);
}
