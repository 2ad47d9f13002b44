//! A platform-bus button whose interrupt counts presses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use log::info;
use tether_bus::{DeviceHandle, Registry};
use tether_driver_api::{
    DeviceInfo, Driver, DriverError, IrqEvent, IrqNumber, IrqReturn, PlatformBus, ProbeContext,
    RemoveContext, TriggerFlags,
};

const TARGET: &str = "tether_demo::button";

/// Line the simulated button is wired to.
const BUTTON_IRQ: IrqNumber = IrqNumber::new(17);

struct ButtonState {
    presses: Arc<AtomicU64>,
}

struct ButtonDriver;

impl Driver for ButtonDriver {
    fn name(&self) -> &str {
        "btn_lkm_irq"
    }

    fn compatible(&self) -> &[&str] {
        &["btn_lkm_irq"]
    }

    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<(), DriverError> {
        let line = ctx.device().irq.ok_or(DriverError::DeviceNotFound)?;
        let presses = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&presses);
        ctx.request_irq(
            line,
            TriggerFlags::RISING | TriggerFlags::FALLING,
            move |event: &IrqEvent| {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                info!(target: TARGET, "press {n}: {:?} edge, event {}", event.edge, event.seq);
                IrqReturn::Handled
            },
        )?;
        ctx.alloc_drvdata(ButtonState { presses })?;
        info!(target: TARGET, "'{}' listening on {line}", ctx.device().name);
        Ok(())
    }

    fn remove(&self, ctx: &mut RemoveContext<'_>) -> Result<(), DriverError> {
        let total = ctx
            .drvdata::<ButtonState>()
            .map_or(0, |s| s.presses.load(Ordering::Relaxed));
        info!(target: TARGET, "'{}' removed after {total} presses", ctx.device().name);
        Ok(())
    }
}

/// Registers the platform bus, the button driver, and `button0`.
pub fn setup(registry: &Registry) -> Result<DeviceHandle> {
    let bus = registry.register_bus(PlatformBus::default())?;
    registry.register_driver(&bus, ButtonDriver)?;
    let device = registry.register_device(
        &bus,
        DeviceInfo::new("button0")
            .with_compatible("btn_lkm_irq")
            .with_irq(BUTTON_IRQ),
    )?;
    if let Some(err) = device.report.first_failure() {
        return Err(err.into());
    }
    Ok(device.into_handle())
}

/// Presses the button `presses` times and prints what the dispatcher saw.
pub fn run(registry: &Registry, presses: u32) -> Result<()> {
    let device = setup(registry)?;

    for i in 0..presses {
        let edge = if i % 2 == 0 {
            TriggerFlags::FALLING
        } else {
            TriggerFlags::RISING
        };
        registry.irq().trigger_edge(BUTTON_IRQ, edge);
    }
    // Level triggers are not part of the claim and get filtered.
    registry.irq().trigger_edge(BUTTON_IRQ, TriggerFlags::HIGH);
    registry.irq().flush();

    let counted = registry
        .with_drvdata(&device, |s: &ButtonState| s.presses.load(Ordering::Relaxed))
        .unwrap_or(0);
    println!("{counted} edges handled on {BUTTON_IRQ}");

    let stats = registry.irq().stats();
    println!(
        "delivered {}, filtered {}, spurious {}, dropped {}",
        stats.delivered, stats.filtered, stats.spurious, stats.dropped
    );
    if let Some(bus) = registry.find_bus("platform") {
        println!("{}", registry.snapshot(&bus));
    }
    Ok(())
}
