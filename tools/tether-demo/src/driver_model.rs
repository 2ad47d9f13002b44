//! `my_bus`, `my_device`, and `my_driver`: the smallest complete binding.

use anyhow::Result;
use log::info;
use tether_bus::{BusHandle, Registry};
use tether_driver_api::{DeviceInfo, Driver, DriverError, FnBus, ProbeContext, RemoveContext};

const TARGET: &str = "tether_demo::driver_model";

struct MyData {
    value: u32,
}

struct MyDriver;

impl Driver for MyDriver {
    fn name(&self) -> &str {
        "my_driver"
    }

    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<(), DriverError> {
        let value = ctx.alloc_drvdata(MyData { value: 99 })?.value;
        info!(target: TARGET, "probe '{}', data = {value}", ctx.device().name);
        Ok(())
    }

    fn remove(&self, ctx: &mut RemoveContext<'_>) -> Result<(), DriverError> {
        let value = ctx.drvdata::<MyData>().map(|d| d.value);
        info!(target: TARGET, "remove '{}', data = {value:?}", ctx.device().name);
        Ok(())
    }
}

/// Registers `my_bus` with its device and driver and returns the bus.
pub fn setup(registry: &Registry) -> Result<BusHandle> {
    let bus = registry.register_bus(
        FnBus::always("my_bus").with_uevent(|_, env| env.add_var("MODALIAS", "MY BUS IS AWESOME")),
    )?;
    registry.register_device(&bus, DeviceInfo::new("my_device"))?;
    let driver = registry.register_driver(&bus, MyDriver)?;
    for pair in &driver.report.bound {
        info!(target: TARGET, "bound {} -> {}", pair.device, pair.driver);
    }
    Ok(bus)
}

/// Binds the pair, prints the bus, tears it down, and prints the uevents.
pub fn run(registry: &Registry) -> Result<()> {
    let events = registry.subscribe_uevents();
    let bus = setup(registry)?;
    println!("{}\n", registry.snapshot(&bus));

    for driver in registry.list_drivers(&bus) {
        for record in registry.unregister_driver(&driver)? {
            if let Some(err) = record.error() {
                return Err(err.into());
            }
        }
    }
    registry.unregister_bus(&bus)?;

    for event in events.try_iter() {
        println!("uevent {} {}", event.action, event.device);
        for (key, value) in event.env.iter() {
            println!("    {key}={value}");
        }
    }
    Ok(())
}
