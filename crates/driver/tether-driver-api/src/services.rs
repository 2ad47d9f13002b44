//! Registry service contracts for drivers.
//!
//! Drivers use [`ProbeServices`] to acquire resources during probe without
//! depending on the registry crate directly. Every resource acquired through
//! it is owned by the device's resource scope.

use std::sync::Arc;

use crate::error::DriverError;
use crate::resource::{IrqError, IrqHandler, LineClaim, TriggerFlags};
use tether_core::id::IrqNumber;

/// Trait providing resource acquisition to a probing driver.
///
/// Implemented by the registry and handed to [`Driver::probe`] through
/// [`ProbeContext`]. Anything acquired here is released in reverse order
/// when the probe fails or the device is later unbound.
///
/// [`Driver::probe`]: crate::Driver::probe
/// [`ProbeContext`]: crate::ProbeContext
pub trait ProbeServices {
    /// Charges `bytes` of driver memory to the device.
    fn allocate(&mut self, bytes: usize) -> Result<(), DriverError>;

    /// Claims an interrupt line for the device being probed.
    fn request_irq(
        &mut self,
        line: IrqNumber,
        flags: TriggerFlags,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<LineClaim, IrqError>;

    /// Registers an arbitrary release action, run when the device's
    /// resources are released.
    fn add_resource(&mut self, label: &str, release: Box<dyn FnOnce() + Send>);
}
