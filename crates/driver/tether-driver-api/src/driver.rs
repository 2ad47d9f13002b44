//! Driver trait, per-device state machine, and callback contexts.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use tether_core::id::IrqNumber;

use crate::device::DeviceInfo;
use crate::error::DriverError;
use crate::resource::{IrqHandler, LineClaim, TriggerFlags};
use crate::services::ProbeServices;

/// Per-device driver data, installed on a successful probe.
pub type DrvData = Box<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// A driver: a named set of callbacks that take ownership of matching devices.
///
/// `probe` and `remove` run on the thread that triggered the bind or unbind,
/// never while a registry lock is held.
pub trait Driver: Send + Sync {
    /// Name, unique within the driver's bus.
    fn name(&self) -> &str;

    /// Compatible strings this driver claims.
    fn compatible(&self) -> &[&str] {
        &[]
    }

    /// Takes ownership of a device.
    ///
    /// Resources acquired through `ctx` are released automatically if this
    /// returns an error.
    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<(), DriverError>;

    /// Relinquishes a device. Resources acquired during probe are released
    /// after this returns, whatever it returns.
    fn remove(&self, ctx: &mut RemoveContext<'_>) -> Result<(), DriverError> {
        let _ = ctx;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

/// Binding state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// No driver; eligible for matching.
    #[default]
    Unbound,
    /// Reserved by a driver whose probe has not finished.
    Binding,
    /// Owned by a driver.
    Bound,
    /// The driver's remove is in progress.
    Unbinding,
}

impl DeviceState {
    /// Returns `true` while a probe or remove is in flight.
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Binding | Self::Unbinding)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unbound => "unbound",
            Self::Binding => "binding",
            Self::Bound => "bound",
            Self::Unbinding => "unbinding",
        })
    }
}

// ---------------------------------------------------------------------------
// ProbeContext
// ---------------------------------------------------------------------------

/// Everything a driver's probe can see and acquire.
pub struct ProbeContext<'a> {
    device: &'a DeviceInfo,
    services: &'a mut dyn ProbeServices,
    drvdata: Option<DrvData>,
}

impl<'a> ProbeContext<'a> {
    /// Creates a context over `device`, acquiring resources through `services`.
    pub fn new(device: &'a DeviceInfo, services: &'a mut dyn ProbeServices) -> Self {
        Self {
            device,
            services,
            drvdata: None,
        }
    }

    /// The device being probed.
    pub fn device(&self) -> &DeviceInfo {
        self.device
    }

    /// Allocates driver data and attaches it to the device.
    ///
    /// The allocation is charged to the device's resource scope, so it is
    /// returned automatically on probe failure or unbind. Every call adds a
    /// charge: calling it again drops the data attached earlier, but that
    /// earlier charge stays in the scope until the device is released.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OutOfMemory`] if the allocator refuses.
    pub fn alloc_drvdata<T: Any + Send + Sync>(&mut self, value: T) -> Result<&mut T, DriverError> {
        self.services
            .allocate(core::mem::size_of::<T>().max(1))?;
        let slot = self.drvdata.insert(Box::new(value));
        slot.downcast_mut::<T>().ok_or(DriverError::InvalidState)
    }

    /// Borrows the driver data attached so far, if it is a `T`.
    pub fn drvdata<T: Any>(&self) -> Option<&T> {
        self.drvdata.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Mutably borrows the driver data attached so far, if it is a `T`.
    pub fn drvdata_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.drvdata.as_mut().and_then(|d| d.downcast_mut::<T>())
    }

    /// Claims `line` for this device, delivering matching events to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Irq`] if the line is out of range or already
    /// claimed.
    pub fn request_irq(
        &mut self,
        line: IrqNumber,
        flags: TriggerFlags,
        handler: impl IrqHandler + 'static,
    ) -> Result<LineClaim, DriverError> {
        let handler: Arc<dyn IrqHandler> = Arc::new(handler);
        Ok(self.services.request_irq(line, flags, handler)?)
    }

    /// Registers a custom release action owned by the device.
    pub fn add_resource(&mut self, label: &str, release: impl FnOnce() + Send + 'static) {
        self.services.add_resource(label, Box::new(release));
    }

    /// Consumes the context, yielding the attached driver data.
    pub fn into_drvdata(self) -> Option<DrvData> {
        self.drvdata
    }
}

// ---------------------------------------------------------------------------
// RemoveContext
// ---------------------------------------------------------------------------

/// What a driver's remove can see.
pub struct RemoveContext<'a> {
    device: &'a DeviceInfo,
    drvdata: Option<DrvData>,
}

impl<'a> RemoveContext<'a> {
    /// Creates a context over `device` holding its driver data.
    pub fn new(device: &'a DeviceInfo, drvdata: Option<DrvData>) -> Self {
        Self { device, drvdata }
    }

    /// The device being removed.
    pub fn device(&self) -> &DeviceInfo {
        self.device
    }

    /// Borrows the driver data installed at probe time, if it is a `T`.
    pub fn drvdata<T: Any>(&self) -> Option<&T> {
        self.drvdata.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Takes ownership of the driver data, if it is a `T`.
    ///
    /// Data of another type is left in place.
    pub fn take_drvdata<T: Any>(&mut self) -> Option<Box<T>> {
        match self.drvdata.take()?.downcast::<T>() {
            Ok(data) => Some(data),
            Err(other) => {
                self.drvdata = Some(other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::IrqError;

    #[derive(Default)]
    struct RecordingServices {
        allocated: usize,
        refuse_alloc: bool,
        claims: Vec<IrqNumber>,
        labels: Vec<String>,
    }

    impl ProbeServices for RecordingServices {
        fn allocate(&mut self, bytes: usize) -> Result<(), DriverError> {
            if self.refuse_alloc {
                return Err(DriverError::OutOfMemory);
            }
            self.allocated += bytes;
            Ok(())
        }

        fn request_irq(
            &mut self,
            line: IrqNumber,
            flags: TriggerFlags,
            _handler: Arc<dyn IrqHandler>,
        ) -> Result<LineClaim, IrqError> {
            if self.claims.contains(&line) {
                return Err(IrqError::AlreadyClaimed(line));
            }
            self.claims.push(line);
            Ok(LineClaim { line, flags })
        }

        fn add_resource(&mut self, label: &str, release: Box<dyn FnOnce() + Send>) {
            self.labels.push(label.to_owned());
            drop(release);
        }
    }

    struct Data {
        number: u32,
    }

    #[test]
    fn alloc_drvdata_charges_services() {
        let info = DeviceInfo::new("dev");
        let mut services = RecordingServices::default();
        let mut ctx = ProbeContext::new(&info, &mut services);
        let data = ctx.alloc_drvdata(Data { number: 99 }).unwrap();
        data.number += 1;
        assert_eq!(ctx.drvdata::<Data>().map(|d| d.number), Some(100));
        assert!(ctx.drvdata::<u8>().is_none());
        assert!(ctx.into_drvdata().is_some());
        assert_eq!(services.allocated, core::mem::size_of::<Data>());
    }

    #[test]
    fn second_alloc_drvdata_adds_a_charge() {
        let info = DeviceInfo::new("dev");
        let mut services = RecordingServices::default();
        let mut ctx = ProbeContext::new(&info, &mut services);
        ctx.alloc_drvdata(Data { number: 1 }).unwrap();
        ctx.alloc_drvdata(7_u64).unwrap();
        assert!(ctx.drvdata::<Data>().is_none());
        assert_eq!(ctx.drvdata::<u64>(), Some(&7));
        drop(ctx);
        assert_eq!(
            services.allocated,
            core::mem::size_of::<Data>() + core::mem::size_of::<u64>()
        );
    }

    #[test]
    fn alloc_drvdata_failure_attaches_nothing() {
        let info = DeviceInfo::new("dev");
        let mut services = RecordingServices {
            refuse_alloc: true,
            ..RecordingServices::default()
        };
        let mut ctx = ProbeContext::new(&info, &mut services);
        assert_eq!(
            ctx.alloc_drvdata(Data { number: 1 }).err(),
            Some(DriverError::OutOfMemory)
        );
        assert!(ctx.into_drvdata().is_none());
    }

    #[test]
    fn request_irq_maps_claim_errors() {
        let info = DeviceInfo::new("dev");
        let mut services = RecordingServices::default();
        let mut ctx = ProbeContext::new(&info, &mut services);
        let line = IrqNumber::new(5);
        let noop = |_: &crate::IrqEvent| crate::IrqReturn::Handled;
        let claim = ctx.request_irq(line, TriggerFlags::RISING, noop).unwrap();
        assert_eq!(claim.line, line);
        assert_eq!(
            ctx.request_irq(line, TriggerFlags::RISING, noop),
            Err(DriverError::Irq(IrqError::AlreadyClaimed(line)))
        );
        ctx.add_resource("clock", || {});
        assert_eq!(services.labels, vec!["clock".to_owned()]);
    }

    #[test]
    fn take_drvdata_keeps_mismatched_type() {
        let info = DeviceInfo::new("dev");
        let mut ctx = RemoveContext::new(&info, Some(Box::new(Data { number: 7 })));
        assert!(ctx.take_drvdata::<String>().is_none());
        assert_eq!(ctx.drvdata::<Data>().map(|d| d.number), Some(7));
        assert_eq!(ctx.take_drvdata::<Data>().map(|d| d.number), Some(7));
        assert!(ctx.drvdata::<Data>().is_none());
    }

    #[test]
    fn state_display_and_transitional() {
        assert_eq!(DeviceState::default(), DeviceState::Unbound);
        assert_eq!(DeviceState::Unbinding.to_string(), "unbinding");
        assert!(DeviceState::Binding.is_transitional());
        assert!(!DeviceState::Bound.is_transitional());
    }
}
