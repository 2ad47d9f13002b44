//! [`ProbeServices`] implementation backing every probe.

use std::sync::Arc;

use tether_driver_api::{
    DriverError, IrqError, IrqHandler, IrqNumber, LineClaim, ProbeServices, TriggerFlags,
};

use crate::irq::Dispatcher;
use crate::platform::Allocator;
use crate::scope::{ResourceKind, ResourceScope};

/// Routes a probe's acquisitions into its scope.
pub(crate) struct ScopeServices<'a> {
    scope: &'a mut ResourceScope,
    allocator: &'a Arc<dyn Allocator>,
    dispatcher: &'a Dispatcher,
}

impl<'a> ScopeServices<'a> {
    pub(crate) fn new(
        scope: &'a mut ResourceScope,
        allocator: &'a Arc<dyn Allocator>,
        dispatcher: &'a Dispatcher,
    ) -> Self {
        Self {
            scope,
            allocator,
            dispatcher,
        }
    }
}

impl ProbeServices for ScopeServices<'_> {
    fn allocate(&mut self, bytes: usize) -> Result<(), DriverError> {
        let allocation = self.allocator.allocate(bytes).map_err(|e| {
            log::warn!(target: "tether::lifecycle", "{}: {e}", self.scope.owner());
            DriverError::OutOfMemory
        })?;
        let allocator = Arc::clone(self.allocator);
        self.scope
            .acquire(ResourceKind::Memory { bytes }, "drvdata", move || {
                allocator.release(allocation);
            });
        Ok(())
    }

    fn request_irq(
        &mut self,
        line: IrqNumber,
        flags: TriggerFlags,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<LineClaim, IrqError> {
        self.dispatcher.claim_line(self.scope, line, flags, handler)
    }

    fn add_resource(&mut self, label: &str, release: Box<dyn FnOnce() + Send>) {
        self.scope.acquire(ResourceKind::Handle, label, release);
    }
}

#[cfg(test)]
mod tests {
    use tether_driver_api::{DeviceInfo, IrqEvent, IrqReturn, ProbeContext};

    use super::*;
    use crate::config::IrqConfig;
    use crate::platform::HeapAllocator;

    #[test]
    fn probe_context_records_into_scope() {
        let heap = Arc::new(HeapAllocator::unlimited());
        let allocator: Arc<dyn Allocator> = heap.clone();
        let irq = Dispatcher::new(&IrqConfig::default()).unwrap();
        let info = DeviceInfo::new("dev").with_irq(IrqNumber::new(9));
        let mut scope = ResourceScope::new("dev");
        {
            let mut services = ScopeServices::new(&mut scope, &allocator, &irq);
            let mut ctx = ProbeContext::new(&info, &mut services);
            ctx.alloc_drvdata(0_u64).unwrap();
            ctx.request_irq(IrqNumber::new(9), TriggerFlags::RISING, |_: &IrqEvent| {
                IrqReturn::Handled
            })
            .unwrap();
            ctx.add_resource("clock", || {});
        }
        assert_eq!(
            scope.kinds().collect::<Vec<_>>(),
            vec![
                ResourceKind::Memory { bytes: 8 },
                ResourceKind::IrqLine(IrqNumber::new(9)),
                ResourceKind::Handle,
            ]
        );
        assert_eq!(heap.outstanding_bytes(), 8);
        assert!(irq.is_claimed(IrqNumber::new(9)));

        scope.unwind();
        assert_eq!(heap.outstanding_bytes(), 0);
        assert!(!irq.is_claimed(IrqNumber::new(9)));
    }

    #[test]
    fn refused_allocation_maps_to_out_of_memory() {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::with_limit(4));
        let irq = Dispatcher::new(&IrqConfig::default()).unwrap();
        let mut scope = ResourceScope::new("dev");
        let mut services = ScopeServices::new(&mut scope, &allocator, &irq);
        assert_eq!(services.allocate(16), Err(DriverError::OutOfMemory));
        drop(services);
        assert!(scope.is_empty());
    }
}
