//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tether_bus::{HeapAllocator, Registry};
use tether_driver_api::{
    DeviceInfo, Driver, DriverError, FnBus, MatchResult, ProbeContext, RemoveContext,
};

/// Ordered record of driver callbacks and resource releases.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Driver data attached by [`TestDriver`].
pub struct Payload {
    pub value: u32,
}

/// Configurable driver that journals every callback.
pub struct TestDriver {
    name: &'static str,
    compatible: &'static [&'static str],
    journal: Journal,
    resources: usize,
    payload: Option<u32>,
    fail: Option<DriverError>,
    fail_remove: Option<DriverError>,
}

impl TestDriver {
    pub fn new(name: &'static str, journal: &Journal) -> Self {
        Self {
            name,
            compatible: &[],
            journal: journal.clone(),
            resources: 0,
            payload: None,
            fail: None,
            fail_remove: None,
        }
    }

    pub fn compatible(mut self, ids: &'static [&'static str]) -> Self {
        self.compatible = ids;
        self
    }

    /// Acquire `n` custom resources during probe.
    pub fn resources(mut self, n: usize) -> Self {
        self.resources = n;
        self
    }

    pub fn payload(mut self, value: u32) -> Self {
        self.payload = Some(value);
        self
    }

    /// Fail probe with `cause` after acquiring everything.
    pub fn failing(mut self, cause: DriverError) -> Self {
        self.fail = Some(cause);
        self
    }

    pub fn failing_remove(mut self, cause: DriverError) -> Self {
        self.fail_remove = Some(cause);
        self
    }
}

impl Driver for TestDriver {
    fn name(&self) -> &str {
        self.name
    }

    fn compatible(&self) -> &[&str] {
        self.compatible
    }

    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<(), DriverError> {
        let dev = ctx.device().name.clone();
        self.journal.push(format!("probe {dev} by {}", self.name));
        for i in 0..self.resources {
            let journal = self.journal.clone();
            let dev = dev.clone();
            ctx.add_resource(&format!("res{i}"), move || {
                journal.push(format!("release {dev} res{i}"));
            });
        }
        if let Some(value) = self.payload {
            ctx.alloc_drvdata(Payload { value })?;
        }
        match self.fail {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    fn remove(&self, ctx: &mut RemoveContext<'_>) -> Result<(), DriverError> {
        let value = ctx.drvdata::<Payload>().map(|p| p.value);
        match value {
            Some(value) => self.journal.push(format!(
                "remove {} by {} data={value}",
                ctx.device().name,
                self.name
            )),
            None => self
                .journal
                .push(format!("remove {} by {}", ctx.device().name, self.name)),
        }
        match self.fail_remove {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

/// Bus where a device and driver match iff their names are equal.
pub fn names_equal(name: &str) -> FnBus {
    FnBus::new(name, |dev: &DeviceInfo, drv: &dyn Driver| {
        if dev.name == drv.name() {
            MatchResult::Compatible
        } else {
            MatchResult::Incompatible
        }
    })
}

/// A registry charging driver data to a fresh heap the test can inspect.
pub fn registry_with_heap() -> (Registry, Arc<HeapAllocator>) {
    let heap = Arc::new(HeapAllocator::unlimited());
    let registry = Registry::builder()
        .allocator(heap.clone())
        .build()
        .unwrap();
    (registry, heap)
}
