//! Bus match predicates.
//!
//! A bus decides which of its drivers may take which of its devices. The
//! registry asks it once per candidate pair and acts on the answer; the bus
//! itself keeps no binding state.

use crate::device::DeviceInfo;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::uevent::UeventEnv;

/// Outcome of asking a bus whether a driver can take a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The pair is not a match.
    Incompatible,
    /// The pair matches; probe may proceed.
    Compatible,
    /// The pair may match later; retry after other bindings settle.
    Deferred,
    /// The predicate itself failed. Aborts the registration that asked.
    Error(DriverError),
}

impl MatchResult {
    /// Returns `true` for [`MatchResult::Compatible`].
    pub const fn is_compatible(self) -> bool {
        matches!(self, Self::Compatible)
    }
}

/// A bus: a named match predicate plus an optional uevent hook.
pub trait Bus: Send + Sync {
    /// Name, unique within the registry.
    fn name(&self) -> &str;

    /// Decides whether `driver` may take `device`.
    fn matches(&self, device: &DeviceInfo, driver: &dyn Driver) -> MatchResult;

    /// Adds bus-specific variables to a device event.
    ///
    /// Returning an error suppresses the event.
    fn uevent(&self, device: &DeviceInfo, env: &mut UeventEnv) -> Result<(), DriverError> {
        let _ = (device, env);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PlatformBus
// ---------------------------------------------------------------------------

/// Matches by compatible string, falling back to name equality.
///
/// A pair matches if any device compatible string appears in the driver's
/// [`compatible`](Driver::compatible) list. When the driver lists none, the
/// device and driver names must be equal.
pub struct PlatformBus {
    name: String,
}

impl PlatformBus {
    /// Creates a platform bus with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for PlatformBus {
    fn default() -> Self {
        Self::new("platform")
    }
}

impl Bus for PlatformBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, device: &DeviceInfo, driver: &dyn Driver) -> MatchResult {
        let ids = driver.compatible();
        let hit = if ids.is_empty() {
            device.name == driver.name()
        } else {
            device.is_compatible_with(ids)
        };
        if hit {
            MatchResult::Compatible
        } else {
            MatchResult::Incompatible
        }
    }

    fn uevent(&self, device: &DeviceInfo, env: &mut UeventEnv) -> Result<(), DriverError> {
        let modalias = device.compatible.first().unwrap_or(&device.name);
        env.add_var("MODALIAS", format_args!("{}:{modalias}", self.name))
    }
}

// ---------------------------------------------------------------------------
// FnBus
// ---------------------------------------------------------------------------

type MatchFn = dyn Fn(&DeviceInfo, &dyn Driver) -> MatchResult + Send + Sync;
type UeventFn = dyn Fn(&DeviceInfo, &mut UeventEnv) -> Result<(), DriverError> + Send + Sync;

/// A bus whose predicate is a closure.
pub struct FnBus {
    name: String,
    matcher: Box<MatchFn>,
    uevent: Option<Box<UeventFn>>,
}

impl FnBus {
    /// Creates a bus named `name` that answers matches with `matcher`.
    pub fn new(
        name: impl Into<String>,
        matcher: impl Fn(&DeviceInfo, &dyn Driver) -> MatchResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
            uevent: None,
        }
    }

    /// Creates a bus that matches every pair.
    pub fn always(name: impl Into<String>) -> Self {
        Self::new(name, |_, _| MatchResult::Compatible)
    }

    /// Installs a uevent hook.
    #[must_use]
    pub fn with_uevent(
        mut self,
        hook: impl Fn(&DeviceInfo, &mut UeventEnv) -> Result<(), DriverError> + Send + Sync + 'static,
    ) -> Self {
        self.uevent = Some(Box::new(hook));
        self
    }
}

impl Bus for FnBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, device: &DeviceInfo, driver: &dyn Driver) -> MatchResult {
        (self.matcher)(device, driver)
    }

    fn uevent(&self, device: &DeviceInfo, env: &mut UeventEnv) -> Result<(), DriverError> {
        match &self.uevent {
            Some(hook) => hook(device, env),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ProbeContext;

    struct Named {
        name: &'static str,
        compatible: &'static [&'static str],
    }

    impl Driver for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn compatible(&self) -> &[&str] {
            self.compatible
        }

        fn probe(&self, _ctx: &mut ProbeContext<'_>) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[test]
    fn platform_matches_compatible_strings() {
        let bus = PlatformBus::default();
        let dev = DeviceInfo::new("button0").with_compatible("btn_lkm_irq");
        let yes = Named {
            name: "btn",
            compatible: &["btn_lkm_irq"],
        };
        let no = Named {
            name: "uart",
            compatible: &["ns16550"],
        };
        assert_eq!(bus.matches(&dev, &yes), MatchResult::Compatible);
        assert_eq!(bus.matches(&dev, &no), MatchResult::Incompatible);
    }

    #[test]
    fn platform_falls_back_to_name() {
        let bus = PlatformBus::default();
        let dev = DeviceInfo::new("rtc");
        let same = Named {
            name: "rtc",
            compatible: &[],
        };
        let other = Named {
            name: "rtc2",
            compatible: &[],
        };
        assert!(bus.matches(&dev, &same).is_compatible());
        assert!(!bus.matches(&dev, &other).is_compatible());
    }

    #[test]
    fn platform_uevent_adds_modalias() {
        let bus = PlatformBus::default();
        let mut env = UeventEnv::new();
        bus.uevent(&DeviceInfo::new("rtc"), &mut env).unwrap();
        assert_eq!(env.get("MODALIAS"), Some("platform:rtc"));
    }

    #[test]
    fn fn_bus_uses_closures() {
        let bus = FnBus::new("odd", |dev, _| {
            if dev.name.ends_with('1') {
                MatchResult::Compatible
            } else {
                MatchResult::Deferred
            }
        })
        .with_uevent(|_, env| env.add_var("MODALIAS", "MY BUS IS AWESOME"));
        let drv = Named {
            name: "d",
            compatible: &[],
        };
        assert_eq!(bus.matches(&DeviceInfo::new("dev1"), &drv), MatchResult::Compatible);
        assert_eq!(bus.matches(&DeviceInfo::new("dev2"), &drv), MatchResult::Deferred);

        let mut env = UeventEnv::new();
        bus.uevent(&DeviceInfo::new("dev1"), &mut env).unwrap();
        assert_eq!(env.get("MODALIAS"), Some("MY BUS IS AWESOME"));
    }

    #[test]
    fn always_bus_has_no_hook() {
        let bus = FnBus::always("my_bus");
        let mut env = UeventEnv::new();
        bus.uevent(&DeviceInfo::new("x"), &mut env).unwrap();
        assert!(env.is_empty());
        assert_eq!(bus.name(), "my_bus");
    }
}
