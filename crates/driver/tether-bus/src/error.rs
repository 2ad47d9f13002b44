//! Registry error types.

use core::fmt;

use serde::Serialize;
use tether_driver_api::{DriverError, IrqError};
use thiserror::Error;

/// Which kind of registered entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A bus.
    Bus,
    /// A device.
    Device,
    /// A driver.
    Driver,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bus => "bus",
            Self::Device => "device",
            Self::Driver => "driver",
        })
    }
}

/// Errors reported by [`Registry`](crate::Registry) operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// An entity with the same name is already registered in that scope.
    #[error("{kind} '{name}' is already registered")]
    DuplicateIdentity {
        /// Kind of the rejected entity.
        kind: EntityKind,
        /// Its name.
        name: String,
    },

    /// The bus predicate failed; the registration that asked was rolled back.
    #[error("matching device '{device}' against driver '{driver}' failed: {cause}")]
    MatchError {
        /// Device half of the failing pair.
        device: String,
        /// Driver half of the failing pair.
        driver: String,
        /// What the predicate reported.
        #[source]
        cause: DriverError,
    },

    /// The driver's probe failed; the device is unbound and its resources
    /// were released.
    #[error("probe of device '{device}' by driver '{driver}' failed: {cause}")]
    ProbeFailed {
        /// The device.
        device: String,
        /// The driver.
        driver: String,
        /// What probe returned.
        #[source]
        cause: DriverError,
    },

    /// The driver's remove failed; the device was unbound regardless.
    #[error("remove of device '{device}' by driver '{driver}' failed: {cause}")]
    RemoveFailed {
        /// The device.
        device: String,
        /// The driver.
        driver: String,
        /// What remove returned.
        #[source]
        cause: DriverError,
    },

    /// An interrupt line could not be claimed.
    #[error(transparent)]
    Irq(#[from] IrqError),

    /// The handle refers to an entity that is no longer registered.
    #[error("{kind} '{name}' is not registered")]
    NotRegistered {
        /// Kind of the stale entity.
        kind: EntityKind,
        /// Its name.
        name: String,
    },

    /// An explicit bind named a pair the bus does not consider compatible.
    #[error("driver '{driver}' is not compatible with device '{device}'")]
    Incompatible {
        /// The device.
        device: String,
        /// The driver.
        driver: String,
    },

    /// An explicit bind named a device that already has a driver.
    #[error("device '{device}' is already bound")]
    AlreadyBound {
        /// The device.
        device: String,
    },

    /// The registry has been shut down.
    #[error("registry has been shut down")]
    ShutDown,

    /// The interrupt notifier thread could not be started.
    #[error("failed to spawn the interrupt notifier thread")]
    Spawn(#[source] std::io::Error),
}

impl BusError {
    pub(crate) fn not_registered(kind: EntityKind, name: &str) -> Self {
        Self::NotRegistered {
            kind,
            name: name.to_owned(),
        }
    }

    /// Returns the driver-side cause, for errors that carry one.
    pub fn driver_cause(&self) -> Option<DriverError> {
        match self {
            Self::MatchError { cause, .. }
            | Self::ProbeFailed { cause, .. }
            | Self::RemoveFailed { cause, .. } => Some(*cause),
            Self::Irq(e) => Some(DriverError::Irq(*e)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use tether_driver_api::IrqNumber;

    use super::*;

    #[test]
    fn display_messages() {
        let dup = BusError::DuplicateIdentity {
            kind: EntityKind::Device,
            name: "x".into(),
        };
        assert_eq!(dup.to_string(), "device 'x' is already registered");

        let probe = BusError::ProbeFailed {
            device: "d".into(),
            driver: "a".into(),
            cause: DriverError::OutOfMemory,
        };
        assert_eq!(
            probe.to_string(),
            "probe of device 'd' by driver 'a' failed: out of memory"
        );
        assert_eq!(
            BusError::not_registered(EntityKind::Bus, "b").to_string(),
            "bus 'b' is not registered"
        );
    }

    #[test]
    fn causes_are_exposed() {
        let err = BusError::MatchError {
            device: "d".into(),
            driver: "a".into(),
            cause: DriverError::IoError,
        };
        assert_eq!(err.driver_cause(), Some(DriverError::IoError));
        assert!(err.source().is_some());

        let irq = BusError::from(IrqError::InvalidLine(IrqNumber::new(70)));
        assert_eq!(irq.to_string(), "irq70 is out of range");
        assert_eq!(BusError::ShutDown.driver_cause(), None);
    }
}
