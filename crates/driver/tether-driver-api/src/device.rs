//! Device descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tether_core::id::IrqNumber;

/// Static description of a device, as supplied when it is registered.
///
/// The registry never mutates a descriptor; everything that changes over a
/// device's life (state, driver, driver data) lives beside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Name, unique within the device's bus.
    pub name: String,
    /// Compatible strings, most specific first.
    #[serde(default)]
    pub compatible: Vec<String>,
    /// Free-form string properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Interrupt line wired to this device, if any.
    #[serde(default)]
    pub irq: Option<IrqNumber>,
}

impl DeviceInfo {
    /// Creates a descriptor with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a compatible string.
    #[must_use]
    pub fn with_compatible(mut self, compatible: impl Into<String>) -> Self {
        self.compatible.push(compatible.into());
        self
    }

    /// Sets a property, replacing any previous value.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Wires the device to an interrupt line.
    #[must_use]
    pub fn with_irq(mut self, irq: IrqNumber) -> Self {
        self.irq = Some(irq);
        self
    }

    /// Looks up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns `true` if any of the device's compatible strings is in `ids`.
    pub fn is_compatible_with(&self, ids: &[&str]) -> bool {
        self.compatible
            .iter()
            .any(|c| ids.iter().any(|id| id == c))
    }
}
