//! Device-event environments.
//!
//! A uevent is a small ordered set of `KEY=VALUE` pairs describing one
//! change to a device. The registry fills in the standard keys and then
//! lets the bus add its own.

use core::fmt;

use crate::error::DriverError;

/// Maximum number of variables one event may carry.
pub const MAX_VARS: usize = 32;

/// Maximum total size, in bytes, of one event's `KEY=VALUE` text.
pub const MAX_BYTES: usize = 2048;

/// What happened to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UeventAction {
    /// The device was registered.
    Add,
    /// The device was unregistered.
    Remove,
    /// A driver bound to the device.
    Bind,
    /// The device's driver was detached.
    Unbind,
}

impl UeventAction {
    /// Returns the lowercase name used in the `ACTION` variable.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }
}

impl fmt::Display for UeventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `KEY=VALUE` variables attached to one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeventEnv {
    vars: Vec<(String, String)>,
    bytes: usize,
}

impl UeventEnv {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a variable.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OutOfMemory`] once the environment would exceed
    /// [`MAX_VARS`] variables or [`MAX_BYTES`] bytes, and
    /// [`DriverError::InvalidArgument`] for an empty key or one containing `=`.
    pub fn add_var(&mut self, key: &str, value: impl fmt::Display) -> Result<(), DriverError> {
        if key.is_empty() || key.contains('=') {
            return Err(DriverError::InvalidArgument);
        }
        let value = value.to_string();
        // KEY=VALUE plus the separator.
        let cost = key.len() + value.len() + 2;
        if self.vars.len() >= MAX_VARS || self.bytes + cost > MAX_BYTES {
            return Err(DriverError::OutOfMemory);
        }
        self.bytes += cost;
        self.vars.push((key.to_owned(), value));
        Ok(())
    }

    /// Returns the first value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over the variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if no variables have been added.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl fmt::Display for UeventEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.vars {
            writeln!(f, "{k}={v}")?;
        }
        Ok(())
    }
}
