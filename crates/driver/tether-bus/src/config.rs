//! Registry configuration.
//!
//! Every field has a default, so an empty document is a valid
//! configuration. Host tools typically load this from TOML.

use serde::{Deserialize, Serialize};
use tether_core::log::LogLevel;

/// Top-level registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Interrupt dispatcher settings.
    pub irq: IrqConfig,
    /// Deferred-probe retry settings.
    pub deferred: DeferredProbeConfig,
    /// Level used by host tools when they install a logger.
    pub log_level: LogLevel,
}

/// Interrupt dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IrqConfig {
    /// Number of lines; valid line numbers are `0..max_lines`.
    pub max_lines: u32,
    /// Event queue capacity. Zero means unbounded. When bounded, events
    /// raised while the queue is full are dropped and counted.
    pub queue_capacity: usize,
    /// Name given to the notifier thread.
    pub thread_name: String,
}

impl Default for IrqConfig {
    fn default() -> Self {
        Self {
            max_lines: 64,
            queue_capacity: 0,
            thread_name: "tether-irq".to_owned(),
        }
    }
}

/// Deferred-probe retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeferredProbeConfig {
    /// How many times one deferred pair is re-evaluated before it is dropped.
    pub max_attempts: u32,
    /// Keep running deferred passes while each pass binds something.
    pub retry_after_bind: bool,
}

impl Default for DeferredProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            retry_after_bind: true,
        }
    }
}
