//! Bus registry, match engine, and binding lifecycle.
//!
//! A [`Registry`] owns a set of buses. Each bus holds the devices and
//! drivers registered on it and a bus-supplied match predicate. Registering
//! either side runs a matching pass against the other; compatible pairs are
//! probed, and everything a probe acquires is recorded in a
//! [`ResourceScope`] so it is released on every exit path.
//!
//! # Architecture
//!
//! - [`scope`] -- [`ResourceScope`] and its committed form, released in
//!   reverse acquisition order.
//! - [`irq`] -- the interrupt [`Dispatcher`]: a notifier thread draining a
//!   channel of line events and calling the claimed handlers.
//! - [`registry`] -- the public [`Registry`] API: registration, explicit
//!   bind/unbind, queries, teardown.
//! - `matcher` and `lifecycle` -- the matching pass and the per-device
//!   state machine driven by the registry.
//! - [`sysfs`] -- read-only snapshots and device-event subscriptions.
//! - [`config`] and [`platform`] -- tunables and the injected allocator.
//!
//! # Locking
//!
//! Lock order is: registry bus table, then one bus's lists, then one
//! device's lifecycle. The interrupt line table is a leaf. Driver callbacks
//! run with no registry lock held.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod irq;
mod lifecycle;
mod matcher;
mod node;
pub mod platform;
pub mod registry;
pub mod scope;
mod services;
pub mod sysfs;

pub use config::{DeferredProbeConfig, IrqConfig, RegistryConfig};
pub use error::{BusError, EntityKind};
pub use irq::{Dispatcher, IrqStats, LineStats};
pub use lifecycle::{UnbindOutcome, UnbindRecord};
pub use matcher::{MatchReport, Pairing, ProbeFailure};
pub use node::{BusHandle, DeviceHandle, DriverHandle, Registered};
pub use platform::{AllocError, Allocation, Allocator, HeapAllocator};
pub use registry::{Registry, RegistryBuilder};
pub use scope::{CommittedScope, ResourceKind, ResourceScope};
pub use sysfs::{BusSnapshot, DeviceSnapshot, DriverSnapshot, Uevent};
