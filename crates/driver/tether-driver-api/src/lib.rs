//! Driver-facing traits and types for the tether driver model.
//!
//! This crate defines everything a bus or driver implementation touches,
//! without depending on the registry that drives them:
//!
//! - **Resources** -- interrupt claims ([`IrqHandler`], [`TriggerFlags`],
//!   [`LineClaim`]) and the [`ProbeServices`] contract through which a probe
//!   acquires them.
//! - **Identity** -- [`DeviceInfo`] descriptors and the per-device
//!   [`DeviceState`] machine.
//! - **Capabilities** -- the [`Bus`] match predicate and the [`Driver`]
//!   `probe`/`remove` callbacks, with [`ProbeContext`] and [`RemoveContext`].
//! - **Events** -- [`UeventEnv`] and [`UeventAction`] for device-event
//!   notifications.

#![warn(missing_docs)]

pub mod bus;
pub mod device;
pub mod driver;
pub mod error;
pub mod resource;
pub mod services;
pub mod uevent;

// Re-export all public types at the crate root for ergonomic imports.
pub use bus::{Bus, FnBus, MatchResult, PlatformBus};
pub use device::DeviceInfo;
pub use driver::{DeviceState, Driver, DrvData, ProbeContext, RemoveContext};
pub use error::DriverError;
pub use resource::{IrqError, IrqEvent, IrqHandler, IrqReturn, LineClaim, TriggerFlags};
pub use services::ProbeServices;
pub use tether_core::id::{EventSeq, IrqNumber};
pub use uevent::{UeventAction, UeventEnv};
