//! Core types shared by the tether driver-model crates.
//!
//! This crate holds the pieces every other crate leans on but which carry no
//! driver-model semantics of their own:
//!
//! - [`id`] -- typed identifiers ([`IrqNumber`](id::IrqNumber),
//!   [`EventSeq`](id::EventSeq)) so interrupt lines and event counters cannot
//!   be mixed up with plain integers.
//! - [`log`] -- the logging backend. Library code logs through the `log`
//!   facade; this module supplies the [`LogSink`](log::LogSink) layer that
//!   fans records out to one or more outputs.

#![warn(missing_docs)]

pub mod id;
pub mod log;
