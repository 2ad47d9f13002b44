//! Interrupt resource types.
//!
//! A driver claims an interrupt line during probe through
//! [`ProbeContext::request_irq`](crate::ProbeContext::request_irq). The claim
//! is owned by the device's resource scope: it is released automatically
//! when probe fails or when the device is unbound.

use core::fmt;
use std::time::Instant;

use bitflags::bitflags;
use tether_core::id::{EventSeq, IrqNumber};

bitflags! {
    /// Which edges or levels of a line a handler wants to be told about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TriggerFlags: u32 {
        /// Low-to-high transition.
        const RISING = 1 << 0;
        /// High-to-low transition.
        const FALLING = 1 << 1;
        /// Line held high.
        const HIGH = 1 << 2;
        /// Line held low.
        const LOW = 1 << 3;
        /// Both transitions.
        const BOTH_EDGES = Self::RISING.bits() | Self::FALLING.bits();
    }
}

/// Whether a handler recognized an interrupt as its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The handler serviced the interrupt.
    Handled,
    /// The interrupt was not raised by this handler's device.
    NotMine,
}

/// One delivered interrupt occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqEvent {
    /// Line the event arrived on.
    pub line: IrqNumber,
    /// Edge or level that was signalled.
    pub edge: TriggerFlags,
    /// Dispatcher-wide sequence number.
    pub seq: EventSeq,
    /// When the event was raised.
    pub at: Instant,
}

/// Interrupt handler invoked on the dispatcher's notifier thread.
///
/// Handlers run one at a time per line and must not block for long; they
/// share the notifier thread with every other line.
pub trait IrqHandler: Send + Sync {
    /// Service one event.
    fn handle(&self, event: &IrqEvent) -> IrqReturn;
}

impl<F> IrqHandler for F
where
    F: Fn(&IrqEvent) -> IrqReturn + Send + Sync,
{
    fn handle(&self, event: &IrqEvent) -> IrqReturn {
        self(event)
    }
}

/// Failure to claim an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Another device already holds the line.
    AlreadyClaimed(IrqNumber),
    /// The line number is outside the dispatcher's range.
    InvalidLine(IrqNumber),
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyClaimed(line) => write!(f, "{line} is already claimed"),
            Self::InvalidLine(line) => write!(f, "{line} is out of range"),
        }
    }
}

impl std::error::Error for IrqError {}

/// Receipt for a successful line claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineClaim {
    /// The claimed line.
    pub line: IrqNumber,
    /// Trigger mask the handler was registered with.
    pub flags: TriggerFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_edges_is_rising_or_falling() {
        assert_eq!(
            TriggerFlags::BOTH_EDGES,
            TriggerFlags::RISING | TriggerFlags::FALLING
        );
        assert!(!TriggerFlags::BOTH_EDGES.contains(TriggerFlags::HIGH));
    }

    #[test]
    fn closure_is_a_handler() {
        let handler = |ev: &IrqEvent| {
            if ev.edge.contains(TriggerFlags::RISING) {
                IrqReturn::Handled
            } else {
                IrqReturn::NotMine
            }
        };
        let mut event = IrqEvent {
            line: IrqNumber::new(3),
            edge: TriggerFlags::RISING,
            seq: EventSeq::new(1),
            at: Instant::now(),
        };
        assert_eq!(handler.handle(&event), IrqReturn::Handled);
        event.edge = TriggerFlags::FALLING;
        assert_eq!(handler.handle(&event), IrqReturn::NotMine);
    }

    #[test]
    fn irq_error_display() {
        assert_eq!(
            IrqError::InvalidLine(IrqNumber::new(99)).to_string(),
            "irq99 is out of range"
        );
        assert_eq!(
            IrqError::AlreadyClaimed(IrqNumber::new(4)).to_string(),
            "irq4 is already claimed"
        );
    }
}
