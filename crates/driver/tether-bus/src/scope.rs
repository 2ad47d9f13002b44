//! Scoped resource ownership.
//!
//! A [`ResourceScope`] is opened when a probe starts. Every resource the
//! probe acquires is pushed onto it together with its release action. The
//! scope then ends one of two ways:
//!
//! - the probe fails: [`ResourceScope::unwind`] (or simply dropping the
//!   scope) runs every release action in reverse acquisition order;
//! - the probe succeeds: [`ResourceScope::commit`] moves the records into a
//!   [`CommittedScope`] kept with the binding and released on unbind.
//!
//! Both types release on drop, so no exit path leaks.

use core::fmt;
use core::mem;

use log::{debug, trace};
use serde::Serialize;
use tether_core::id::IrqNumber;

const TARGET: &str = "tether::scope";

/// What a scope record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Driver memory charged to the allocator.
    Memory {
        /// Size of the allocation.
        bytes: usize,
    },
    /// A claimed interrupt line.
    IrqLine(IrqNumber),
    /// Any other hardware handle with a custom release action.
    Handle,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { bytes } => write!(f, "memory({bytes})"),
            Self::IrqLine(line) => write!(f, "{line}"),
            Self::Handle => f.write_str("handle"),
        }
    }
}

type Release = Box<dyn FnOnce() + Send>;

struct Record {
    kind: ResourceKind,
    label: String,
    release: Release,
}

/// Releases `records` newest first and returns how many were released.
fn release_all(owner: &str, records: &mut Vec<Record>) -> usize {
    let count = records.len();
    while let Some(record) = records.pop() {
        trace!(target: TARGET, "{owner}: release {} '{}'", record.kind, record.label);
        (record.release)();
    }
    count
}

fn debug_records(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    owner: &str,
    records: &[Record],
) -> fmt::Result {
    f.debug_struct(name)
        .field("owner", &owner)
        .field(
            "records",
            &records.iter().map(|r| (r.kind, r.label.as_str())).collect::<Vec<_>>(),
        )
        .finish()
}

// ---------------------------------------------------------------------------
// ResourceScope
// ---------------------------------------------------------------------------

/// Resources acquired by one in-progress probe.
pub struct ResourceScope {
    owner: String,
    records: Vec<Record>,
}

impl ResourceScope {
    /// Opens an empty scope on behalf of `owner` (a device name).
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            records: Vec::new(),
        }
    }

    /// The device this scope acquires for.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Records an acquired resource and the action that gives it back.
    pub fn acquire(
        &mut self,
        kind: ResourceKind,
        label: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) {
        let label = label.into();
        trace!(target: TARGET, "{}: acquire {kind} '{label}'", self.owner);
        self.records.push(Record {
            kind,
            label,
            release: Box::new(release),
        });
    }

    /// Number of held resources.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing has been acquired.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Kinds of the held resources, in acquisition order.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.records.iter().map(|r| r.kind)
    }

    /// Hands every record over to a [`CommittedScope`].
    pub fn commit(mut self) -> CommittedScope {
        CommittedScope {
            owner: mem::take(&mut self.owner),
            records: mem::take(&mut self.records),
        }
    }

    /// Releases everything in reverse order; returns how many were released.
    pub fn unwind(mut self) -> usize {
        release_all(&self.owner, &mut self.records)
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            debug!(
                target: TARGET,
                "{}: dropping scope with {} unreleased resources",
                self.owner,
                self.records.len()
            );
            release_all(&self.owner, &mut self.records);
        }
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_records(f, "ResourceScope", &self.owner, &self.records)
    }
}

// ---------------------------------------------------------------------------
// CommittedScope
// ---------------------------------------------------------------------------

/// Resources owned by an active binding.
pub struct CommittedScope {
    owner: String,
    records: Vec<Record>,
}

impl CommittedScope {
    /// The device these resources belong to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of held resources.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the binding holds no resources.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Kinds of the held resources, in acquisition order.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.records.iter().map(|r| r.kind)
    }

    /// Releases everything in reverse order; returns how many were released.
    pub fn release(mut self) -> usize {
        release_all(&self.owner, &mut self.records)
    }
}

impl Drop for CommittedScope {
    fn drop(&mut self) {
        release_all(&self.owner, &mut self.records);
    }
}

impl fmt::Debug for CommittedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_records(f, "CommittedScope", &self.owner, &self.records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn tracked(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl FnOnce() + Send + 'static {
        let log = Arc::clone(log);
        move || log.lock().push(name)
    }

    #[test]
    fn unwind_releases_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scope = ResourceScope::new("dev");
        scope.acquire(ResourceKind::Memory { bytes: 4 }, "a", tracked(&log, "a"));
        scope.acquire(ResourceKind::IrqLine(IrqNumber::new(1)), "b", tracked(&log, "b"));
        scope.acquire(ResourceKind::Handle, "c", tracked(&log, "c"));
        assert_eq!(scope.len(), 3);
        assert_eq!(scope.unwind(), 3);
        assert_eq!(*log.lock(), vec!["c", "b", "a"]);
    }

    #[test]
    fn dropping_uncommitted_scope_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut scope = ResourceScope::new("dev");
            scope.acquire(ResourceKind::Handle, "x", tracked(&log, "x"));
            scope.acquire(ResourceKind::Handle, "y", tracked(&log, "y"));
        }
        assert_eq!(*log.lock(), vec!["y", "x"]);
    }

    #[test]
    fn commit_defers_release() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scope = ResourceScope::new("dev");
        scope.acquire(ResourceKind::Memory { bytes: 8 }, "data", tracked(&log, "data"));
        scope.acquire(ResourceKind::Handle, "clk", tracked(&log, "clk"));

        let committed = scope.commit();
        assert!(log.lock().is_empty());
        assert_eq!(committed.owner(), "dev");
        assert_eq!(
            committed.kinds().collect::<Vec<_>>(),
            vec![ResourceKind::Memory { bytes: 8 }, ResourceKind::Handle]
        );
        assert_eq!(committed.release(), 2);
        assert_eq!(*log.lock(), vec!["clk", "data"]);
    }

    #[test]
    fn empty_scope_is_inert() {
        let scope = ResourceScope::new("dev");
        assert!(scope.is_empty());
        assert_eq!(scope.unwind(), 0);
    }

    #[test]
    fn kind_display() {
        assert_eq!(ResourceKind::Memory { bytes: 12 }.to_string(), "memory(12)");
        assert_eq!(ResourceKind::IrqLine(IrqNumber::new(3)).to_string(), "irq3");
    }
}
