//! Interrupt dispatcher.
//!
//! Interrupt sources call [`Dispatcher::trigger`], which stamps the event
//! and pushes it onto a channel; it never waits for a handler. A dedicated
//! notifier thread drains the channel, looks the line up in the claim table
//! and runs the claimed handler.
//!
//! Claims are made through [`Dispatcher::claim_line`] and recorded in the
//! caller's [`ResourceScope`]. Releasing the scope removes the claim and
//! then waits for any invocation of that handler still running, so once a
//! device is unbound its handler is guaranteed not to be executing.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, error, trace};
use parking_lot::Mutex;
use tether_driver_api::{
    EventSeq, IrqError, IrqEvent, IrqHandler, IrqNumber, IrqReturn, LineClaim, TriggerFlags,
};

use crate::config::IrqConfig;
use crate::scope::{ResourceKind, ResourceScope};

const TARGET: &str = "tether::irq";

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters for one claimed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineStats {
    /// The line.
    pub line: IrqNumber,
    /// Device that claimed it.
    pub owner: String,
    /// Trigger mask of the claim.
    pub flags: TriggerFlags,
    /// Events the handler reported as [`IrqReturn::Handled`].
    pub handled: u64,
    /// Events the handler declined or panicked on.
    pub unhandled: u64,
}

/// Dispatcher-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrqStats {
    /// Currently claimed lines, by line number.
    pub lines: Vec<LineStats>,
    /// Handler invocations since start.
    pub delivered: u64,
    /// Events raised on lines nobody had claimed.
    pub spurious: u64,
    /// Edge events whose edge the claim did not ask for.
    pub filtered: u64,
    /// Events lost to a full queue or a stopped dispatcher.
    pub dropped: u64,
}

impl IrqStats {
    /// Counters for `line`, if it is claimed.
    pub fn line(&self, line: IrqNumber) -> Option<&LineStats> {
        self.lines.iter().find(|s| s.line == line)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

enum Command {
    Event {
        line: IrqNumber,
        edge: Option<TriggerFlags>,
        seq: EventSeq,
        at: Instant,
    },
    Flush(Sender<()>),
    Stop,
}

struct LineSlot {
    owner: String,
    flags: TriggerFlags,
    handler: Arc<dyn IrqHandler>,
    /// Held for the duration of each handler call.
    running: Mutex<()>,
    released: AtomicBool,
    handled: AtomicU64,
    unhandled: AtomicU64,
}

struct Shared {
    lines: Mutex<BTreeMap<IrqNumber, Arc<LineSlot>>>,
    max_lines: u32,
    seq: AtomicU64,
    delivered: AtomicU64,
    spurious: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    notifier: OnceLock<ThreadId>,
}

impl Shared {
    fn on_notifier(&self) -> bool {
        self.notifier
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    fn dispatch(&self, line: IrqNumber, edge: Option<TriggerFlags>, seq: EventSeq, at: Instant) {
        // Narrow lock: clone the slot out, call the handler unlocked.
        let slot = self.lines.lock().get(&line).cloned();
        let Some(slot) = slot else {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            trace!(target: TARGET, "spurious event {seq} on unclaimed {line}");
            return;
        };

        let edge = match edge {
            Some(edge) if !slot.flags.intersects(edge) => {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                trace!(target: TARGET, "{line}: {edge:?} not in {:?}", slot.flags);
                return;
            }
            Some(edge) => edge,
            None => slot.flags,
        };

        let _running = slot.running.lock();
        if slot.released.load(Ordering::Acquire) {
            return;
        }
        let event = IrqEvent {
            line,
            edge,
            seq,
            at,
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        match panic::catch_unwind(AssertUnwindSafe(|| slot.handler.handle(&event))) {
            Ok(IrqReturn::Handled) => {
                slot.handled.fetch_add(1, Ordering::Relaxed);
            }
            Ok(IrqReturn::NotMine) => {
                slot.unhandled.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                slot.unhandled.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: TARGET,
                    "handler for {line} owned by '{}' panicked on event {seq}",
                    slot.owner
                );
            }
        }
    }

    fn release(&self, line: IrqNumber, slot: &Arc<LineSlot>) {
        {
            let mut lines = self.lines.lock();
            if lines.get(&line).is_some_and(|cur| Arc::ptr_eq(cur, slot)) {
                lines.remove(&line);
            }
        }
        slot.released.store(true, Ordering::Release);
        // A handler releasing its own line must not wait for itself.
        if !self.on_notifier() {
            drop(slot.running.lock());
        }
        debug!(target: TARGET, "{line} released by '{}'", slot.owner);
    }
}

fn notifier_loop(shared: &Shared, rx: Receiver<Command>) {
    let _ = shared.notifier.set(thread::current().id());
    for command in rx {
        match command {
            Command::Event {
                line,
                edge,
                seq,
                at,
            } => shared.dispatch(line, edge, seq, at),
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Stop => break,
        }
    }
    trace!(target: TARGET, "notifier thread exiting");
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes line events to claimed handlers on a dedicated notifier thread.
pub struct Dispatcher {
    shared: Arc<Shared>,
    tx: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Starts a dispatcher and its notifier thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn new(config: &IrqConfig) -> std::io::Result<Self> {
        let (tx, rx) = if config.queue_capacity == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(config.queue_capacity)
        };
        let shared = Arc::new(Shared {
            lines: Mutex::new(BTreeMap::new()),
            max_lines: config.max_lines,
            seq: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            notifier: OnceLock::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || notifier_loop(&worker, rx))?;

        debug!(
            target: TARGET,
            "dispatcher started: {} lines, queue {}",
            config.max_lines,
            if config.queue_capacity == 0 {
                "unbounded".to_owned()
            } else {
                config.queue_capacity.to_string()
            }
        );
        Ok(Self {
            shared,
            tx,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Number of lines; valid lines are `0..max_lines`.
    pub fn max_lines(&self) -> u32 {
        self.shared.max_lines
    }

    /// Claims `line` for `scope`'s owner and records the claim in `scope`.
    ///
    /// # Errors
    ///
    /// [`IrqError::InvalidLine`] if the line is out of range,
    /// [`IrqError::AlreadyClaimed`] if someone holds it.
    pub fn claim_line(
        &self,
        scope: &mut ResourceScope,
        line: IrqNumber,
        flags: TriggerFlags,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<LineClaim, IrqError> {
        if line.as_u32() >= self.shared.max_lines {
            return Err(IrqError::InvalidLine(line));
        }
        let slot = Arc::new(LineSlot {
            owner: scope.owner().to_owned(),
            flags,
            handler,
            running: Mutex::new(()),
            released: AtomicBool::new(false),
            handled: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
        });
        match self.shared.lines.lock().entry(line) {
            Entry::Occupied(_) => return Err(IrqError::AlreadyClaimed(line)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }

        let shared = Arc::clone(&self.shared);
        scope.acquire(ResourceKind::IrqLine(line), line.to_string(), move || {
            shared.release(line, &slot);
        });
        debug!(target: TARGET, "{line} claimed by '{}' ({flags:?})", scope.owner());
        Ok(LineClaim { line, flags })
    }

    /// Raises `line`, delivering to its handler whatever its trigger mask.
    pub fn trigger(&self, line: IrqNumber) {
        self.enqueue(line, None);
    }

    /// Raises `line` with a specific edge; delivered only if the claim asked
    /// for that edge.
    pub fn trigger_edge(&self, line: IrqNumber, edge: TriggerFlags) {
        self.enqueue(line, Some(edge));
    }

    fn enqueue(&self, line: IrqNumber, edge: Option<TriggerFlags>) {
        let seq = EventSeq::new(self.shared.seq.fetch_add(1, Ordering::Relaxed) + 1);
        let command = Command::Event {
            line,
            edge,
            seq,
            at: Instant::now(),
        };
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target: TARGET, "queue full, dropped event {seq} on {line}");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(target: TARGET, "dispatcher stopped, dropped event {seq} on {line}");
            }
        }
    }

    /// Blocks until every event raised before this call has been handled.
    ///
    /// Returns immediately when called from a handler or after shutdown.
    pub fn flush(&self) {
        if self.shared.on_notifier() {
            return;
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Returns `true` if `line` is currently claimed.
    pub fn is_claimed(&self, line: IrqNumber) -> bool {
        self.shared.lines.lock().contains_key(&line)
    }

    /// Snapshot of the dispatcher counters.
    pub fn stats(&self) -> IrqStats {
        let lines = self
            .shared
            .lines
            .lock()
            .iter()
            .map(|(line, slot)| LineStats {
                line: *line,
                owner: slot.owner.clone(),
                flags: slot.flags,
                handled: slot.handled.load(Ordering::Relaxed),
                unhandled: slot.unhandled.load(Ordering::Relaxed),
            })
            .collect();
        IrqStats {
            lines,
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            spurious: self.shared.spurious.load(Ordering::Relaxed),
            filtered: self.shared.filtered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stops the notifier thread after it drains queued events. Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(Command::Stop);
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(target: TARGET, "notifier thread panicked");
        }
        debug!(target: TARGET, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
