//! Per-thread message dispatch and the zone that trades packets between
//! threads.
//!
//! Each [`Dispatcher`] is bound to exactly one OS thread at creation and
//! asserts that binding on every thread-affine operation. Subscriptions
//! (hooks) hold their receiver function *weakly*: the caller owns the
//! `Arc`, and dropping it unsubscribes automatically on the next flush.
//!
//! ## Packet circulation
//!
//! ```text
//! post_message ──▶ exports ──(zone.flush: spinlocked swap)──▶ zone round
//!                                                               │
//! hook calls ◀── flush() ◀── imports ◀──(broadcast append)──────┘
//! ```
//!
//! [`Zone::flush`] collects every live dispatcher's exports into one
//! round, then appends the round to every dispatcher's imports. Each
//! dispatcher's own [`Dispatcher::flush`] later delivers its imports on
//! its own thread. Packets posted by one dispatcher therefore arrive at
//! any single destination in post order; no order is promised between
//! different senders.
//!
//! Delivery never runs user callbacks under a lock: matching hooks are
//! upgraded into a call cache first, then invoked. A hook added or
//! removed from inside a callback cannot reorder the packet being
//! delivered.

use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use serde::Serialize;
use tarn_core::spin::SpinLock;

use crate::message::{Invoice, Key, Suite};
use crate::packet::Packet;

/// Hook delivery order within one function key: ascending priority.
pub type Priority = i32;

/// Receiver function type. Hooks store these weakly.
pub type HookFn = dyn Fn(&Packet) + Send + Sync;

/// One subscription: `(receiver, function)` routing plus the weakly held
/// callable. `None` marks an entry weakened by removal, pending sweep.
struct Hook {
    function: Option<Weak<HookFn>>,
    receiver_key: Key,
    function_key: Key,
    priority: Priority,
}

impl Hook {
    fn is_live(&self) -> bool {
        self.function
            .as_ref()
            .is_some_and(|function| function.strong_count() > 0)
    }
}

#[derive(Default)]
struct Trade {
    imports: Vec<Arc<Packet>>,
    exports: Vec<Arc<Packet>>,
}

/// A per-thread message dispatcher. Created through
/// [`Zone::equip_dispatcher`]; shared as `Arc` between the zone and the
/// owning code.
pub struct Dispatcher {
    /// Sorted by `(function_key, priority)` ascending.
    hooks: SpinLock<Vec<Hook>>,
    /// Import/export queues, swapped with the zone under the spinlock.
    trade: SpinLock<Trade>,
    thread_id: ThreadId,
}

impl Dispatcher {
    fn new(thread_id: ThreadId) -> Self {
        Self {
            hooks: SpinLock::new(Vec::new()),
            trade: SpinLock::new(Trade::default()),
            thread_id,
        }
    }

    /// The thread this dispatcher is bound to.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn verify_thread(&self) -> bool {
        let verified = thread::current().id() == self.thread_id;
        debug_assert!(verified, "dispatcher used from a foreign thread");
        verified
    }

    // -- hooks --------------------------------------------------------------

    /// Subscribe `function` to messages matching `(receiver_key,
    /// function_key)`, at `priority` (lower runs earlier among equal
    /// function keys).
    ///
    /// The dispatcher keeps only a weak reference: the caller keeps the
    /// `Arc` alive for as long as the subscription should last. Fails on
    /// the wrong thread or when a live hook already claims the same
    /// `(receiver_key, function_key)` pair.
    pub fn add_function(
        &self,
        receiver_key: Key,
        function_key: Key,
        priority: Priority,
        function: &Arc<HookFn>,
    ) -> bool {
        if !self.verify_thread() {
            return false;
        }
        let mut hooks = self.hooks.lock();
        let mut insert_at = hooks.partition_point(|hook| hook.function_key < function_key);
        let mut at = insert_at;
        while let Some(hook) = hooks.get(at) {
            if hook.function_key != function_key {
                break;
            }
            if hook.receiver_key == receiver_key && hook.is_live() {
                return false;
            }
            at += 1;
            if hook.priority <= priority {
                insert_at = at;
            }
        }
        hooks.insert(
            insert_at,
            Hook {
                function: Some(Arc::downgrade(function)),
                receiver_key,
                function_key,
                priority,
            },
        );
        true
    }

    /// Unsubscribe the hook for `(receiver_key, function_key)`. The
    /// entry is weakened immediately (it can no longer fire) and swept on
    /// the next flush. Returns the stored weak function, or `None` when
    /// no such hook exists.
    pub fn remove_function(&self, receiver_key: Key, function_key: Key) -> Option<Weak<HookFn>> {
        let mut hooks = self.hooks.lock();
        let at = find_hook(&hooks, receiver_key, function_key)?;
        hooks[at].function.take()
    }

    /// Unsubscribe every live hook of `receiver_key`; returns how many
    /// were weakened.
    pub fn remove_receiver(&self, receiver_key: Key) -> usize {
        let mut hooks = self.hooks.lock();
        let mut removed = 0;
        for hook in hooks.iter_mut() {
            if hook.receiver_key == receiver_key && hook.is_live() {
                hook.function = None;
                removed += 1;
            }
        }
        removed
    }

    /// The weak function stored for `(receiver_key, function_key)`.
    pub fn find_function(&self, receiver_key: Key, function_key: Key) -> Option<Weak<HookFn>> {
        let hooks = self.hooks.lock();
        let at = find_hook(&hooks, receiver_key, function_key)?;
        hooks[at].function.clone()
    }

    // -- posting ------------------------------------------------------------

    /// Queue a parameterless message for zone-wide (and, via a host
    /// transport, cross-zone) delivery after the next zone exchange.
    pub fn post_message(&self, invoice: Invoice) -> bool {
        self.add_export(Packet::external(Suite::new(invoice)))
    }

    /// Queue a message with a parameter for zone-wide and cross-zone
    /// delivery. The parameter must be serializable so the packet can
    /// flatten at a zone boundary.
    pub fn post_message_with<P>(&self, invoice: Invoice, parameter: P) -> bool
    where
        P: Serialize + Send + Sync + 'static,
    {
        self.add_export(Packet::external(Suite::with_portable_parameter(
            invoice, parameter,
        )))
    }

    /// Queue a parameterless message confined to this zone.
    pub fn post_zonal_message(&self, invoice: Invoice) -> bool {
        self.add_export(Packet::zonal(Suite::new(invoice)))
    }

    /// Queue a zone-confined message with an arbitrary (non-serialized)
    /// parameter.
    pub fn post_zonal_message_with<P>(&self, invoice: Invoice, parameter: P) -> bool
    where
        P: Send + Sync + 'static,
    {
        self.add_export(Packet::zonal(Suite::with_parameter(invoice, parameter)))
    }

    fn add_export(&self, packet: Packet) -> bool {
        if !self.verify_thread() {
            return false;
        }
        self.trade.lock().exports.push(Arc::new(packet));
        true
    }

    // -- synchronous local delivery -----------------------------------------

    /// Deliver a packet to this dispatcher's matching hooks, blocking
    /// until every receiver ran. Runs ahead of anything still queued.
    pub fn send_local_message(&self, packet: &Packet) -> bool {
        if !self.verify_thread() {
            return false;
        }
        self.deliver(packet);
        true
    }

    /// Synchronously deliver a parameterless message locally.
    pub fn send_local(&self, invoice: Invoice) -> bool {
        self.send_local_message(&Packet::zonal(Suite::new(invoice)))
    }

    /// Synchronously deliver a message with a parameter locally.
    pub fn send_local_with<P: Send + Sync + 'static>(&self, invoice: Invoice, parameter: P) -> bool {
        self.send_local_message(&Packet::zonal(Suite::with_parameter(invoice, parameter)))
    }

    // -- delivery -----------------------------------------------------------

    /// Deliver everything imported since the last flush, sweeping
    /// expired hooks first. Must run on the owning thread; call it once
    /// per frame after [`Zone::flush`].
    pub fn flush(&self) -> bool {
        if !self.verify_thread() {
            return false;
        }
        let delivery = std::mem::take(&mut self.trade.lock().imports);
        {
            let mut hooks = self.hooks.lock();
            let before = hooks.len();
            hooks.retain(Hook::is_live);
            if hooks.len() != before {
                tracing::trace!(swept = before - hooks.len(), "expired hooks swept");
            }
        }
        for packet in &delivery {
            self.deliver(packet);
        }
        true
    }

    fn deliver(&self, packet: &Packet) {
        let invoice = packet.suite().invoice();
        let function_key = invoice.function_key();

        // Collect matching receivers under the lock, call them outside
        // it. The cache also fixes this packet's receiver set: callback
        // re-registration cannot change it mid-delivery.
        let mut cache: Vec<Arc<HookFn>> = Vec::new();
        {
            let hooks = self.hooks.lock();
            let mut at = hooks.partition_point(|hook| hook.function_key < function_key);
            while let Some(hook) = hooks.get(at) {
                if hook.function_key != function_key {
                    break;
                }
                if invoice.verify_receiver_key(hook.receiver_key) {
                    // An expired or weakened entry is skipped; the next
                    // flush sweeps it.
                    if let Some(function) = hook.function.as_ref().and_then(Weak::upgrade) {
                        cache.push(function);
                    }
                }
                at += 1;
            }
        }
        for function in cache {
            function(packet);
        }
    }
}

/// Lowest-index hook with exactly `(receiver_key, function_key)`.
fn find_hook(hooks: &[Hook], receiver_key: Key, function_key: Key) -> Option<usize> {
    let mut at = hooks.partition_point(|hook| hook.function_key < function_key);
    while let Some(hook) = hooks.get(at) {
        if hook.function_key != function_key {
            break;
        }
        if hook.receiver_key == receiver_key {
            return Some(at);
        }
        at += 1;
    }
    None
}

// ---------------------------------------------------------------------------

/// A zone: the set of dispatchers that trade packets with each other.
///
/// The zone holds its dispatchers weakly. Dropping every `Arc` to a
/// dispatcher removes it from circulation (and drops its queued
/// packets); the zone reaps the dead slot on the next flush.
#[derive(Default)]
pub struct Zone {
    dispatchers: Mutex<Vec<Weak<Dispatcher>>>,
}

impl Zone {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatcher bound to the calling thread, creating it on first
    /// use. Repeated calls from one thread return the same dispatcher.
    pub fn equip_dispatcher(&self) -> Arc<Dispatcher> {
        let thread_id = thread::current().id();
        let mut dispatchers = self.dispatchers.lock().expect("zone poisoned");
        for slot in dispatchers.iter() {
            if let Some(dispatcher) = slot.upgrade() {
                if dispatcher.thread_id == thread_id {
                    return dispatcher;
                }
            }
        }
        let dispatcher = Arc::new(Dispatcher::new(thread_id));
        dispatchers.push(Arc::downgrade(&dispatcher));
        tracing::debug!(?thread_id, count = dispatchers.len(), "dispatcher equipped");
        dispatcher
    }

    /// Number of live dispatchers.
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers
            .lock()
            .expect("zone poisoned")
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    /// Trade packets: collect every live dispatcher's exports into one
    /// round, then append the round to every live dispatcher's imports.
    ///
    /// Each spinlock is held only for the queue swap, one dispatcher at
    /// a time; the exchange never runs user code. Callable from any
    /// thread.
    pub fn flush(&self) {
        let live: Vec<Arc<Dispatcher>> = {
            let mut dispatchers = self.dispatchers.lock().expect("zone poisoned");
            dispatchers.retain(|slot| slot.strong_count() > 0);
            dispatchers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut round: Vec<Arc<Packet>> = Vec::new();
        for dispatcher in &live {
            round.append(&mut dispatcher.trade.lock().exports);
        }
        if round.is_empty() {
            return;
        }
        for dispatcher in &live {
            dispatcher
                .trade
                .lock()
                .imports
                .extend(round.iter().cloned());
        }
        tracing::trace!(
            packets = round.len(),
            dispatchers = live.len(),
            "zone exchange"
        );
    }
}
