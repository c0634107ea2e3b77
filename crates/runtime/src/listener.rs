//! Listener: a single-key message receiver with re-entrancy tracking.
//!
//! Where a [`Dispatcher`](crate::dispatcher::Dispatcher) fans packets out
//! to many weakly held hooks, a listener is one object's own receiver: a
//! small sorted table of functions keyed by function key, called
//! synchronously and owned strongly. It lives on one thread and is not
//! shared.
//!
//! ## Re-entrancy
//!
//! A receiver function may, from inside its own invocation, call back
//! into the listener: deliver another packet, remove itself, register a
//! sibling. To keep the callable's storage unaliased during such
//! recursion, an executing function is *moved out* of its table slot
//! onto an explicit stack of executing slots for the duration of the
//! call. A recursive delivery to the same key finds the moved-out copy
//! on that stack and calls a clone of it. On completion the function
//! moves back, unless it was removed mid-call; then the slot was marked
//! and the entry stays gone.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread::{self, ThreadId};

use crate::message::Key;
use crate::packet::Packet;

/// Receiver function type. Single-threaded, owned by the listener.
pub type ListenerFn = Rc<dyn Fn(&Packet)>;

/// Delivery outcome: `1` a hook ran, `-1` the forward function ran,
/// `0` nothing matched.
pub type Delivery = i8;

struct ListenerHook {
    function_key: Key,
    /// `None` while the function executes (it lives on the stack then).
    function: Option<ListenerFn>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotKey {
    Hook(Key),
    Forward,
}

/// One currently executing function, moved out of its storage.
struct Slot {
    key: SlotKey,
    function: ListenerFn,
    /// Set when the function was removed or replaced mid-call; the
    /// completion path then skips the move-back.
    removed: bool,
}

struct ListenerState {
    /// Sorted by function key, unique.
    hooks: Vec<ListenerHook>,
    forward: Option<ListenerFn>,
    executing: Vec<Slot>,
}

/// A single-key message receiver bound to the creating thread.
pub struct Listener {
    key: Key,
    thread_id: ThreadId,
    state: RefCell<ListenerState>,
}

impl Listener {
    /// A listener identified by `key`, bound to the calling thread.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            thread_id: thread::current().id(),
            state: RefCell::new(ListenerState {
                hooks: Vec::new(),
                forward: None,
                executing: Vec::new(),
            }),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn verify_thread(&self) -> bool {
        let verified = thread::current().id() == self.thread_id;
        debug_assert!(verified, "listener used from a foreign thread");
        verified
    }

    /// Number of registered functions (executing ones included).
    pub fn function_count(&self) -> usize {
        self.state.borrow().hooks.len()
    }

    /// Register a receiver for `function_key`. Fails on the wrong
    /// thread or when the key is already taken.
    pub fn add_function(&self, function_key: Key, function: ListenerFn) -> bool {
        if !self.verify_thread() {
            return false;
        }
        let mut state = self.state.borrow_mut();
        let at = state
            .hooks
            .partition_point(|hook| hook.function_key < function_key);
        if state
            .hooks
            .get(at)
            .is_some_and(|hook| hook.function_key == function_key)
        {
            return false;
        }
        state.hooks.insert(
            at,
            ListenerHook {
                function_key,
                function: Some(function),
            },
        );
        true
    }

    /// Remove the receiver for `function_key`. Removing a function from
    /// inside its own invocation is allowed; the in-flight call
    /// completes, and the function is not restored afterwards.
    pub fn remove_function(&self, function_key: Key) -> bool {
        if !self.verify_thread() {
            return false;
        }
        let mut state = self.state.borrow_mut();
        let Some(at) = find_hook(&state.hooks, function_key) else {
            return false;
        };
        if state.hooks[at].function.is_none() {
            mark_removed(&mut state.executing, SlotKey::Hook(function_key));
        }
        state.hooks.remove(at);
        true
    }

    /// Whether a callable receiver is registered for `function_key`.
    pub fn has_function(&self, function_key: Key) -> bool {
        let state = self.state.borrow();
        find_hook(&state.hooks, function_key).is_some()
    }

    /// Remove every receiver. In-flight calls complete but none move
    /// back.
    pub fn clear_functions(&self) -> bool {
        if !self.verify_thread() {
            return false;
        }
        let mut state = self.state.borrow_mut();
        for slot in &mut state.executing {
            if matches!(slot.key, SlotKey::Hook(_)) {
                slot.removed = true;
            }
        }
        state.hooks.clear();
        true
    }

    /// Install (or clear, with `None`) the fallback that runs when no
    /// receiver matches a packet's function key.
    pub fn set_forward_function(&self, function: Option<ListenerFn>) -> bool {
        if !self.verify_thread() {
            return false;
        }
        let mut state = self.state.borrow_mut();
        if state.forward.is_none() {
            mark_removed(&mut state.executing, SlotKey::Forward);
        }
        state.forward = function;
        true
    }

    /// Deliver a packet addressed to this listener.
    ///
    /// Verifies the invoice's receiver mask against the listener key,
    /// then calls the receiver registered for the invoice's function
    /// key, falling back to the forward function.
    pub fn call_function(&self, packet: &Packet) -> Delivery {
        let invoice = packet.suite().invoice();
        if !invoice.verify_receiver_key(self.key) {
            return 0;
        }
        self.call_function_key(packet, invoice.function_key())
    }

    /// Deliver a packet directly to the receiver for `function_key`.
    pub fn call_function_key(&self, packet: &Packet, function_key: Key) -> Delivery {
        if !self.verify_thread() {
            return 0;
        }

        if let Some(checkout) = self.checkout(SlotKey::Hook(function_key)) {
            self.invoke(SlotKey::Hook(function_key), checkout, packet);
            return 1;
        }
        if let Some(checkout) = self.checkout(SlotKey::Forward) {
            self.invoke(SlotKey::Forward, checkout, packet);
            return -1;
        }
        0
    }

    /// Take the callable for `key` out of its storage, or clone the
    /// moved-out copy when the callable is already executing. `None`
    /// when nothing is registered under `key`.
    fn checkout(&self, key: SlotKey) -> Option<Checkout> {
        let mut state = self.state.borrow_mut();
        let storage = match key {
            SlotKey::Hook(function_key) => {
                let at = find_hook(&state.hooks, function_key)?;
                &mut state.hooks[at].function
            }
            SlotKey::Forward => {
                if state.forward.is_none() && !executing(&state.executing, key) {
                    return None;
                }
                &mut state.forward
            }
        };
        match storage.take() {
            Some(function) => Some(Checkout::Original(function)),
            None => {
                // Re-entrant delivery: the topmost executing slot for
                // this key holds the moved-out copy.
                let slot = state
                    .executing
                    .iter()
                    .rev()
                    .find(|slot| slot.key == key)
                    .expect("empty storage without an executing slot");
                Some(Checkout::Reentrant(Rc::clone(&slot.function)))
            }
        }
    }

    fn invoke(&self, key: SlotKey, checkout: Checkout, packet: &Packet) {
        let function = match checkout {
            // A re-entrant clone: the stack already owns the original,
            // nothing to push or restore.
            Checkout::Reentrant(function) => {
                function(packet);
                return;
            }
            Checkout::Original(function) => function,
        };

        let depth = {
            let mut state = self.state.borrow_mut();
            state.executing.push(Slot {
                key,
                function: Rc::clone(&function),
                removed: false,
            });
            state.executing.len()
        };

        function(packet);

        let mut state = self.state.borrow_mut();
        debug_assert_eq!(state.executing.len(), depth, "unbalanced executing stack");
        let slot = state.executing.pop().expect("executing stack underflow");
        if slot.removed {
            return;
        }
        match key {
            SlotKey::Hook(function_key) => {
                if let Some(at) = find_hook(&state.hooks, function_key) {
                    state.hooks[at].function = Some(slot.function);
                }
            }
            SlotKey::Forward => {
                state.forward = Some(slot.function);
            }
        }
    }
}

/// What [`Listener::checkout`] produced: the original callable (moved out
/// of its storage) or a clone of one already executing.
enum Checkout {
    Original(ListenerFn),
    Reentrant(ListenerFn),
}

fn find_hook(hooks: &[ListenerHook], function_key: Key) -> Option<usize> {
    let at = hooks.partition_point(|hook| hook.function_key < function_key);
    if hooks
        .get(at)
        .is_some_and(|hook| hook.function_key == function_key)
    {
        Some(at)
    } else {
        None
    }
}

fn executing(slots: &[Slot], key: SlotKey) -> bool {
    slots.iter().any(|slot| slot.key == key)
}

fn mark_removed(slots: &mut [Slot], key: SlotKey) {
    for slot in slots {
        if slot.key == key {
            slot.removed = true;
        }
    }
}
