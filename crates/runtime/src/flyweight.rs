//! Flyweight strings: one shared allocation per distinct string.
//!
//! Identifiers in data-driven content repeat endlessly; the same entity
//! names, column headers, and event names show up in every table. The
//! factory stores each distinct string once inside a slab chunk and hands
//! out reference-counted handles. Equality checks between handles reduce
//! to a hash/length compare, and the bytes live behind a stable pointer
//! for the life of the reference.
//!
//! ## Slab layout
//!
//! ```text
//! slab: [Placeholder][data....pad][Placeholder][data.pad][Placeholder][data...]
//!        ^ header: {refcount, len, hash}, data follows, padded so the
//!          next header lands on the placeholder's own alignment
//! ```
//!
//! Free space is itself a placeholder whose hash is the reserved
//! [`EMPTY_HASH`] and whose `len` spans the free bytes. Interning either
//! reuses a free placeholder (splitting off the remainder) or allocates a
//! new slab. [`FlyweightFactory::collect_garbage`] turns unreferenced
//! strings back into free placeholders, coalesces adjacent runs, and
//! releases slabs that became one big free placeholder.
//!
//! ## Concurrency
//!
//! The factory's mutations (intern, sweep) serialize on an internal
//! mutex. Handle clone/drop only touch the placeholder's atomic count and
//! never take the lock. A [`Handle`] keeps the backing storage alive, so
//! reading through one is always safe; a [`WeakHandle`] also pins its
//! string's count but lets the factory storage itself die.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};

use tarn_core::count::RefCount;
use tarn_core::hash::{fnv1_32, EMPTY_HASH};

/// Default slab size when the caller gives no hint.
pub const DEFAULT_CHUNK_BYTES: usize = 1024;

/// Header preceding every interned string's bytes.
#[repr(C)]
struct Placeholder {
    refs: RefCount,
    /// Byte length of the string; for a free placeholder, the number of
    /// free data bytes that follow the header.
    len: usize,
    hash: u32,
}

const UNIT: usize = std::mem::size_of::<Placeholder>();
const ALIGN: usize = std::mem::align_of::<Placeholder>();

// The walk below steps by UNIT + aligned(len); both must keep headers on
// their natural alignment.
const _: () = assert!(UNIT % ALIGN == 0);

/// Round a byte length up so the next placeholder header lands aligned.
fn align_len(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// One raw slab allocation.
struct Slab {
    ptr: NonNull<u8>,
    capacity: usize,
}

impl Slab {
    fn front(&self) -> *mut Placeholder {
        self.ptr.as_ptr().cast::<Placeholder>()
    }
}

struct FactoryCore {
    /// Every placeholder (live and free), sorted by `(hash, len)`.
    index: Vec<*mut Placeholder>,
    slabs: Vec<Slab>,
}

// Safety: the raw pointers all point into slabs owned by this core; the
// core is only mutated under the factory mutex.
unsafe impl Send for FactoryCore {}

impl Drop for FactoryCore {
    fn drop(&mut self) {
        for slab in &self.slabs {
            // Safety: allocated in `new_slab` with this exact layout;
            // placeholders are plain data and need no drop.
            unsafe {
                dealloc(
                    slab.ptr.as_ptr(),
                    Layout::from_size_align_unchecked(slab.capacity, ALIGN),
                );
            }
        }
    }
}

// Safety contract for these helpers: `p` points at a live placeholder
// inside a slab owned by the core the caller has locked (or, for reads
// from handles, a placeholder whose refcount the handle holds).
unsafe fn entry_key(p: *const Placeholder) -> (u32, usize) {
    ((*p).hash, (*p).len)
}

unsafe fn data_ptr(p: *mut Placeholder) -> *mut u8 {
    p.cast::<u8>().add(UNIT)
}

unsafe fn data_slice<'a>(p: *const Placeholder) -> &'a [u8] {
    std::slice::from_raw_parts(p.cast::<u8>().add(UNIT), (*p).len)
}

impl FactoryCore {
    /// Find a live string equal to `bytes`, or `None`.
    fn find(&self, bytes: &[u8], hash: u32) -> Option<*mut Placeholder> {
        let probe = (hash, bytes.len());
        let mut at = self
            .index
            .partition_point(|&p| unsafe { entry_key(p) } < probe);
        while let Some(&p) = self.index.get(at) {
            // Safety: index entries point into our slabs.
            unsafe {
                if entry_key(p) != probe {
                    break;
                }
                if (*p).hash != EMPTY_HASH || (*p).refs.load() > 0 {
                    if data_slice(p) == bytes {
                        return Some(p);
                    }
                }
            }
            at += 1;
        }
        None
    }

    /// Produce a placeholder able to hold `len` bytes, reusing a free one
    /// or allocating a slab. The returned placeholder is out of the
    /// index; its `len` is at least `align_len(len)`.
    fn make_idle(&mut self, len: usize, chunk_hint: usize) -> *mut Placeholder {
        let required = align_len(len);
        if let Some(found) = self.distribute_idle(required) {
            return found;
        }
        self.new_slab(len, chunk_hint)
    }

    /// First-fit search of the free placeholders, splitting when the fit
    /// is loose enough to leave a whole placeholder behind.
    fn distribute_idle(&mut self, required: usize) -> Option<*mut Placeholder> {
        let probe = (EMPTY_HASH, required);
        let mut at = self
            .index
            .partition_point(|&p| unsafe { entry_key(p) } < probe);
        while let Some(&p) = self.index.get(at) {
            // Safety: index entries point into our slabs.
            unsafe {
                if (*p).hash != EMPTY_HASH {
                    break;
                }
                // A live string whose hash collides with the reserved
                // empty hash sorts in here; skip it.
                if (*p).refs.load() > 0 {
                    at += 1;
                    continue;
                }
                if (*p).len == required {
                    self.index.remove(at);
                    return Some(p);
                }
                if let Some(tail) = split_placeholder(p, required) {
                    self.index.remove(at);
                    self.insert(tail);
                    return Some(p);
                }
            }
            at += 1;
        }
        None
    }

    /// Allocate a slab big enough for `len` bytes and carve its front.
    fn new_slab(&mut self, len: usize, chunk_hint: usize) -> *mut Placeholder {
        let wanted = (2 * UNIT - 1 + len).max(chunk_hint);
        let capacity = (wanted + UNIT - 1) / UNIT * UNIT;
        let layout = Layout::from_size_align(capacity, ALIGN).expect("slab layout");
        // Safety: layout has non-zero size (capacity >= 2 * UNIT).
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        tracing::debug!(capacity, slabs = self.slabs.len() + 1, "flyweight slab allocated");

        let front = ptr.as_ptr().cast::<Placeholder>();
        // Safety: the slab is big enough for one header and the front
        // placeholder spans all remaining bytes.
        unsafe {
            front.write(Placeholder {
                refs: RefCount::new(0),
                len: capacity - UNIT,
                hash: EMPTY_HASH,
            });
            self.slabs.push(Slab { ptr, capacity });
            if let Some(tail) = split_placeholder(front, align_len(len)) {
                self.insert(tail);
            }
        }
        front
    }

    /// Sorted insert by `(hash, len)`.
    fn insert(&mut self, p: *mut Placeholder) {
        // Safety: `p` points into one of our slabs.
        let key = unsafe { entry_key(p) };
        let at = self
            .index
            .partition_point(|&other| unsafe { entry_key(other) } < key);
        debug_assert!(self.index.get(at) != Some(&p), "placeholder inserted twice");
        self.index.insert(at, p);
    }

    /// Remove by pointer identity.
    fn remove(&mut self, p: *mut Placeholder) {
        let at = self.index.iter().position(|&other| other == p);
        debug_assert!(at.is_some(), "placeholder missing from the index");
        if let Some(at) = at {
            self.index.remove(at);
        }
    }

    /// Sweep unreferenced strings into free placeholders, coalesce
    /// adjacent runs, drop all-free slabs, and restore the index order.
    fn collect_garbage(&mut self) {
        let mut swept = 0usize;
        let mut dropped = 0usize;

        let mut slab_at = 0;
        while slab_at < self.slabs.len() {
            let slab_ptr = self.slabs[slab_at].ptr.as_ptr();
            let capacity = self.slabs[slab_at].capacity;

            let mut offset = 0usize;
            let mut trailing_empty: Option<*mut Placeholder> = None;
            loop {
                let p = unsafe { slab_ptr.add(offset) }.cast::<Placeholder>();
                // Safety: `offset` always lands on a placeholder header:
                // it starts at the front and advances by header+payload.
                let aligned = unsafe { align_len((*p).len) };
                let end = offset + UNIT + aligned;
                unsafe {
                    if (*p).refs.load() > 0 {
                        trailing_empty = None;
                    } else if let Some(previous) = trailing_empty {
                        // Absorb this placeholder (free or swept) into
                        // the free run before it.
                        if (*p).hash != EMPTY_HASH {
                            swept += 1;
                        }
                        self.remove(p);
                        (*previous).len += aligned + UNIT;
                    } else {
                        if (*p).hash != EMPTY_HASH {
                            swept += 1;
                            (*p).hash = EMPTY_HASH;
                        }
                        (*p).len = aligned;
                        trailing_empty = Some(p);
                    }
                }
                let rest = capacity - end;
                if rest < UNIT {
                    // Tail slack too small for a header; it belongs to
                    // the trailing free run, if any.
                    if let Some(previous) = trailing_empty {
                        unsafe { (*previous).len += rest };
                    }
                    break;
                }
                offset = end;
            }

            // A slab reduced to one free placeholder is released.
            let front = self.slabs[slab_at].front();
            let all_free = unsafe {
                (*front).hash == EMPTY_HASH && (*front).len == capacity - UNIT
            };
            if all_free {
                self.remove(front);
                let slab = self.slabs.remove(slab_at);
                // Safety: same layout as the allocation.
                unsafe {
                    dealloc(
                        slab.ptr.as_ptr(),
                        Layout::from_size_align_unchecked(slab.capacity, ALIGN),
                    );
                }
                dropped += 1;
            } else {
                slab_at += 1;
            }
        }

        // Conversions changed sort keys in place; restore the order.
        self.index
            .sort_by_key(|&p| unsafe { entry_key(p) });
        tracing::debug!(swept, dropped_slabs = dropped, "flyweight sweep");
    }
}

/// Split a free placeholder so its front spans exactly `front_len` data
/// bytes; the rest becomes a new free placeholder. `None` when the
/// remainder could not hold a header of its own.
///
/// # Safety
/// `p` must point at a free placeholder with at least `front_len` data
/// bytes, and `front_len` must be aligned.
unsafe fn split_placeholder(p: *mut Placeholder, front_len: usize) -> Option<*mut Placeholder> {
    debug_assert_eq!(front_len, align_len(front_len));
    debug_assert_eq!((*p).hash, EMPTY_HASH);
    let spent = front_len + UNIT;
    if (*p).len < spent {
        return None;
    }
    let tail = data_ptr(p).add(front_len).cast::<Placeholder>();
    tail.write(Placeholder {
        refs: RefCount::new(0),
        len: (*p).len - spent,
        hash: EMPTY_HASH,
    });
    (*p).len = front_len;
    Some(tail)
}

// ---------------------------------------------------------------------------

/// The interned string factory.
///
/// Cloning the factory clones a reference to the same store.
#[derive(Clone)]
pub struct FlyweightFactory {
    core: Arc<Mutex<FactoryCore>>,
}

impl FlyweightFactory {
    /// A factory with index capacity reserved for `reserve` strings.
    pub fn new(reserve: usize) -> Self {
        Self {
            core: Arc::new(Mutex::new(FactoryCore {
                index: Vec::with_capacity(reserve),
                slabs: Vec::new(),
            })),
        }
    }

    /// Intern with the default slab size hint.
    pub fn intern(&self, view: &str) -> Handle {
        self.intern_with_hint(view, DEFAULT_CHUNK_BYTES)
    }

    /// Intern a string and return a strong handle to the shared copy.
    ///
    /// `chunk_hint` sizes any newly allocated slab. Interning the empty
    /// string allocates nothing and returns the empty handle.
    pub fn intern_with_hint(&self, view: &str, chunk_hint: usize) -> Handle {
        if view.is_empty() {
            return Handle::empty();
        }
        let bytes = view.as_bytes();
        let hash = fnv1_32(bytes);
        let mut core = self.core.lock().expect("flyweight factory poisoned");

        let p = match core.find(bytes, hash) {
            Some(existing) => existing,
            None => {
                let p = core.make_idle(bytes.len(), chunk_hint);
                // Safety: `p` is a free placeholder sized for at least
                // the aligned length, exclusively ours until indexed.
                unsafe {
                    let data = data_ptr(p);
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
                    if (*p).len > bytes.len() {
                        // Slack permits a terminator; views must still
                        // carry their explicit length.
                        *data.add(bytes.len()) = 0;
                    }
                    (*p).len = bytes.len();
                    (*p).hash = hash;
                }
                core.insert(p);
                p
            }
        };
        // Safety: `p` is indexed and the core is still locked.
        unsafe { (*p).refs.add(1) };
        drop(core);
        Handle {
            core: Some(Arc::clone(&self.core)),
            string: NonNull::new(p),
        }
    }

    /// Sweep unreferenced strings and release all-free slabs.
    pub fn collect_garbage(&self) {
        self.core
            .lock()
            .expect("flyweight factory poisoned")
            .collect_garbage();
    }

    /// Number of indexed strings carrying `hash`. The reserved empty
    /// hash always reports at least one (the implicit empty string).
    pub fn count_hash(&self, hash: u32) -> usize {
        let core = self.core.lock().expect("flyweight factory poisoned");
        let base = usize::from(hash == EMPTY_HASH);
        let begin = core
            .index
            .partition_point(|&p| unsafe { (*p).hash } < hash);
        base + core.index[begin..]
            .iter()
            .take_while(|&&p| unsafe { (*p).hash } == hash)
            .count()
    }

    /// Number of slabs currently allocated.
    pub fn slab_count(&self) -> usize {
        self.core.lock().expect("flyweight factory poisoned").slabs.len()
    }

    /// The hash an interned copy of `view` would carry.
    pub fn hash_of(view: &str) -> u32 {
        fnv1_32(view.as_bytes())
    }
}

// ---------------------------------------------------------------------------

/// Strong reference to an interned string.
///
/// Keeps both the string's refcount and the factory storage alive.
/// Dereferences to the shared bytes; ordering and equality use
/// `(hash, len, bytes)` so differently interned copies of equal text
/// compare equal.
pub struct Handle {
    core: Option<Arc<Mutex<FactoryCore>>>,
    string: Option<NonNull<Placeholder>>,
}

// Safety: the pointed-at bytes are immutable while any handle holds a
// reference, and the count itself is atomic.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    /// The empty handle: no factory, no storage, empty view.
    pub fn empty() -> Self {
        Self {
            core: None,
            string: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.string.is_none()
    }

    pub fn len(&self) -> usize {
        match self.string {
            // Safety: a live handle holds a refcount; the placeholder
            // cannot be swept or its slab freed.
            Some(p) => unsafe { (*p.as_ptr()).len },
            None => 0,
        }
    }

    pub fn hash(&self) -> u32 {
        match self.string {
            // Safety: as in `len`.
            Some(p) => unsafe { (*p.as_ptr()).hash },
            None => EMPTY_HASH,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.string {
            // Safety: as in `len`; the bytes live as long as `self`.
            Some(p) => unsafe { data_slice(p.as_ptr()) },
            None => &[],
        }
    }

    pub fn as_str(&self) -> &str {
        // Safety: interning only ever copies bytes out of `&str` views.
        unsafe { std::str::from_utf8_unchecked(self.as_bytes()) }
    }

    /// Whether two handles share the same placeholder.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        self.string == other.string
    }

    /// A weak handle: keeps the string's count, not the storage.
    pub fn downgrade(&self) -> WeakHandle {
        if let Some(p) = self.string {
            // Safety: as in `len`; the new weak reference gets its own
            // count.
            unsafe { (*p.as_ptr()).refs.add(1) };
        }
        WeakHandle {
            core: self.core.as_ref().map(Arc::downgrade).unwrap_or_default(),
            string: self.string,
        }
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        if let Some(p) = self.string {
            // Safety: as in `len`.
            unsafe { (*p.as_ptr()).refs.add(1) };
        }
        Self {
            core: self.core.clone(),
            string: self.string,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(p) = self.string {
            // Safety: the placeholder outlives this handle; we only
            // touch the atomic count.
            unsafe { (*p.as_ptr()).refs.sub(1) };
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("string", &self.as_str())
            .field("hash", &self.hash())
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Handle {}

impl PartialOrd for Handle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Handle {
    /// Total order by `(hash, len, bytes)`: cheap inequality first, byte
    /// compare only for true collisions.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.hash(), self.len())
            .cmp(&(other.hash(), other.len()))
            .then_with(|| self.as_bytes().cmp(other.as_bytes()))
    }
}

impl PartialEq<str> for Handle {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for Handle {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

// ---------------------------------------------------------------------------

/// Weak reference to an interned string.
///
/// Holds the string's refcount (so a sweep will not reclaim it) but only
/// a weak reference to the factory storage. Once the factory and every
/// strong handle are gone, [`WeakHandle::upgrade`] returns `None`.
pub struct WeakHandle {
    core: Weak<Mutex<FactoryCore>>,
    string: Option<NonNull<Placeholder>>,
}

// Safety: as for Handle; the pointer is only dereferenced while the core
// is confirmed alive.
unsafe impl Send for WeakHandle {}
unsafe impl Sync for WeakHandle {}

impl WeakHandle {
    /// Recover a strong handle, or `None` when the factory died.
    pub fn upgrade(&self) -> Option<Handle> {
        let core = self.core.upgrade()?;
        let p = self.string?;
        // Safety: the core (and with it every slab) is alive while we
        // hold the Arc, and this weak handle pins the refcount.
        unsafe { (*p.as_ptr()).refs.add(1) };
        Some(Handle {
            core: Some(core),
            string: Some(p),
        })
    }
}

impl Clone for WeakHandle {
    fn clone(&self) -> Self {
        if let Some(core) = self.core.upgrade() {
            if let Some(p) = self.string {
                // Safety: core alive, so the placeholder is too.
                unsafe { (*p.as_ptr()).refs.add(1) };
            }
            drop(core);
        }
        Self {
            core: self.core.clone(),
            string: self.string,
        }
    }
}

impl Drop for WeakHandle {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            if let Some(p) = self.string {
                // Safety: core alive while the Arc is held.
                unsafe { (*p.as_ptr()).refs.sub(1) };
            }
            drop(core);
        }
    }
}
