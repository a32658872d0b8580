//! Event model for the instrumentation core.
//!
//! An [`EventDescription`] names one instrumentation site and embeds its
//! [`EventState`]: the word-sized enable mask consulted on the fast path and
//! the RCU-published array of attached callbacks. The argument payloads
//! ([`ArgVec`], [`DynamicStruct`]) are opaque to the core; the encoding
//! layer that assembles them also defines their meaning.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use crossbeam_epoch::{self as epoch, Atomic, Shared};

/// Dispatch key matching every attached callback and every pending dump.
pub const MATCH_ALL_KEY: u64 = 0;
/// Reserved key identifying the kernel user-event channel.
pub const USER_EVENT_KEY: u64 = 1;
/// Reserved key identifying the ptrace notification channel.
pub const PTRACE_KEY: u64 = 2;
/// Keys below this value are reserved; [`crate::request_key`] starts here.
pub const FIRST_DYNAMIC_KEY: u64 = 8;

/// Top 8 bits of the `enabled` word are owned by kernel-side tracers and
/// may be flipped concurrently; the core only touches the low bits, with
/// atomic read-modify-writes.
pub const ENABLED_SHARED_MASK: usize = 0xFF << (usize::BITS - 8);
/// Kernel user-event enable bit (highest bit of the `enabled` word).
pub const ENABLED_USER_EVENT_BIT: usize = 1 << (usize::BITS - 1);
/// Ptrace enable bit (second-highest bit of the `enabled` word).
pub const ENABLED_PTRACE_BIT: usize = 1 << (usize::BITS - 2);
/// Low bits of the `enabled` word: the private attached-callback refcount.
pub const ENABLED_PRIVATE_MASK: usize = !ENABLED_SHARED_MASK;

bitflags! {
    /// Flags carried by an event description. Only `VARIADIC` is consulted
    /// by the dispatch core; the remaining bits belong to the type layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const VARIADIC = 1 << 0;
    }
}

/// Opaque argument vector assembled by the encoding layer.
///
/// The core never inspects the payload; it is handed through to tracer
/// callbacks verbatim. State-dump marker events point it at the UTF-8
/// bytes of the producer name.
#[derive(Debug, Clone, Copy)]
pub struct ArgVec {
    data: *const c_void,
    len: u32,
}

impl ArgVec {
    pub const fn new(data: *const c_void, len: u32) -> Self {
        Self { data, len }
    }

    pub const fn empty() -> Self {
        Self {
            data: std::ptr::null(),
            len: 0,
        }
    }

    pub fn data(&self) -> *const c_void {
        self.data
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Opaque variadic-field payload, passed through alongside the [`ArgVec`]
/// on variadic event calls.
#[derive(Debug, Clone, Copy)]
pub struct DynamicStruct {
    data: *const c_void,
    len: u32,
}

impl DynamicStruct {
    pub const fn new(data: *const c_void, len: u32) -> Self {
        Self { data, len }
    }

    pub const fn empty() -> Self {
        Self {
            data: std::ptr::null(),
            len: 0,
        }
    }

    pub fn data(&self) -> *const c_void {
        self.data
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Tracer callback attached to a non-variadic event.
///
/// Arguments: event description, argument vector, the private data the
/// callback was registered with, and the producer's call-site address
/// (null on targets without a cheap return-address primitive).
pub type EventCallFn = fn(&EventDescription, &ArgVec, *mut c_void, *const c_void);

/// Tracer callback attached to a variadic event.
pub type EventCallVariadicFn =
    fn(&EventDescription, &ArgVec, &DynamicStruct, *mut c_void, *const c_void);

/// The two callback shapes, tagged by the event's `VARIADIC` flag at
/// registration time. Every entry of an event's callback array holds the
/// variant matching that flag.
#[derive(Clone, Copy)]
pub(crate) enum CallbackFn {
    Plain(EventCallFn),
    Variadic(EventCallVariadicFn),
}

impl CallbackFn {
    /// Function-pointer identity, used for duplicate detection.
    pub(crate) fn addr(&self) -> usize {
        match *self {
            CallbackFn::Plain(f) => f as usize,
            CallbackFn::Variadic(f) => f as usize,
        }
    }
}

/// One attached callback: function, private data, dispatch key.
#[derive(Clone, Copy)]
pub(crate) struct Callback {
    pub(crate) func: CallbackFn,
    pub(crate) priv_data: *mut c_void,
    pub(crate) key: u64,
}

impl Callback {
    /// Entries are unique on the (function, private data, key) tuple.
    pub(crate) fn matches(&self, func: &CallbackFn, priv_data: *mut c_void, key: u64) -> bool {
        self.func.addr() == func.addr() && self.priv_data == priv_data && self.key == key
    }
}

/// Immutable callback array, RCU-published through [`EventState`].
/// A null published pointer stands in for the empty array, so events that
/// have never been attached cost no allocation.
pub(crate) struct CallbackSet {
    pub(crate) entries: Box<[Callback]>,
}

impl CallbackSet {
    pub(crate) fn new(entries: Vec<Callback>) -> Self {
        Self {
            entries: entries.into_boxed_slice(),
        }
    }
}

// The private-data pointers are opaque tracer context. Registering a
// callback asserts that its private data may be used from whichever thread
// dispatches the event, mirroring the registration contract of the C ABI.
unsafe impl Send for CallbackSet {}
unsafe impl Sync for CallbackSet {}

/// Per-event dispatch state, version 0.
///
/// `version` is checked on every call; a non-zero value means the event was
/// produced by a forward-incompatible newer layout and aborts the process.
pub struct EventState {
    version: u32,
    /// Number of attached callbacks. Mutated only under the event lock.
    pub(crate) nr_callbacks: AtomicU32,
    /// Enable mask; see [`ENABLED_SHARED_MASK`] for the bit split.
    pub(crate) enabled: AtomicUsize,
    /// RCU-published callback array; null when no callbacks are attached.
    pub(crate) callbacks: Atomic<CallbackSet>,
}

impl EventState {
    fn new(version: u32) -> Self {
        Self {
            version,
            nr_callbacks: AtomicU32::new(0),
            enabled: AtomicUsize::new(0),
            callbacks: Atomic::null(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of attached callbacks (excluding kernel-side tracers).
    pub fn nr_callbacks(&self) -> u32 {
        self.nr_callbacks.load(Ordering::Relaxed)
    }

    /// Raw snapshot of the `enabled` word.
    pub fn enabled_bits(&self) -> usize {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Drop for EventState {
    fn drop(&mut self) {
        // Exclusive access: no readers can hold the published pointer here.
        let guard = unsafe { epoch::unprotected() };
        let set = self.callbacks.swap(Shared::null(), Ordering::Relaxed, guard);
        if !set.is_null() {
            drop(unsafe { set.into_owned() });
        }
    }
}

/// One instrumentation site, named by the producer that declares it.
///
/// The description is owned by whoever registers the event batch and must
/// stay unchanged between registration and unregistration. Everything the
/// core does not consult (field layouts, log levels, attributes) lives in
/// the external type layer.
///
/// # Examples
///
/// ```
/// use probekit::{EventDescription, EventFlags};
///
/// let desc = EventDescription::new("myapp", "request_start", EventFlags::empty());
/// assert_eq!(desc.event_name(), "request_start");
/// assert!(!desc.enabled());
/// ```
pub struct EventDescription {
    provider_name: Box<str>,
    event_name: Box<str>,
    flags: EventFlags,
    state: EventState,
}

impl EventDescription {
    pub fn new(provider_name: &str, event_name: &str, flags: EventFlags) -> Self {
        Self::with_state_version(provider_name, event_name, flags, 0)
    }

    /// Build a description with an explicit state version. Versions other
    /// than 0 are forward-incompatible and make dispatch abort; this
    /// constructor exists so that compatibility handling can be exercised.
    pub fn with_state_version(
        provider_name: &str,
        event_name: &str,
        flags: EventFlags,
        version: u32,
    ) -> Self {
        Self {
            provider_name: Box::from(provider_name),
            event_name: Box::from(event_name),
            flags,
            state: EventState::new(version),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn state(&self) -> &EventState {
        &self.state
    }

    /// Whether any tracer (private or kernel-side) has enabled this event.
    /// Producers use this to skip argument-vector construction entirely.
    pub fn enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Relaxed) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_bit_layout_leaves_low_bits_private() {
        assert_eq!(ENABLED_SHARED_MASK & ENABLED_PRIVATE_MASK, 0);
        assert_eq!(ENABLED_SHARED_MASK | ENABLED_PRIVATE_MASK, usize::MAX);
        assert!(ENABLED_USER_EVENT_BIT & ENABLED_SHARED_MASK != 0);
        assert!(ENABLED_PTRACE_BIT & ENABLED_SHARED_MASK != 0);
    }

    #[test]
    fn fresh_event_is_disabled() {
        let desc = EventDescription::new("prov", "evt", EventFlags::empty());
        assert!(!desc.enabled());
        assert_eq!(desc.state().nr_callbacks(), 0);
        assert_eq!(desc.state().version(), 0);
    }
}
