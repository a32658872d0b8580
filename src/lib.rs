//! User-space instrumentation core.
//!
//! Applications declare named instrumentation events; tracers attach
//! callbacks that run on every matching event call; a state-dump machine
//! lets tracers ask producers to replay their current state as a burst of
//! synthetic event calls.
//!
//! The modules split along the concurrency seams: [`dispatch`] is the
//! read-mostly fast path walking epoch-protected callback arrays,
//! [`registry`] and [`callbacks`] mutate them copy-on-write under the
//! recursive event lock, and [`statedump`] runs the request queues and the
//! fork-safe agent thread.
//!
//! # Examples
//!
//! ```
//! use probekit::{ArgVec, EventDescription, EventFlags, MATCH_ALL_KEY};
//! use std::sync::Arc;
//!
//! fn on_event(
//!     desc: &EventDescription,
//!     _args: &ArgVec,
//!     _priv_data: *mut std::ffi::c_void,
//!     _caller: *const std::ffi::c_void,
//! ) {
//!     assert_eq!(desc.event_name(), "my_event");
//! }
//!
//! let event = Arc::new(EventDescription::new("demo", "my_event", EventFlags::empty()));
//! let batch = probekit::register_events(vec![Arc::clone(&event)]).unwrap();
//!
//! probekit::callback_register(&event, on_event, std::ptr::null_mut(), MATCH_ALL_KEY).unwrap();
//! probekit::call(&event, &ArgVec::empty());
//! probekit::callback_unregister(&event, on_event, std::ptr::null_mut(), MATCH_ALL_KEY).unwrap();
//!
//! probekit::unregister_events(batch);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

pub mod callbacks;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod registry;
pub mod statedump;
pub mod types;

pub use callbacks::{
    callback_register, callback_unregister, callback_variadic_register,
    callback_variadic_unregister,
};
pub use dispatch::{call, call_variadic, statedump_call, statedump_call_variadic};
pub use error::{ProbeError, ProbeResult};
pub use keys::request_key;
pub use registry::{
    event_notification_register, event_notification_unregister, register_events,
    unregister_events, EventsHandle, TracerHandle, TracerNotification, TracerNotifyFn,
};
pub use statedump::{
    statedump_begin_event, statedump_end_event, statedump_poll_pending_requests,
    statedump_request, statedump_request_cancel, statedump_request_notification_register,
    statedump_request_notification_unregister, statedump_run_pending_requests, StatedumpFn,
    StatedumpHandle, StatedumpMode, StatedumpRequestKey,
};
pub use types::{
    ArgVec, DynamicStruct, EventCallFn, EventCallVariadicFn, EventDescription, EventFlags,
    EventState, ENABLED_PRIVATE_MASK, ENABLED_PTRACE_BIT, ENABLED_SHARED_MASK,
    ENABLED_USER_EVENT_BIT, FIRST_DYNAMIC_KEY, MATCH_ALL_KEY, PTRACE_KEY, USER_EVENT_KEY,
};

/// Set once [`init`] has completed; the fast path checks it before taking
/// the lazy-init branch.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Set by [`exit`]; registration APIs turn into `Exiting` no-ops and the
/// dispatch path returns silently.
static FINALIZED: AtomicBool = AtomicBool::new(false);

static INIT: Once = Once::new();

/// Initialize the library: install the fork handlers. Lazy and idempotent;
/// every registration entry point and the dispatch path call it on demand,
/// so explicit calls are only needed to front-load the work. Embedders
/// that want constructor/destructor wiring call [`init`]/[`exit`] from
/// their own lifecycle glue.
pub fn init() {
    INIT.call_once(|| {
        let rc = unsafe {
            libc::pthread_atfork(
                Some(statedump::fork_prepare),
                Some(statedump::fork_parent),
                Some(statedump::fork_child),
            )
        };
        if rc != 0 {
            eprintln!("probekit: pthread_atfork failed: {rc}");
            std::process::abort();
        }
        INITIALIZED.store(true, Ordering::Release);
    });
}

/// Finalize the library: unregister every remaining event batch, then turn
/// later registration calls into no-ops. Meant for application exit, where
/// concurrent API use has already ceased.
pub fn exit() {
    if finalized() {
        return;
    }
    while let Some(batch) = registry::take_first_batch() {
        registry::unregister_events_registration(batch);
    }
    FINALIZED.store(true, Ordering::Release);
}

pub(crate) fn ensure_init() {
    if !INITIALIZED.load(Ordering::Acquire) {
        init();
    }
}

pub(crate) fn finalized() -> bool {
    FINALIZED.load(Ordering::Acquire)
}
