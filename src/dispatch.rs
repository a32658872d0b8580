//! The dispatch fast path.
//!
//! Every event call takes one relaxed load of the enable word, and only
//! when a tracer is attached pins the epoch domain, walks the published
//! callback array and invokes each entry matching the dispatch key. No
//! locks, no allocation, no blocking; registration publishes replacement
//! arrays and the epoch domain keeps the one being walked alive.

use std::ptr;

use crossbeam_epoch as epoch;

use crate::statedump::StatedumpRequestKey;
use crate::types::{
    ArgVec, CallbackFn, DynamicStruct, EventDescription, EventFlags, ENABLED_PTRACE_BIT,
    ENABLED_SHARED_MASK, ENABLED_USER_EVENT_BIT, MATCH_ALL_KEY, PTRACE_KEY, USER_EVENT_KEY,
};

/// Call a non-variadic event, dispatching to every attached callback.
pub fn call(desc: &EventDescription, args: &ArgVec) {
    dispatch_plain(desc, args, MATCH_ALL_KEY);
}

/// Call a variadic event.
pub fn call_variadic(desc: &EventDescription, args: &ArgVec, var: &DynamicStruct) {
    dispatch_variadic(desc, args, var, MATCH_ALL_KEY);
}

/// Call a non-variadic event from inside a state-dump producer callback.
/// The borrowed request key scopes the dispatch to the tracer(s) that asked
/// for the dump; it is only valid for the duration of that callback.
pub fn statedump_call(desc: &EventDescription, args: &ArgVec, key: &StatedumpRequestKey) {
    dispatch_plain(desc, args, key.value());
}

/// Variadic twin of [`statedump_call`].
pub fn statedump_call_variadic(
    desc: &EventDescription,
    args: &ArgVec,
    var: &DynamicStruct,
    key: &StatedumpRequestKey,
) {
    dispatch_variadic(desc, args, var, key.value());
}

fn dispatch_plain(desc: &EventDescription, args: &ArgVec, key: u64) {
    if crate::finalized() {
        return;
    }
    crate::ensure_init();
    check_event_state(desc);
    if desc.flags().contains(EventFlags::VARIADIC) {
        fatal_variadic_mismatch(desc, "non-variadic");
    }
    // Return-address capture has no stable primitive on this target; the
    // slot stays in the callback signature and carries null.
    let caller = ptr::null();
    shared_bits_hooks(desc, args, key);
    let guard = epoch::pin();
    let set = desc.state().callbacks.load_consume(&guard);
    if let Some(set) = unsafe { set.as_ref() } {
        for entry in set.entries.iter() {
            if key != MATCH_ALL_KEY && entry.key != MATCH_ALL_KEY && entry.key != key {
                continue;
            }
            if let CallbackFn::Plain(func) = entry.func {
                func(desc, args, entry.priv_data, caller);
            }
        }
    }
    drop(guard);
}

fn dispatch_variadic(desc: &EventDescription, args: &ArgVec, var: &DynamicStruct, key: u64) {
    if crate::finalized() {
        return;
    }
    crate::ensure_init();
    check_event_state(desc);
    if !desc.flags().contains(EventFlags::VARIADIC) {
        fatal_variadic_mismatch(desc, "variadic");
    }
    let caller = ptr::null();
    shared_bits_hooks(desc, args, key);
    let guard = epoch::pin();
    let set = desc.state().callbacks.load_consume(&guard);
    if let Some(set) = unsafe { set.as_ref() } {
        for entry in set.entries.iter() {
            if key != MATCH_ALL_KEY && entry.key != MATCH_ALL_KEY && entry.key != key {
                continue;
            }
            if let CallbackFn::Variadic(func) = entry.func {
                func(desc, args, var, entry.priv_data, caller);
            }
        }
    }
    drop(guard);
}

/// Kernel-side tracers flip the top bits of the enable word; when any of
/// them is set, run the matching hook under the reserved-key gates.
#[inline]
fn shared_bits_hooks(desc: &EventDescription, args: &ArgVec, key: u64) {
    let enabled = desc.state().enabled_bits();
    if enabled & ENABLED_SHARED_MASK == 0 {
        return;
    }
    if enabled & ENABLED_USER_EVENT_BIT != 0 && (key == MATCH_ALL_KEY || key == USER_EVENT_KEY) {
        user_event_write(desc, args);
    }
    if enabled & ENABLED_PTRACE_BIT != 0 && (key == MATCH_ALL_KEY || key == PTRACE_KEY) {
        ptrace_hook();
    }
}

#[inline]
fn check_event_state(desc: &EventDescription) {
    if desc.state().version() != 0 {
        fatal_incompatible_state(desc);
    }
}

fn user_event_write(_desc: &EventDescription, _args: &ArgVec) {
    // TODO: forward to the kernel user_events file descriptor once the
    // kernel integration lands.
}

/// Deliberately empty and never inlined: debuggers plant a breakpoint on
/// this symbol to observe ptrace-keyed event calls.
#[inline(never)]
fn ptrace_hook() {}

/// A non-zero state version means the event was emitted by a newer,
/// forward-incompatible producer. Silently dropping or misreading it could
/// corrupt every downstream tracer, so the process stops here.
#[cold]
fn fatal_incompatible_state(desc: &EventDescription) -> ! {
    eprintln!(
        "probekit: incompatible state version {} for event {}:{}",
        desc.state().version(),
        desc.provider_name(),
        desc.event_name()
    );
    std::process::abort();
}

#[cold]
fn fatal_variadic_mismatch(desc: &EventDescription, entry_point: &str) -> ! {
    eprintln!(
        "probekit: event {}:{} dispatched through the {} entry point",
        desc.provider_name(),
        desc.event_name(),
        entry_point
    );
    std::process::abort();
}
