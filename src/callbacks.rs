//! Per-event callback table.
//!
//! The attached-callback array is immutable once published. Register and
//! unregister are copy-on-write under the event lock: build a fresh array,
//! publish it with a release store, and hand the old one to the epoch
//! domain so in-flight dispatchers finish walking it before it is freed.
//! The fast path stays allocation-free and lock-free; the O(n) cost lands
//! on the rare registration path.

use std::ffi::c_void;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Owned, Shared};

use crate::error::{ProbeError, ProbeResult};
use crate::registry;
use crate::types::{
    Callback, CallbackFn, CallbackSet, EventCallFn, EventCallVariadicFn, EventDescription,
    EventFlags,
};

/// Attach a callback to a non-variadic event.
pub fn callback_register(
    desc: &EventDescription,
    func: EventCallFn,
    priv_data: *mut c_void,
    key: u64,
) -> ProbeResult<()> {
    if desc.flags().contains(EventFlags::VARIADIC) {
        return Err(ProbeError::Inval);
    }
    register_entry(desc, CallbackFn::Plain(func), priv_data, key)
}

/// Attach a callback to a variadic event.
pub fn callback_variadic_register(
    desc: &EventDescription,
    func: EventCallVariadicFn,
    priv_data: *mut c_void,
    key: u64,
) -> ProbeResult<()> {
    if !desc.flags().contains(EventFlags::VARIADIC) {
        return Err(ProbeError::Inval);
    }
    register_entry(desc, CallbackFn::Variadic(func), priv_data, key)
}

/// Detach a callback from a non-variadic event.
pub fn callback_unregister(
    desc: &EventDescription,
    func: EventCallFn,
    priv_data: *mut c_void,
    key: u64,
) -> ProbeResult<()> {
    if desc.flags().contains(EventFlags::VARIADIC) {
        return Err(ProbeError::Inval);
    }
    unregister_entry(desc, CallbackFn::Plain(func), priv_data, key)
}

/// Detach a callback from a variadic event.
pub fn callback_variadic_unregister(
    desc: &EventDescription,
    func: EventCallVariadicFn,
    priv_data: *mut c_void,
    key: u64,
) -> ProbeResult<()> {
    if !desc.flags().contains(EventFlags::VARIADIC) {
        return Err(ProbeError::Inval);
    }
    unregister_entry(desc, CallbackFn::Variadic(func), priv_data, key)
}

fn register_entry(
    desc: &EventDescription,
    func: CallbackFn,
    priv_data: *mut c_void,
    key: u64,
) -> ProbeResult<()> {
    if crate::finalized() {
        return Err(ProbeError::Exiting);
    }
    crate::ensure_init();
    let _lock = registry::lock_events();
    let state = desc.state();
    let old_nr = state.nr_callbacks.load(Ordering::Relaxed);
    if old_nr == u32::MAX {
        return Err(ProbeError::Inval);
    }
    let guard = epoch::pin();
    let current = state.callbacks.load(Ordering::Acquire, &guard);
    let old_entries: &[Callback] = match unsafe { current.as_ref() } {
        Some(set) => &set.entries,
        None => &[],
    };
    if old_entries
        .iter()
        .any(|entry| entry.matches(&func, priv_data, key))
    {
        return Err(ProbeError::Exist);
    }
    let mut entries = Vec::with_capacity(old_entries.len() + 1);
    entries.extend_from_slice(old_entries);
    entries.push(Callback {
        func,
        priv_data,
        key,
    });
    let previous = state
        .callbacks
        .swap(Owned::new(CallbackSet::new(entries)), Ordering::Release, &guard);
    if !previous.is_null() {
        // Reclaimed after every dispatcher that could still hold it has
        // left its read-side section.
        unsafe { guard.defer_destroy(previous) };
    }
    guard.flush();
    state.nr_callbacks.store(old_nr + 1, Ordering::Relaxed);
    if old_nr == 0 {
        // Kernel tracers update the top bits concurrently; stick to RMW.
        state.enabled.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn unregister_entry(
    desc: &EventDescription,
    func: CallbackFn,
    priv_data: *mut c_void,
    key: u64,
) -> ProbeResult<()> {
    if crate::finalized() {
        return Err(ProbeError::Exiting);
    }
    crate::ensure_init();
    let _lock = registry::lock_events();
    let state = desc.state();
    let guard = epoch::pin();
    let current = state.callbacks.load(Ordering::Acquire, &guard);
    let old_entries: &[Callback] = match unsafe { current.as_ref() } {
        Some(set) => &set.entries,
        None => &[],
    };
    let Some(remove_idx) = old_entries
        .iter()
        .position(|entry| entry.matches(&func, priv_data, key))
    else {
        return Err(ProbeError::NoEnt);
    };
    let old_nr = state.nr_callbacks.load(Ordering::Relaxed);
    let previous = if old_nr == 1 {
        state
            .callbacks
            .swap(Shared::null(), Ordering::Release, &guard)
    } else {
        let mut entries = Vec::with_capacity(old_entries.len() - 1);
        entries.extend_from_slice(&old_entries[..remove_idx]);
        entries.extend_from_slice(&old_entries[remove_idx + 1..]);
        state
            .callbacks
            .swap(Owned::new(CallbackSet::new(entries)), Ordering::Release, &guard)
    };
    if !previous.is_null() {
        unsafe { guard.defer_destroy(previous) };
    }
    guard.flush();
    state.nr_callbacks.store(old_nr - 1, Ordering::Relaxed);
    if old_nr == 1 {
        state.enabled.fetch_sub(1, Ordering::Relaxed);
    }
    Ok(())
}

/// Clear an event's whole callback table during batch unregistration. The
/// batch is unreachable by contract at this point, but the old array still
/// goes through the epoch domain; deferral costs nothing here and keeps a
/// single reclamation rule.
pub(crate) fn remove_all(desc: &EventDescription) {
    let state = desc.state();
    if state.nr_callbacks.load(Ordering::Relaxed) == 0 {
        return;
    }
    state.enabled.fetch_sub(1, Ordering::Relaxed);
    state.nr_callbacks.store(0, Ordering::Relaxed);
    let guard = epoch::pin();
    let previous = state
        .callbacks
        .swap(Shared::null(), Ordering::Release, &guard);
    if !previous.is_null() {
        unsafe { guard.defer_destroy(previous) };
    }
    guard.flush();
}
