//! Event-batch and tracer-notification registry.
//!
//! Two lists guarded by one recursive lock (the event lock): the batches of
//! registered events and the tracers subscribed to insert/remove
//! notifications. The lock is recursive because notification callbacks may
//! legitimately re-enter every registration API, for example to attach a
//! callback to an event they were just told about. Mutation happens inside
//! short `RefCell` borrows; callbacks run with the lock held but no borrow
//! active, so re-entry is safe.

use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::callbacks;
use crate::types::EventDescription;

/// Notification fanned out to tracers when event batches come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerNotification {
    InsertEvents,
    RemoveEvents,
}

/// Tracer notification callback: notification kind, the affected batch,
/// and the private data the tracer registered with.
pub type TracerNotifyFn = fn(TracerNotification, &[Arc<EventDescription>], *mut c_void);

pub(crate) struct EventsRegistration {
    pub(crate) events: Box<[Arc<EventDescription>]>,
}

pub(crate) struct TracerRegistration {
    notify: TracerNotifyFn,
    priv_data: *mut c_void,
}

// Tracer private data is opaque context; subscribing asserts it may be used
// from whichever thread drives a registration operation.
unsafe impl Send for TracerRegistration {}
unsafe impl Sync for TracerRegistration {}

/// Handle to a registered event batch; consumed by [`unregister_events`].
pub struct EventsHandle(pub(crate) Arc<EventsRegistration>);

/// Handle to a tracer notification subscription; consumed by
/// [`event_notification_unregister`].
pub struct TracerHandle(Arc<TracerRegistration>);

pub(crate) struct Registry {
    events: Vec<Arc<EventsRegistration>>,
    tracers: Vec<Arc<TracerRegistration>>,
}

static EVENT_LOCK: Lazy<ReentrantMutex<RefCell<Registry>>> = Lazy::new(|| {
    ReentrantMutex::new(RefCell::new(Registry {
        events: Vec::new(),
        tracers: Vec::new(),
    }))
});

/// The event lock also serializes per-event callback-table updates.
pub(crate) fn lock_events() -> ReentrantMutexGuard<'static, RefCell<Registry>> {
    EVENT_LOCK.lock()
}

/// Register a batch of events and announce it to every subscribed tracer.
///
/// Returns `None` after [`crate::exit`].
pub fn register_events(events: Vec<Arc<EventDescription>>) -> Option<EventsHandle> {
    if crate::finalized() {
        return None;
    }
    crate::ensure_init();
    let registration = Arc::new(EventsRegistration {
        events: events.into_boxed_slice(),
    });
    let guard = lock_events();
    let tracers = {
        let mut registry = guard.borrow_mut();
        registry.events.push(Arc::clone(&registration));
        registry.tracers.clone()
    };
    for tracer in &tracers {
        (tracer.notify)(
            TracerNotification::InsertEvents,
            &registration.events,
            tracer.priv_data,
        );
    }
    drop(guard);
    Some(EventsHandle(registration))
}

/// Unregister an event batch: announce the removal, then clear each event's
/// callback table. The caller guarantees the batch's instrumentation is
/// unreachable by the time this is called.
pub fn unregister_events(handle: EventsHandle) {
    if crate::finalized() {
        return;
    }
    crate::ensure_init();
    unregister_events_registration(handle.0);
}

pub(crate) fn unregister_events_registration(registration: Arc<EventsRegistration>) {
    let guard = lock_events();
    let tracers = {
        let mut registry = guard.borrow_mut();
        registry
            .events
            .retain(|batch| !Arc::ptr_eq(batch, &registration));
        registry.tracers.clone()
    };
    for tracer in &tracers {
        (tracer.notify)(
            TracerNotification::RemoveEvents,
            &registration.events,
            tracer.priv_data,
        );
    }
    for event in registration.events.iter() {
        callbacks::remove_all(event);
    }
    drop(guard);
}

/// Subscribe to event-batch notifications. The new subscriber is
/// immediately replayed an `InsertEvents` for every batch registered so
/// far, so it observes the same sequence as a tracer that was present from
/// the start.
pub fn event_notification_register(
    notify: TracerNotifyFn,
    priv_data: *mut c_void,
) -> Option<TracerHandle> {
    if crate::finalized() {
        return None;
    }
    crate::ensure_init();
    let registration = Arc::new(TracerRegistration { notify, priv_data });
    let guard = lock_events();
    let batches = {
        let mut registry = guard.borrow_mut();
        registry.tracers.push(Arc::clone(&registration));
        registry.events.clone()
    };
    for batch in &batches {
        notify(TracerNotification::InsertEvents, &batch.events, priv_data);
    }
    drop(guard);
    Some(TracerHandle(registration))
}

/// Drop a notification subscription, replaying `RemoveEvents` for every
/// still-registered batch so the tracer can tear down symmetrically.
pub fn event_notification_unregister(handle: TracerHandle) {
    if crate::finalized() {
        return;
    }
    crate::ensure_init();
    let registration = handle.0;
    let guard = lock_events();
    let batches = guard.borrow().events.clone();
    for batch in &batches {
        (registration.notify)(
            TracerNotification::RemoveEvents,
            &batch.events,
            registration.priv_data,
        );
    }
    guard
        .borrow_mut()
        .tracers
        .retain(|tracer| !Arc::ptr_eq(tracer, &registration));
    drop(guard);
}

/// First still-registered batch, if any. [`crate::exit`] drains the
/// registry through this.
pub(crate) fn take_first_batch() -> Option<Arc<EventsRegistration>> {
    let guard = lock_events();
    let first = guard.borrow().events.first().cloned();
    drop(guard);
    first
}
