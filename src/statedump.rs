//! State-dump request machinery.
//!
//! A producer that can replay its current state registers a request handle;
//! tracers then ask for dumps by key. Each handle carries a FIFO of pending
//! request keys, serviced either by the producer polling explicitly or by a
//! process-singleton agent thread shared by every agent-mode handle. Each
//! dump is bracketed by synthetic begin/end marker events dispatched with
//! the request key, so tracers can frame the burst of replayed calls.
//!
//! The handle list is published through an [`ArcSwap`] snapshot so the
//! agent thread iterates it without taking the state-dump lock; handle
//! memory is reclaimed once the last snapshot referencing it drops. The
//! agent survives `fork()` through atfork handlers that pause it around
//! the fork and respawn it in the child.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::dispatch;
use crate::error::{ProbeError, ProbeResult};
use crate::registry::{self, EventsHandle};
use crate::types::{ArgVec, EventDescription, EventFlags, MATCH_ALL_KEY};

/// How a producer's pending dump requests get serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatedumpMode {
    /// The producer polls and runs pending requests on its own threads.
    Polling,
    /// The shared agent thread services requests in the background.
    AgentThread,
}

/// Key of one in-flight dump request. Producer callbacks receive it by
/// reference and thread it through [`crate::statedump_call`]; the borrow
/// ends with the callback, which is what scopes the key to the dump being
/// produced.
pub struct StatedumpRequestKey(u64);

impl StatedumpRequestKey {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// State-dump producer callback, invoked once per pending request.
pub type StatedumpFn = fn(&StatedumpRequestKey);

struct PendingState {
    queue: VecDeque<u64>,
    /// A spliced batch is still being replayed. Registration's synchronous
    /// initial dump waits for this, not just for queue emptiness.
    running: bool,
}

pub(crate) struct StatedumpRegistration {
    name: Box<str>,
    cb: StatedumpFn,
    mode: StatedumpMode,
    pending: Mutex<PendingState>,
    drained: Condvar,
}

/// Handle to a registered state-dump producer.
pub struct StatedumpHandle(Arc<StatedumpRegistration>);

/// The state-dump lock: guards the handle list and serializes request
/// fan-out against handle registration.
static STATEDUMP_LIST: Lazy<Mutex<Vec<Arc<StatedumpRegistration>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Read-mostly snapshot of the handle list, republished on every mutation.
/// The agent thread iterates this without touching the state-dump lock.
static STATEDUMP_VIEW: Lazy<ArcSwap<Vec<Arc<StatedumpRegistration>>>> =
    Lazy::new(|| ArcSwap::from_pointee(Vec::new()));

fn publish_view(list: &[Arc<StatedumpRegistration>]) {
    STATEDUMP_VIEW.store(Arc::new(list.to_vec()));
}

bitflags! {
    /// Agent thread control word. Empty means blocked/idle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct AgentState: u32 {
        const HANDLE_REQUEST = 1 << 0;
        const EXIT = 1 << 1;
        const PAUSE = 1 << 2;
        const PAUSE_ACK = 1 << 3;
    }
}

struct AgentShared {
    state: AtomicU32,
    sleep: Mutex<()>,
    worker: Condvar,
}

static AGENT_SHARED: Lazy<AgentShared> = Lazy::new(|| AgentShared {
    state: AtomicU32::new(AgentState::empty().bits()),
    sleep: Mutex::new(()),
    worker: Condvar::new(),
});

struct AgentControl {
    users: usize,
    worker: Option<JoinHandle<()>>,
}

/// The agent-thread lock: refcount and spawn/join. Ordered strictly
/// outside the state-dump lock, and held across fork().
static AGENT_CONTROL: Lazy<Mutex<AgentControl>> = Lazy::new(|| {
    Mutex::new(AgentControl {
        users: 0,
        worker: None,
    })
});

static STATEDUMP_BEGIN: Lazy<Arc<EventDescription>> = Lazy::new(|| {
    Arc::new(EventDescription::new(
        "probekit",
        "statedump_begin",
        EventFlags::empty(),
    ))
});

static STATEDUMP_END: Lazy<Arc<EventDescription>> = Lazy::new(|| {
    Arc::new(EventDescription::new(
        "probekit",
        "statedump_end",
        EventFlags::empty(),
    ))
});

static MARKER_HANDLE: Lazy<Mutex<Option<EventsHandle>>> = Lazy::new(|| Mutex::new(None));

/// The begin-marker event bracketing every replayed dump. Tracers attach
/// to it like to any other event; its argument vector points at the UTF-8
/// bytes of the producer name.
pub fn statedump_begin_event() -> Arc<EventDescription> {
    Arc::clone(&STATEDUMP_BEGIN)
}

/// The end-marker event; see [`statedump_begin_event`].
pub fn statedump_end_event() -> Arc<EventDescription> {
    Arc::clone(&STATEDUMP_END)
}

/// The marker events go through the ordinary batch registration so tracers
/// discover them via insert notifications.
fn ensure_marker_events() {
    let mut handle = MARKER_HANDLE.lock();
    if handle.is_none() {
        *handle = registry::register_events(vec![
            Arc::clone(&STATEDUMP_BEGIN),
            Arc::clone(&STATEDUMP_END),
        ]);
    }
}

/// Register a state-dump producer under `name`.
///
/// An initial match-all dump request is queued immediately so every
/// already-attached tracer gets a baseline. In agent-thread mode the call
/// blocks until that initial dump has fully drained, and the first
/// agent-mode handle in the process spawns the agent thread.
///
/// Returns `None` after [`crate::exit`].
pub fn statedump_request_notification_register(
    name: &str,
    cb: StatedumpFn,
    mode: StatedumpMode,
) -> Option<StatedumpHandle> {
    if crate::finalized() {
        return None;
    }
    crate::ensure_init();
    ensure_marker_events();
    let registration = Arc::new(StatedumpRegistration {
        name: Box::from(name),
        cb,
        mode,
        pending: Mutex::new(PendingState {
            queue: VecDeque::new(),
            running: false,
        }),
        drained: Condvar::new(),
    });
    let mut agent_guard = (mode == StatedumpMode::AgentThread).then(|| AGENT_CONTROL.lock());
    {
        let mut list = STATEDUMP_LIST.lock();
        if let Some(control) = agent_guard.as_deref_mut() {
            control.users += 1;
            if control.users == 1 {
                control.worker = Some(spawn_agent());
            }
        }
        list.push(Arc::clone(&registration));
        publish_view(&list);
        registration.pending.lock().queue.push_back(MATCH_ALL_KEY);
        if mode == StatedumpMode::AgentThread {
            kick_agent();
        }
    }
    drop(agent_guard);
    if mode == StatedumpMode::AgentThread {
        let mut pending = registration.pending.lock();
        while !pending.queue.is_empty() || pending.running {
            registration.drained.wait(&mut pending);
        }
    }
    Some(StatedumpHandle(registration))
}

/// Unregister a state-dump producer, discarding its queued requests. The
/// last agent-mode handle shuts the agent thread down and joins it.
pub fn statedump_request_notification_unregister(handle: StatedumpHandle) {
    if crate::finalized() {
        return;
    }
    let registration = handle.0;
    let mut agent_guard =
        (registration.mode == StatedumpMode::AgentThread).then(|| AGENT_CONTROL.lock());
    let mut join = None;
    {
        let mut list = STATEDUMP_LIST.lock();
        registration.pending.lock().queue.clear();
        list.retain(|other| !Arc::ptr_eq(other, &registration));
        publish_view(&list);
        if let Some(control) = agent_guard.as_deref_mut() {
            control.users -= 1;
            if control.users == 0 {
                AGENT_SHARED
                    .state
                    .fetch_or(AgentState::EXIT.bits(), Ordering::AcqRel);
                wake_agent();
                join = control.worker.take();
            }
        }
    }
    // Join outside the state-dump lock; the agent may need it to finish
    // its current round.
    if let Some(worker) = join {
        if worker.join().is_err() {
            eprintln!("probekit: state-dump agent thread panicked");
            std::process::abort();
        }
    }
    drop(agent_guard);
    // The registration itself is freed once the agent's last published
    // snapshot referencing it is dropped.
}

/// Whether a polling-mode handle has pending requests. Always `false` for
/// agent-thread handles, whose queue belongs to the agent.
pub fn statedump_poll_pending_requests(handle: &StatedumpHandle) -> bool {
    if handle.0.mode != StatedumpMode::Polling {
        return false;
    }
    !handle.0.pending.lock().queue.is_empty()
}

/// Run a polling-mode handle's pending requests on the calling thread.
pub fn statedump_run_pending_requests(handle: &StatedumpHandle) -> ProbeResult<()> {
    if handle.0.mode != StatedumpMode::Polling {
        return Err(ProbeError::Inval);
    }
    run_pending(&handle.0);
    Ok(())
}

/// Ask every registered producer for a dump scoped to `key`.
pub fn statedump_request(key: u64) -> ProbeResult<()> {
    if key == MATCH_ALL_KEY {
        return Err(ProbeError::Inval);
    }
    if crate::finalized() {
        return Err(ProbeError::Exiting);
    }
    crate::ensure_init();
    let list = STATEDUMP_LIST.lock();
    let mut kick = false;
    for registration in list.iter() {
        registration.pending.lock().queue.push_back(key);
        if registration.mode == StatedumpMode::AgentThread {
            kick = true;
        }
    }
    if kick {
        kick_agent();
    }
    Ok(())
}

/// Discard every not-yet-serviced request for `key` across all handles.
pub fn statedump_request_cancel(key: u64) -> ProbeResult<()> {
    if key == MATCH_ALL_KEY {
        return Err(ProbeError::Inval);
    }
    if crate::finalized() {
        return Err(ProbeError::Exiting);
    }
    crate::ensure_init();
    let list = STATEDUMP_LIST.lock();
    for registration in list.iter() {
        registration
            .pending
            .lock()
            .queue
            .retain(|pending| *pending != key);
    }
    Ok(())
}

/// Splice the handle's queue and replay each request in FIFO order,
/// bracketing the producer callback with the begin/end markers dispatched
/// under the request key. Queue locks are dropped before any callback runs.
fn run_pending(registration: &StatedumpRegistration) {
    let batch: Vec<u64> = {
        let mut pending = registration.pending.lock();
        if pending.queue.is_empty() {
            Vec::new()
        } else {
            pending.running = true;
            pending.queue.drain(..).collect()
        }
    };
    for key in batch {
        let request = StatedumpRequestKey(key);
        emit_marker(&STATEDUMP_BEGIN, &registration.name, &request);
        (registration.cb)(&request);
        emit_marker(&STATEDUMP_END, &registration.name, &request);
    }
    let mut pending = registration.pending.lock();
    pending.running = false;
    drop(pending);
    registration.drained.notify_all();
}

fn emit_marker(desc: &EventDescription, name: &str, request: &StatedumpRequestKey) {
    let args = ArgVec::new(name.as_ptr().cast(), name.len() as u32);
    dispatch::statedump_call(desc, &args, request);
}

fn spawn_agent() -> JoinHandle<()> {
    // Fresh control word; a previous agent may have left EXIT behind.
    AGENT_SHARED
        .state
        .store(AgentState::empty().bits(), Ordering::Release);
    match thread::Builder::new()
        .name("probekit-statedump".into())
        .spawn(agent_main)
    {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("probekit: failed to spawn state-dump agent thread: {err}");
            std::process::abort();
        }
    }
}

fn agent_state() -> AgentState {
    AgentState::from_bits_truncate(AGENT_SHARED.state.load(Ordering::Acquire))
}

/// Flag a new request and wake the agent. Callers hold the state-dump
/// lock, which orders the flag against agent respawn.
fn kick_agent() {
    AGENT_SHARED
        .state
        .fetch_or(AgentState::HANDLE_REQUEST.bits(), Ordering::AcqRel);
    wake_agent();
}

fn wake_agent() {
    // Taking the sleep lock closes the gap between the agent's state check
    // and its wait; the notify itself needs no lock.
    drop(AGENT_SHARED.sleep.lock());
    AGENT_SHARED.worker.notify_all();
}

fn agent_main() {
    loop {
        {
            let mut sleep = AGENT_SHARED.sleep.lock();
            while agent_state().is_empty() {
                AGENT_SHARED.worker.wait(&mut sleep);
            }
        }
        let state = agent_state();
        if state.contains(AgentState::EXIT) {
            return;
        }
        if state.contains(AgentState::PAUSE) {
            AGENT_SHARED
                .state
                .fetch_or(AgentState::PAUSE_ACK.bits(), Ordering::AcqRel);
            spin_until(|| !agent_state().contains(AgentState::PAUSE));
            continue;
        }
        AGENT_SHARED
            .state
            .fetch_and(!AgentState::HANDLE_REQUEST.bits(), Ordering::AcqRel);
        // The snapshot guard is this reader's grace period: handles stay
        // alive for the whole round even if unregistered meanwhile.
        // Polling handles keep their queue; their producer drains it.
        let view = STATEDUMP_VIEW.load();
        for registration in view.iter() {
            if registration.mode == StatedumpMode::AgentThread {
                run_pending(registration);
            }
        }
    }
}

const PAUSE_SPIN_ATTEMPTS: u32 = 128;

/// Bounded CPU-relax spin, then 1 ms sleeps. Used on both sides of the
/// PAUSE/PAUSE_ACK handshake, where a condvar would mean waiting on state
/// that crosses fork().
fn spin_until(cond: impl Fn() -> bool) {
    for _ in 0..PAUSE_SPIN_ATTEMPTS {
        if cond() {
            return;
        }
        std::hint::spin_loop();
    }
    while !cond() {
        thread::sleep(Duration::from_millis(1));
    }
}

/// atfork prepare: hold the agent lock across the fork and park the agent
/// in its pause spin so no thread is mid-statedump when the address space
/// is duplicated.
pub(crate) extern "C" fn fork_prepare() {
    let control = AGENT_CONTROL.lock();
    let users = control.users;
    // Stays locked until the parent/child handler releases it.
    mem::forget(control);
    if users == 0 {
        return;
    }
    AGENT_SHARED
        .state
        .fetch_or(AgentState::PAUSE.bits(), Ordering::AcqRel);
    wake_agent();
    spin_until(|| agent_state().contains(AgentState::PAUSE_ACK));
}

pub(crate) extern "C" fn fork_parent() {
    AGENT_SHARED.state.fetch_and(
        !(AgentState::PAUSE | AgentState::PAUSE_ACK).bits(),
        Ordering::AcqRel,
    );
    unsafe { AGENT_CONTROL.force_unlock() };
}

/// atfork child: the agent thread did not survive the fork. Reset its
/// control word and respawn it if any agent-mode handle is still
/// registered. parking_lot primitives hold no kernel state, so resetting
/// the atomic word is the whole reinitialization.
pub(crate) extern "C" fn fork_child() {
    let control = unsafe { &mut *AGENT_CONTROL.data_ptr() };
    AGENT_SHARED
        .state
        .store(AgentState::empty().bits(), Ordering::Release);
    if control.users > 0 {
        control.worker = Some(spawn_agent());
    }
    unsafe { AGENT_CONTROL.force_unlock() };
}
