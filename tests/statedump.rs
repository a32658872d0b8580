//! State-dump machine: polling bracket, FIFO ordering, cancellation, the
//! synchronous agent-mode initial dump, and keyed dispatch from producer
//! callbacks.
//!
//! Requests fan out to every handle in the process and the marker events
//! are shared, so the tests serialize on one lock and filter the shared
//! logs by producer name.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use probekit::{
    ArgVec, EventDescription, EventFlags, ProbeError, StatedumpMode, StatedumpRequestKey,
    MATCH_ALL_KEY,
};

static SERIAL: Mutex<()> = Mutex::new(());

/// One interleaved log of marker and producer activity, reset per test.
static SEQUENCE: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn marker_name(args: &ArgVec) -> String {
    let bytes =
        unsafe { std::slice::from_raw_parts(args.data() as *const u8, args.len() as usize) };
    String::from_utf8_lossy(bytes).into_owned()
}

fn begin_marker(_d: &EventDescription, args: &ArgVec, _p: *mut c_void, _c: *const c_void) {
    SEQUENCE.lock().push(format!("begin:{}", marker_name(args)));
}

fn end_marker(_d: &EventDescription, args: &ArgVec, _p: *mut c_void, _c: *const c_void) {
    SEQUENCE.lock().push(format!("end:{}", marker_name(args)));
}

fn recording_producer(key: &StatedumpRequestKey) {
    SEQUENCE.lock().push(format!("cb:{}", key.value()));
}

fn attach_markers(key: u64) {
    let begin = probekit::statedump_begin_event();
    let end = probekit::statedump_end_event();
    probekit::callback_register(&begin, begin_marker, std::ptr::null_mut(), key).unwrap();
    probekit::callback_register(&end, end_marker, std::ptr::null_mut(), key).unwrap();
}

fn detach_markers(key: u64) {
    let begin = probekit::statedump_begin_event();
    let end = probekit::statedump_end_event();
    probekit::callback_unregister(&begin, begin_marker, std::ptr::null_mut(), key).unwrap();
    probekit::callback_unregister(&end, end_marker, std::ptr::null_mut(), key).unwrap();
}

fn sequence_for(name: &str) -> Vec<String> {
    let cb_tag = "cb:";
    SEQUENCE
        .lock()
        .iter()
        .filter(|entry| entry.ends_with(&format!(":{name}")) || entry.starts_with(cb_tag))
        .cloned()
        .collect()
}

#[test]
fn polling_initial_dump_is_bracketed() {
    let _serial = SERIAL.lock();
    SEQUENCE.lock().clear();

    let handle = probekit::statedump_request_notification_register(
        "proc",
        recording_producer,
        StatedumpMode::Polling,
    )
    .unwrap();

    // The initial match-all request is queued, not yet run.
    assert!(probekit::statedump_poll_pending_requests(&handle));

    attach_markers(MATCH_ALL_KEY);
    probekit::statedump_run_pending_requests(&handle).unwrap();
    detach_markers(MATCH_ALL_KEY);

    assert!(!probekit::statedump_poll_pending_requests(&handle));
    assert_eq!(
        sequence_for("proc"),
        vec!["begin:proc", "cb:0", "end:proc"]
    );

    probekit::statedump_request_notification_unregister(handle);
}

#[test]
fn cancel_discards_queued_requests() {
    let _serial = SERIAL.lock();
    SEQUENCE.lock().clear();

    let handle = probekit::statedump_request_notification_register(
        "cancelable",
        recording_producer,
        StatedumpMode::Polling,
    )
    .unwrap();
    // Drain the initial dump so only the keyed request is in play.
    probekit::statedump_run_pending_requests(&handle).unwrap();
    SEQUENCE.lock().clear();

    assert_eq!(probekit::statedump_request(MATCH_ALL_KEY), Err(ProbeError::Inval));
    assert_eq!(
        probekit::statedump_request_cancel(MATCH_ALL_KEY),
        Err(ProbeError::Inval)
    );

    probekit::statedump_request(9).unwrap();
    assert!(probekit::statedump_poll_pending_requests(&handle));
    probekit::statedump_request_cancel(9).unwrap();
    assert!(!probekit::statedump_poll_pending_requests(&handle));

    probekit::statedump_run_pending_requests(&handle).unwrap();
    assert!(SEQUENCE.lock().is_empty());

    probekit::statedump_request_notification_unregister(handle);
}

#[test]
fn pending_requests_run_in_fifo_order() {
    let _serial = SERIAL.lock();
    SEQUENCE.lock().clear();

    let handle = probekit::statedump_request_notification_register(
        "fifo",
        recording_producer,
        StatedumpMode::Polling,
    )
    .unwrap();
    probekit::statedump_run_pending_requests(&handle).unwrap();
    SEQUENCE.lock().clear();

    probekit::statedump_request(9).unwrap();
    probekit::statedump_request(12).unwrap();

    // Markers keyed 9 only observe the dump for request 9.
    attach_markers(9);
    probekit::statedump_run_pending_requests(&handle).unwrap();
    detach_markers(9);

    assert_eq!(
        sequence_for("fifo"),
        vec!["begin:fifo", "cb:9", "end:fifo", "cb:12"]
    );

    probekit::statedump_request_notification_unregister(handle);
}

#[test]
fn agent_mode_initial_dump_is_synchronous() {
    let _serial = SERIAL.lock();
    SEQUENCE.lock().clear();

    let handle = probekit::statedump_request_notification_register(
        "agent_sync",
        recording_producer,
        StatedumpMode::AgentThread,
    )
    .unwrap();

    // No explicit run: registration only returned once the initial
    // match-all dump had drained on the agent thread.
    assert!(SEQUENCE.lock().contains(&"cb:0".to_string()));
    // Agent handles report no pollable work.
    assert!(!probekit::statedump_poll_pending_requests(&handle));
    assert_eq!(
        probekit::statedump_run_pending_requests(&handle),
        Err(ProbeError::Inval)
    );

    probekit::statedump_request_notification_unregister(handle);
}

fn wait_for_entry(entry: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if SEQUENCE.lock().iter().any(|logged| logged == entry) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn agent_services_keyed_requests() {
    let _serial = SERIAL.lock();
    SEQUENCE.lock().clear();

    let handle = probekit::statedump_request_notification_register(
        "agent_keyed",
        recording_producer,
        StatedumpMode::AgentThread,
    )
    .unwrap();

    probekit::statedump_request(33).unwrap();
    assert!(wait_for_entry("cb:33"), "agent never serviced request 33");

    probekit::statedump_request_notification_unregister(handle);
}

static KEYED_EVENT: Lazy<Arc<EventDescription>> = Lazy::new(|| {
    Arc::new(EventDescription::new("sd", "keyed_evt", EventFlags::empty()))
});

static KEYED_HITS: Lazy<Mutex<Vec<usize>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn keyed_callback(_d: &EventDescription, _a: &ArgVec, priv_data: *mut c_void, _c: *const c_void) {
    KEYED_HITS.lock().push(priv_data as usize);
}

/// Replays one synthetic call on the keyed event, threading the borrowed
/// request key through the statedump dispatch entry point.
fn keyed_producer(key: &StatedumpRequestKey) {
    probekit::statedump_call(&KEYED_EVENT, &ArgVec::empty(), key);
}

#[test]
fn statedump_dispatch_filters_by_key() {
    let _serial = SERIAL.lock();

    let handle = probekit::statedump_request_notification_register(
        "keyed",
        keyed_producer,
        StatedumpMode::Polling,
    )
    .unwrap();
    // Drain the initial match-all dump before attaching, so only the keyed
    // request below reaches the callbacks.
    probekit::statedump_run_pending_requests(&handle).unwrap();

    probekit::callback_register(&KEYED_EVENT, keyed_callback, 1 as *mut c_void, MATCH_ALL_KEY)
        .unwrap();
    probekit::callback_register(&KEYED_EVENT, keyed_callback, 2 as *mut c_void, 42).unwrap();
    probekit::callback_register(&KEYED_EVENT, keyed_callback, 3 as *mut c_void, 7).unwrap();

    probekit::statedump_request(42).unwrap();
    probekit::statedump_run_pending_requests(&handle).unwrap();

    // Match-all and key-42 callbacks fire; key-7 does not.
    assert_eq!(*KEYED_HITS.lock(), vec![1, 2]);

    probekit::callback_unregister(&KEYED_EVENT, keyed_callback, 1 as *mut c_void, MATCH_ALL_KEY)
        .unwrap();
    probekit::callback_unregister(&KEYED_EVENT, keyed_callback, 2 as *mut c_void, 42).unwrap();
    probekit::callback_unregister(&KEYED_EVENT, keyed_callback, 3 as *mut c_void, 7).unwrap();
    probekit::statedump_request_notification_unregister(handle);
}
