//! The agent thread does not survive fork(); the atfork handlers respawn
//! it in the child, where state-dump requests must keep working. Kept as
//! the only test in this binary so no unrelated test thread forks along.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use probekit::{StatedumpMode, StatedumpRequestKey, MATCH_ALL_KEY};

static DUMPED: Lazy<Mutex<Vec<u64>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn forked_producer(key: &StatedumpRequestKey) {
    DUMPED.lock().push(key.value());
}

fn wait_for_key(key: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if DUMPED.lock().contains(&key) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn agent_thread_survives_fork() {
    let handle = probekit::statedump_request_notification_register(
        "forked",
        forked_producer,
        StatedumpMode::AgentThread,
    )
    .unwrap();
    // Initial dump completed synchronously, so the agent is idle and holds
    // no locks when we fork.
    assert!(DUMPED.lock().contains(&MATCH_ALL_KEY));

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        // Child: a fresh agent must service a fresh request.
        let ok = probekit::statedump_request(9).is_ok() && wait_for_key(9);
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }

    let mut status = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
        "child reported failure: {status}"
    );

    // The parent's agent was only paused around the fork.
    probekit::statedump_request(11).unwrap();
    assert!(wait_for_key(11));

    probekit::statedump_request_notification_unregister(handle);
}
