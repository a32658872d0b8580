//! Dispatch-key allocator.
//!
//! Keys pair a tracer's callbacks with the state-dump requests it issues.
//! They come from a single monotonic counter and are never recycled; the
//! low range is reserved for the match-all, user-event and ptrace channels.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{ProbeError, ProbeResult};
use crate::types::FIRST_DYNAMIC_KEY;

static NEXT_KEY: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(FIRST_DYNAMIC_KEY));

/// Allocate a unique dispatch key.
///
/// Returns `NoMem` once the 64-bit counter has wrapped to zero; with one
/// allocation per nanosecond that takes several centuries, but the failure
/// mode is defined rather than handing out reserved keys.
pub fn request_key() -> ProbeResult<u64> {
    let mut next = NEXT_KEY.lock();
    if *next == 0 {
        return Err(ProbeError::NoMem);
    }
    let key = *next;
    *next = next.wrapping_add(1);
    Ok(key)
}
