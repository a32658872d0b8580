//! Error types for the probekit instrumentation core.

use std::fmt;

/// Errors surfaced by registration and state-dump operations.
///
/// The discriminants form a stable numeric contract with out-of-process
/// consumers (`0` is reserved for success and carried by `Ok(())`).
///
/// # Examples
///
/// ```
/// use probekit::{ProbeError, ProbeResult};
///
/// let ok: ProbeResult<()> = Ok(());
/// let dup: ProbeResult<()> = Err(ProbeError::Exist);
///
/// assert!(ok.is_ok());
/// assert_eq!(dup.unwrap_err() as u32, 2);
/// assert_eq!(ProbeError::Exist.to_string(), "Callback already registered");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProbeError {
    /// Invalid argument (variadic mismatch, reserved key, counter overflow)
    Inval = 1,
    /// A callback with the same (function, private data, key) tuple exists
    Exist = 2,
    /// Resource exhaustion
    NoMem = 3,
    /// No such callback registered on this event
    NoEnt = 4,
    /// The library has been finalized; registration is no longer possible
    Exiting = 5,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Inval => write!(f, "Invalid argument"),
            ProbeError::Exist => write!(f, "Callback already registered"),
            ProbeError::NoMem => write!(f, "Out of memory"),
            ProbeError::NoEnt => write!(f, "No such callback"),
            ProbeError::Exiting => write!(f, "Library is exiting"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Result type for probekit operations
pub type ProbeResult<T> = Result<T, ProbeError>;
