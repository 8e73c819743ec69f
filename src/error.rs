use std::fmt;

/// Error taxonomy for the admission core (spec §7).
///
/// Fatal errors (`Validation`, `Disposed`, `Argument`) propagate to the
/// caller. Admission decisions themselves are never errors — see
/// [`crate::token_bucket::Decision`] and friends — only construction-time
/// and lifecycle misuse surface here.
#[derive(Debug)]
pub enum AdmissionError {
    /// Invalid configuration at construction time.
    Validation(String),
    /// A method was called after `dispose()`.
    Disposed,
    /// A required argument was null/empty.
    Argument(String),
    /// `ConcurrencyGate` denied admission.
    ConcurrencyRejected(RejectReason),
    /// A passed cancellation token fired.
    Cancelled,
}

/// Why a [`AdmissionError::ConcurrencyRejected`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No queueing configured and the semaphore had no free slot.
    AtCapacity,
    /// Queueing configured but `queue_max` was already reached.
    QueueFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AtCapacity => write!(f, "at capacity"),
            RejectReason::QueueFull => write!(f, "queue full"),
        }
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Validation(msg) => write!(f, "validation error: {msg}"),
            AdmissionError::Disposed => write!(f, "component has been disposed"),
            AdmissionError::Argument(msg) => write!(f, "argument error: {msg}"),
            AdmissionError::ConcurrencyRejected(reason) => {
                write!(f, "concurrency rejected: {reason}")
            }
            AdmissionError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for AdmissionError {}

pub type Result<T> = std::result::Result<T, AdmissionError>;
