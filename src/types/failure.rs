//! Operation failure taxonomy and the diagnostic outcome probe.

use core::fmt;

use super::Exception;

/// Why a blocking channel operation failed.
///
/// Failures surface to the direct caller of the operation; the runtime never
/// retries, and a failed rendezvous leaves the wait-queues and run-queue
/// consistent so scheduling continues.
#[derive(Clone, Debug, PartialEq)]
pub enum Failure {
    /// The calling tasklet was killed, or had an exception injected, while
    /// blocked in the operation.
    Interrupted,
    /// The matched counterpart was killed before the rendezvous completed.
    PartnerKilled,
    /// The matched sender threw: this exception is raised at the receiver's
    /// resumption point in place of a value return.
    Raised(Exception),
    /// The operation was issued from the driving context and can never
    /// complete: no runnable tasklet remains to take the other side.
    Deadlock,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => f.write_str("operation interrupted by kill or injected exception"),
            Self::PartnerKilled => f.write_str("rendezvous partner was killed"),
            Self::Raised(e) => write!(f, "exception raised at resumption point: {e}"),
            Self::Deadlock => f.write_str("blocking operation would deadlock the scheduler"),
        }
    }
}

impl std::error::Error for Failure {}

/// Last observed outcome of a channel operation, for the diagnostic probe.
///
/// Mirrors the classic embedding convention: `0` on success, `-1` when the
/// operation was interrupted or the partner was dead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutcomeCode {
    /// The last operation completed its rendezvous.
    #[default]
    Success,
    /// The last operation failed.
    Failed,
}

impl OutcomeCode {
    /// The numeric probe value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed => -1,
        }
    }
}
