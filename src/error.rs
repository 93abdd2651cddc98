//! The public error type for scheduler and channel entry points.

use core::fmt;

use crate::types::Failure;

/// Errors returned by the capability-checked API surface.
///
/// The first four variants are synchronous argument rejections (the
/// `TypeError` family of the embedding surface); [`Error::Failed`] wraps an
/// operation-level [`Failure`].
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The supplied id is not a live channel.
    NotAChannel,
    /// The supplied id is not a live tasklet.
    NotATasklet,
    /// Tasklet creation was given a payload that is not a callable body.
    InvalidCallable,
    /// The target tasklet is not in a state the operation accepts.
    NotRunnable,
    /// The driving context already has a blocking operation in flight.
    Reentrant,
    /// The operation itself failed.
    Failed(Failure),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAChannel => f.write_str("argument is not a channel"),
            Self::NotATasklet => f.write_str("argument is not a tasklet"),
            Self::InvalidCallable => f.write_str("tasklet target is not callable"),
            Self::NotRunnable => f.write_str("tasklet is not runnable"),
            Self::Reentrant => {
                f.write_str("driving context already has a blocking operation in flight")
            }
            Self::Failed(failure) => write!(f, "{failure}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Self::Failed(failure)
    }
}
