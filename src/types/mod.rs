//! Core types: identifiers, payloads, exceptions, failures.

mod exception;
mod failure;
mod id;
mod value;

pub use exception::{Exception, ExceptionKind, Traceback};
pub use failure::{Failure, OutcomeCode};
pub use id::{ChannelId, TaskletId};
pub use value::{BodyFuture, TaskletBody, Value};
