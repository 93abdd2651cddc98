//! Internal records for tasklets and channels.

pub mod channel;
pub mod tasklet;

pub use channel::{ChannelRecord, Payload, SendWaiter, WakePreference};
pub use tasklet::{TaskletRecord, TaskletState};

pub(crate) use tasklet::Resumption;
