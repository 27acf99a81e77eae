//! Outbound command channel
//!
//! - `event_channel`: bounded lock-free MPSC queue, drop accounting, drain loop
//! - `backoff`: producer back-off and consumer idle strategies

pub mod backoff;
pub mod event_channel;

pub use backoff::{Backoff, BackoffPhase, BackoffPolicy, WaitStrategy};
pub use event_channel::{bounded, ChannelConsumer, ChannelStats, DrainExit, EventChannel, SendOutcome};
