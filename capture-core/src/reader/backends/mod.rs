//! Reader event implementations
//!
//! - `ChannelEvent`: crossbeam channel with room for one token. The default.
//! - `CondvarEvent`: parking_lot mutex and condition variable
//!
//! Both coalesce: any number of signals before a wait leave one wakeup.

mod channel;
mod condvar;

pub use channel::ChannelEvent;
pub use condvar::CondvarEvent;
