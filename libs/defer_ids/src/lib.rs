//! Small identifiers and time abstractions shared between the deletion engine
//! and anything embedding it.
//!
//! Kept as its own crate, in the manner of `libs/utils`, so that callers who
//! only need to construct keys or drive the clock in tests don't have to pull
//! in the whole engine.

mod clock;
mod ids;

pub use clock::{Clock, SystemClock, TestClock};
pub use ids::{ServiceUuid, VmId};
