//! Core types, constants and the clock abstraction

pub mod clock;
pub mod constants;
pub mod types;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use types::*;
