//! Hardware abstraction for the modem byte transport
//!
//! The engine drives any [`ModemLink`] implementation; the real serial
//! port (or network bridge) lives outside this crate. [`MockLink`] backs
//! the test suite.

pub mod error;
pub mod link;
pub mod mock;

pub use error::{LinkError, LinkResult};
pub use link::{speed_changed, ModemLink};
pub use mock::MockLink;
