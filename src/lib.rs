//! Asynchronous SMS Modem Engine
//!
//! A non-blocking, poll-driven driver for serial AT-command SMS modems.
//! The host loop calls [`ModemEngine::poll`] at a sub-second cadence and
//! the engine walks its initialization pipeline, speed probing, inbound
//! message capture and chunked outbound sends without ever sleeping.

pub mod codec;
pub mod core;
pub mod engine;
pub mod hardware;
pub mod sms;

// Re-export commonly used types
pub use codec::{CodecError, CodecResult, InboundSms, MockCodec, OutboundPdu, PartInfo, SmsCodec};
pub use core::clock::{Clock, ManualClock, MonotonicClock};
pub use core::types::{
    ConfigError, EngineConfig, RestartReason, RestartStatus, SessionCounters, SessionState,
    SmsRecord,
};
pub use engine::{ModemEngine, RequestError, Step};
pub use hardware::{LinkError, LinkResult, MockLink, ModemLink};
pub use sms::{ChunkPlan, SmsEncoding};
