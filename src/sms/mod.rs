//! Outbound text accounting: GSM-7 repertoire and chunk planning

pub mod chunker;
pub mod gsm7;

pub use chunker::{classify, plan, ChunkPlan, SmsEncoding};
