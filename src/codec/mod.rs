//! External PDU codec boundary
//!
//! The binary GSM 03.40/03.38 encoding of a message unit is not
//! implemented in this crate: the engine talks to any [`SmsCodec`]
//! through encode/decode calls and hands it the service-center address
//! captured during initialization. [`MockCodec`] scripts both directions
//! for the test suite.

pub mod mock;

pub use mock::MockCodec;

use std::fmt;

/// Multipart identification for one encoded chunk
///
/// All-zero means a plain single-part message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartInfo {
    /// Shared reference of the multipart message
    pub reference: u16,
    /// Total chunk count
    pub count: u8,
    /// 1-based index of this chunk
    pub index: u8,
}

impl PartInfo {
    /// Identification for a message that fits one PDU
    pub fn single() -> Self {
        Self::default()
    }
}

/// One encoded outbound message unit
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPdu {
    /// Hex payload to write after the modem's continuation prompt
    pub payload: String,
    /// TPDU octet length announced in the submit command
    pub tpdu_len: usize,
}

/// One decoded inbound message unit
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSms {
    pub sender: String,
    pub timestamp: String,
    pub text: String,
    /// The decoder ran out of workspace; `text` holds a partial message
    pub truncated: bool,
}

/// Errors reported by a codec implementation
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The outbound message could not be encoded
    Encode { details: String },
    /// The inbound payload line could not be parsed
    Decode { details: String },
    /// The service-center address was rejected
    InvalidAddress { address: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode { details } => write!(f, "PDU encode failed: {}", details),
            CodecError::Decode { details } => write!(f, "PDU decode failed: {}", details),
            CodecError::InvalidAddress { address } => {
                write!(f, "Invalid service-center address: {}", address)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Binary message-unit codec consumed by the engine
pub trait SmsCodec {
    /// Encode one chunk of an outbound message into a PDU
    fn encode(&mut self, number: &str, text: &str, part: &PartInfo) -> CodecResult<OutboundPdu>;

    /// Decode one inbound payload line into sender, timestamp and text
    fn decode(&mut self, line: &str) -> CodecResult<InboundSms>;

    /// Install the network routing address captured from the modem
    fn set_service_center(&mut self, address: &str) -> CodecResult<()>;
}
