//! Core data types for the modem engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Lifecycle state of a modem session
///
/// Exactly one state holds at a time; transitions happen only inside the
/// engine's poll loop or its command-issuing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, `begin` not called yet
    Starting,
    /// Trying candidate link speeds until the modem answers
    ProbingSpeed,
    /// Running the initialization pipeline
    Initializing,
    /// No exchange in progress, ready for caller requests
    Idle,
    /// Driving an outbound message through its chunks
    Sending,
    /// Capturing an inbound message body
    Receiving,
}

/// Classified cause of a terminal command failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// No answer arrived within the command deadline
    Timeout,
    /// The answer exceeded the maximum buffer length
    TooLong,
    /// A partial or unparseable answer was captured
    BadAnswer,
    /// The modem reported an explicit CMS/CME error
    ProtocolError,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Timeout => write!(f, "no answer within deadline"),
            RestartReason::TooLong => write!(f, "answer exceeded buffer limit"),
            RestartReason::BadAnswer => write!(f, "malformed or partial answer"),
            RestartReason::ProtocolError => write!(f, "modem reported protocol error"),
        }
    }
}

/// Restart flag with its classified cause
///
/// Set by the engine's restart policy; only the owning caller clears it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartStatus {
    pub needed: bool,
    pub reason: Option<RestartReason>,
}

/// Diagnostic counters for one engine session
///
/// Monotonically increasing from construction; reset only by building a
/// new engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    /// Commands issued to the modem
    pub commands: u32,
    /// Modem resets started
    pub resets: u32,
    /// Initialization pipelines completed
    pub restarts: u32,
    /// Inbound message indicators seen
    pub messages_read: u32,
    /// Inbound messages decoded and forwarded to the callback
    pub messages_forwarded: u32,
    /// Outbound chunks confirmed by the modem
    pub messages_sent: u32,
}

/// Number, timestamp and text of one message
///
/// The engine keeps only the most recent record in each direction;
/// callers needing history persist the callback payload themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct SmsRecord {
    pub number: String,
    pub timestamp: String,
    pub text: String,
}

/// Engine configuration
///
/// Timeout values and the probe speed list vary between modem firmwares,
/// so they are configuration rather than constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Standard AT command timeout (milliseconds)
    pub command_timeout_ms: u64,
    /// Timeout for each attention command during speed probing (milliseconds)
    pub probe_timeout_ms: u64,
    /// Timeout for message-store delete commands (milliseconds)
    pub delete_timeout_ms: u64,
    /// Timeout for the submit confirmation after a PDU is written (milliseconds)
    pub send_confirm_timeout_ms: u64,
    /// How long initialization waits for the modem-ready sentinel (milliseconds)
    pub ready_wait_ms: u64,
    /// Deadline for the message body line after an inbound indicator (milliseconds)
    pub receive_timeout_ms: u64,
    /// Maximum accepted answer line length (bytes)
    pub max_answer_len: usize,
    /// Link speeds tried, in order, when the modem does not answer
    pub probe_speeds: Vec<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 4_000,
            probe_timeout_ms: 1_500,
            delete_timeout_ms: 10_000,
            send_confirm_timeout_ms: 10_000,
            ready_wait_ms: 30_000,
            receive_timeout_ms: 4_000,
            max_answer_len: 200,
            probe_speeds: vec![115_200, 9_600, 1_200, 2_400, 19_200],
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            details: e.to_string(),
        })?;
        let config: EngineConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_answer_len == 0 || self.max_answer_len > 4096 {
            return Err(ConfigError::InvalidValue {
                parameter: "max_answer_len".to_string(),
                value: self.max_answer_len.to_string(),
            });
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "command_timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "probe_timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }
        if self.probe_speeds.is_empty() {
            return Err(ConfigError::InvalidValue {
                parameter: "probe_speeds".to_string(),
                value: "[]".to_string(),
            });
        }
        Ok(())
    }
}

/// Errors raised while loading or validating a configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io { details: String },
    Parse { details: String },
    InvalidValue { parameter: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { details } => write!(f, "Config read failed: {}", details),
            ConfigError::Parse { details } => write!(f, "Config parse failed: {}", details),
            ConfigError::InvalidValue { parameter, value } => {
                write!(f, "Invalid config value: {} = {}", parameter, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
