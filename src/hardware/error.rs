//! Link error types

use std::fmt;

/// Errors reported by a modem link implementation
#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The port could not be opened at the requested speed
    OpenFailed { baud: u32, details: String },
    /// The requested speed is not supported by the port
    UnsupportedSpeed { baud: u32 },
    /// The link was used before being opened
    NotOpen,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::OpenFailed { baud, details } => {
                write!(f, "Open at {} bds failed: {}", baud, details)
            }
            LinkError::UnsupportedSpeed { baud } => {
                write!(f, "Unsupported link speed: {} bds", baud)
            }
            LinkError::NotOpen => write!(f, "Link is not open"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;
