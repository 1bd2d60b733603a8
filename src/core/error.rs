//! Errors that cross component boundaries.

use serde::Serialize;
use thiserror::Error;

use crate::core::bluetooth::ServiceGroup;

/// Error category carried by `CoreEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The request could not be issued (nothing selected, not discovered yet, bad input)
    Request,
    Transport,
    ProtocolDecode,
    AuthMissing,
    Network,
    Storage,
    Busy,
    Shutdown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Scanner {0} has not been discovered yet")]
    NotDiscovered(String),

    #[error("No scanner selected")]
    NoSelection,

    #[error("Scanner {serial} has not discovered the {group} characteristics yet")]
    CharacteristicUnavailable { serial: String, group: ServiceGroup },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Bluetooth error: {0}")]
    Transport(String),

    #[error("Failed to decode payload: {0}")]
    ProtocolDecode(String),

    #[error("No cloud token provided")]
    AuthMissing,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("A catalog refresh is already in progress")]
    RefreshInProgress,

    #[error("Catalog still had more pages after {0} pages")]
    PageLimitExceeded(usize),

    #[error("Session manager has shut down")]
    Shutdown,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotDiscovered(_)
            | Self::NoSelection
            | Self::CharacteristicUnavailable { .. }
            | Self::InvalidRequest(_) => ErrorKind::Request,
            Self::Transport(_) => ErrorKind::Transport,
            Self::ProtocolDecode(_) => ErrorKind::ProtocolDecode,
            Self::AuthMissing => ErrorKind::AuthMissing,
            Self::Network(_) | Self::HttpStatus { .. } | Self::PageLimitExceeded(_) => {
                ErrorKind::Network
            }
            Self::Storage(_) => ErrorKind::Storage,
            Self::RefreshInProgress => ErrorKind::Busy,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }
}
