use std::time::Duration;
use thiserror::Error;

pub const DIALOG_INTERNET_ERROR: &str = "Connection failure.\n\nCheck phone internet connection.";
pub const DIALOG_GPS_ERROR: &str = "Location Error.\n\nCheck phone GPS settings & signal.";

/// A single failed delivery attempt on the peer link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("peer rejected message {receipt}: {reason}")]
    Rejected { receipt: u64, reason: String },

    #[error("no receipt for message {0} within timeout")]
    AckTimeout(u64),

    #[error("peer link is closed")]
    Closed,

    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An inbound dictionary that cannot be turned into a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {0} has the wrong type")]
    WrongType(&'static str),

    #[error("unknown messageType {0}")]
    UnknownType(i64),
}

/// A single failed HTTP attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("gave up on {url} after {attempts} attempts")]
    Exhausted { url: String, attempts: u32 },
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FetchError::Status(status.as_u16()),
            None => FetchError::Transport(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("no position fix available")]
    Unavailable,

    #[error("position acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures that end a transaction and are surfaced to the peer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("fetch exhausted: {0}")]
    FetchExhausted(FetchError),

    #[error("malformed {resource} response: {reason}")]
    MalformedResponse {
        resource: &'static str,
        reason: String,
    },

    #[error("location unavailable: {0}")]
    LocationUnavailable(LocationError),

    #[error("location unavailable for nearby stops: {0}")]
    NearbyLocationUnavailable(LocationError),
}

impl RelayError {
    pub fn diagnostic_code(&self) -> u16 {
        match self {
            RelayError::FetchExhausted(_) => 0x0000,
            RelayError::MalformedResponse { .. } => 0x0001,
            RelayError::LocationUnavailable(_) => 0x0002,
            RelayError::NearbyLocationUnavailable(_) => 0x0003,
        }
    }

    /// Text shown on the peer's error screen.
    pub fn dialog(&self) -> String {
        let base = match self {
            RelayError::FetchExhausted(_) | RelayError::MalformedResponse { .. } => {
                DIALOG_INTERNET_ERROR
            }
            RelayError::LocationUnavailable(_) | RelayError::NearbyLocationUnavailable(_) => {
                DIALOG_GPS_ERROR
            }
        };
        format!("{}\n\n0x{:04X}", base, self.diagnostic_code())
    }
}
