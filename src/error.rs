// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport failure. The only class the exchange client retries.
    #[error("network: {0}")]
    Network(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rejected by venue: {0}")]
    Rejected(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool { matches!(self, VenueError::Network(_)) }
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            VenueError::Malformed(e.to_string())
        } else {
            VenueError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for VenueError {
    fn from(e: serde_json::Error) -> Self { VenueError::Malformed(e.to_string()) }
}

/// Failure of one stage cycle. Counted against the stage's error budget.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error("arithmetic: {0}")]
    Arithmetic(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid amount {0:?}")]
    BadAmount(String),
    #[error("invalid price {0:?}")]
    BadPrice(String),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("command queue closed")]
    QueueClosed,
    #[error(transparent)]
    Venue(#[from] VenueError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
