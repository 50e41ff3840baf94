use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveEventsError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Malformed event payload: {reason} (payload: {snippet})")]
    MalformedPayload { reason: String, snippet: String },

    #[error("Stats fetch failed: {0}")]
    StatsFetch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("Unknown control command: {0}")]
    UnknownCommand(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Aggregator is no longer running")]
    AggregatorStopped,

    #[error("Metrics server error: {0}")]
    MetricsError(String),
}

// How much of a bad payload ends up in logs and errors
const SNIPPET_LEN: usize = 100;

impl LiveEventsError {
    pub fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        LiveEventsError::MalformedPayload {
            reason: reason.into(),
            snippet: raw.chars().take(SNIPPET_LEN).collect(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveEventsError>;
