//! Error types for the swap client

use thiserror::Error;

/// Main error type for swap client operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chain query failed: {message}")]
    ChainQuery { message: String },

    #[error("Quote from {url} invalid: {message}")]
    QuoteInvalid { url: String, message: String },

    #[error("Intermediary {url} violated the protocol: {message}")]
    ProtocolViolation { url: String, message: String },

    #[error("Amount out of bounds: min {min}, max {max}")]
    OutOfBounds { min: u64, max: u64 },

    #[error("Intermediary {url} has insufficient liquidity")]
    LiquidityInsufficient { url: String },

    #[error("No intermediary can service the request: {message}")]
    NoCandidates { message: String },

    #[error("Initialization authorization expired for swap {swap_id}")]
    AuthorizationExpired { swap_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Swap {swap_id} not found")]
    SwapNotFound { swap_id: String },

    #[error("Swap {swap_id} is not in a state where {action} is possible")]
    WrongState { swap_id: String, action: String },

    #[error("Bitcoin header at height {height} is malformed: {message}")]
    BadHeader { height: u64, message: String },

    #[error("Local chain has insufficient cumulative work to reach the relay main chain")]
    InsufficientChainwork,

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Operation aborted")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Check if error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ChainQuery { .. } | ClientError::Timeout { .. } => true,
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::Storage(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Check if error is unrecoverable for the whole subsystem,
    /// not just the operation that hit it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::InsufficientChainwork | ClientError::Config(_)
        )
    }

    /// Check if error should permanently exclude the intermediary it
    /// originated from
    pub fn blacklists_intermediary(&self) -> bool {
        matches!(self, ClientError::ProtocolViolation { .. })
    }
}

/// Result type for swap client operations
pub type ClientResult<T> = Result<T, ClientError>;
