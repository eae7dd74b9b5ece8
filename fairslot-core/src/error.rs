use crate::types::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FairSlotError>;

#[derive(Error, Debug)]
pub enum FairSlotError {
    #[error("Fairness violation on chain {chain_index}: {reason}")]
    FairnessViolation { chain_index: usize, reason: String },

    #[error("Unknown session: {0}")]
    UnknownSession(Address),

    #[error("Chain {chain_index} exhausted")]
    ChainExhausted { chain_index: usize },

    #[error("No counterpart commitment for chain {chain_index}, must cash out")]
    MissingCommitment { chain_index: usize },

    #[error("Session aborted: {0}")]
    SessionAborted(String),

    #[error("Ledger transport failure: {0}")]
    Transport(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Payload decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FairSlotError {
    pub fn fairness(chain_index: usize, reason: impl Into<String>) -> Self {
        Self::FairnessViolation {
            chain_index,
            reason: reason.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors that leave the session in a terminal aborted state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FairnessViolation { .. }
                | Self::ChainExhausted { .. }
                | Self::MissingCommitment { .. }
                | Self::SessionAborted(_)
        )
    }

    /// Errors the caller may retry; the engine never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}
