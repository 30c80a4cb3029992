#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("bech32 prefix is not initialized")]
    PrefixNotInitialized,

    #[error("fail to decode bech32 pubkey {0}: {1}")]
    InvalidPubKey(String, String),

    #[error("invalid pubkey type")]
    InvalidPubKeyType,

    #[error("message is empty")]
    EmptyMessage,

    #[error("invalid participant count: {0}")]
    InvalidPartyCount(usize),

    #[error("invalid multiaddress: {0}")]
    InvalidMultiAddr(String),

    #[error("no local state found for pool pubkey {0}")]
    StateNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
