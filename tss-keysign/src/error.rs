#![forbid(unsafe_code)]

use thiserror::Error;

use tss_core::CoreError;

#[derive(Error, Debug)]
pub enum KeysignError {
    #[error("messageID is empty")]
    EmptyMessageId,

    #[error("message is nil")]
    EmptyMessages,

    #[error("pool pubkey is empty")]
    EmptyPoolPubKey,

    #[error("received exit signal")]
    Stopped,

    #[error("keysign timeout for message id {0}")]
    Timeout(String),

    #[error("duplicated notification from peer {0} ignored")]
    DuplicateNotification(String),

    #[error("signature verify failed")]
    SignatureVerify,

    #[error("not enough signers: got {got}, need {need}")]
    NotEnoughSigners { got: usize, need: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("party error: {0}")]
    Party(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KeysignError>;
