#![forbid(unsafe_code)]

pub mod config;
pub mod conversion;
pub mod error;
pub mod peer;
pub mod storage;

pub use config::TssConfig;
pub use conversion::{get_threshold, msg_to_hash_string, setup_bech32_prefix, PubKey};
pub use error::{CoreError, Result};
pub use peer::{MultiAddr, PeerId};
pub use storage::{FileStateMgr, KeygenLocalState, LocalStateManager};
