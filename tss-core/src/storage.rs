#![forbid(unsafe_code)]

//! File-backed persistence for keygen local state and the peer address
//! book.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::conversion::PubKey;
use crate::error::{CoreError, Result};
use crate::peer::{MultiAddr, PeerId};

const ADDRESS_BOOK_FILE: &str = "address_book.seed";

/// Per-node record produced at keygen time and read-only during keysign.
/// `local_data` is the engine's opaque share blob; it never leaves the
/// node and is wiped on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeygenLocalState {
    pub pub_key: String,
    #[serde(with = "base64_bytes")]
    pub local_data: Vec<u8>,
    pub participant_keys: Vec<String>,
    pub local_party_key: String,
}

/// Storage surface consumed by the keysign engine and the bootstrap path.
pub trait LocalStateManager: Send + Sync {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<()>;
    fn get_local_state(&self, pool_pub_key: &str) -> Result<KeygenLocalState>;
    fn save_address_book(&self, address_book: &HashMap<PeerId, Vec<MultiAddr>>) -> Result<()>;
    fn retrieve_p2p_addresses(&self) -> Result<Vec<MultiAddr>>;
}

pub struct FileStateMgr {
    folder: PathBuf,
}

impl FileStateMgr {
    pub fn new(folder: impl AsRef<Path>) -> Result<Self> {
        let folder = folder.as_ref().to_path_buf();
        fs::create_dir_all(&folder)?;
        Ok(Self { folder })
    }

    /// Path of the state file for the given pool pubkey. The key is
    /// validated as bech32 before any path is built, so a malformed key
    /// can never name a file.
    pub fn get_file_path_name(&self, pool_pub_key: &str) -> Result<PathBuf> {
        PubKey::from_bech32(pool_pub_key)?;
        Ok(self
            .folder
            .join(format!("localstate-{}.json", pool_pub_key)))
    }
}

impl LocalStateManager for FileStateMgr {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<()> {
        let path = self.get_file_path_name(&state.pub_key)?;
        let buf = serde_json::to_vec_pretty(state)?;
        fs::write(&path, buf)?;
        debug!(path = %path.display(), "saved local state");
        Ok(())
    }

    fn get_local_state(&self, pool_pub_key: &str) -> Result<KeygenLocalState> {
        if pool_pub_key.is_empty() {
            return Err(CoreError::StateNotFound(pool_pub_key.to_string()));
        }
        let path = self.get_file_path_name(pool_pub_key)?;
        let buf = fs::read(&path)
            .map_err(|_| CoreError::StateNotFound(pool_pub_key.to_string()))?;
        Ok(serde_json::from_slice(&buf)?)
    }

    fn save_address_book(&self, address_book: &HashMap<PeerId, Vec<MultiAddr>>) -> Result<()> {
        let mut lines = Vec::new();
        for (peer, addrs) in address_book {
            for addr in addrs {
                lines.push(format!("{}/p2p/{}", addr, peer));
            }
        }
        let path = self.folder.join(ADDRESS_BOOK_FILE);
        fs::write(&path, lines.join("\n"))?;
        debug!(path = %path.display(), entries = lines.len(), "saved address book");
        Ok(())
    }

    fn retrieve_p2p_addresses(&self) -> Result<Vec<MultiAddr>> {
        let path = self.folder.join(ADDRESS_BOOK_FILE);
        let content = fs::read_to_string(&path)?;
        let mut addrs = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            addrs.push(MultiAddr::from_str(line)?);
        }
        Ok(addrs)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
