#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Opaque transport-level node identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer dial address, e.g. `/ip4/192.168.3.5/tcp/6668`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiAddr(String);

impl MultiAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MultiAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| CoreError::InvalidMultiAddr(s.to_string()))?;
        if rest.is_empty() || rest.split('/').any(|seg| seg.is_empty()) {
            return Err(CoreError::InvalidMultiAddr(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for MultiAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiaddr_parse() {
        assert!("/ip4/192.168.3.5/tcp/6668".parse::<MultiAddr>().is_ok());
        assert!("/ip4/127.0.0.1/tcp/17666/p2p/abc".parse::<MultiAddr>().is_ok());
        assert!("ip4/1.2.3.4".parse::<MultiAddr>().is_err());
        assert!("/".parse::<MultiAddr>().is_err());
        assert!("/ip4//tcp/1".parse::<MultiAddr>().is_err());
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
    }
}
