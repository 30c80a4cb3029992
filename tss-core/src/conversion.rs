#![forbid(unsafe_code)]

//! Bech32 pubkey encoding and the identity derivations every node must
//! agree on: peer ids, confirmation thresholds and message ids.

use std::sync::OnceLock;

use bech32::{Bech32, Hrp};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::peer::PeerId;

const SECP256K1_TYPE_PREFIX: [u8; 5] = [0xEB, 0x5A, 0xE9, 0x87, 0x21];
const ED25519_TYPE_PREFIX: [u8; 5] = [0x16, 0x24, 0xDE, 0x64, 0x20];
const ACC_PUB_SUFFIX: &str = "pub";

static BECH32_PREFIX: OnceLock<String> = OnceLock::new();

/// Set the process-wide bech32 account prefix. Must be called before any
/// pool pubkey is parsed or encoded; later calls are ignored.
pub fn setup_bech32_prefix(prefix: &str) {
    let _ = BECH32_PREFIX.set(prefix.to_string());
}

fn account_pub_hrp() -> Result<String> {
    BECH32_PREFIX
        .get()
        .map(|p| format!("{}{}", p, ACC_PUB_SUFFIX))
        .ok_or(CoreError::PrefixNotInitialized)
}

/// A participant or pool public key. The variant dictates which curve a
/// signature is verified under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubKey {
    Secp256k1([u8; 33]),
    Ed25519([u8; 32]),
}

impl PubKey {
    pub fn from_bech32(encoded: &str) -> Result<Self> {
        let expected_hrp = account_pub_hrp()?;
        let (hrp, data) = bech32::decode(encoded)
            .map_err(|e| CoreError::InvalidPubKey(encoded.to_string(), e.to_string()))?;
        if hrp.as_str() != expected_hrp {
            return Err(CoreError::InvalidPubKey(
                encoded.to_string(),
                format!("expected prefix {}, got {}", expected_hrp, hrp.as_str()),
            ));
        }

        if let Some(raw) = data.strip_prefix(&SECP256K1_TYPE_PREFIX[..]) {
            let key: [u8; 33] = raw.try_into().map_err(|_| {
                CoreError::InvalidPubKey(encoded.to_string(), "expected 33 key bytes".into())
            })?;
            return Ok(PubKey::Secp256k1(key));
        }
        if let Some(raw) = data.strip_prefix(&ED25519_TYPE_PREFIX[..]) {
            let key: [u8; 32] = raw.try_into().map_err(|_| {
                CoreError::InvalidPubKey(encoded.to_string(), "expected 32 key bytes".into())
            })?;
            return Ok(PubKey::Ed25519(key));
        }
        Err(CoreError::InvalidPubKeyType)
    }

    pub fn to_bech32(&self) -> Result<String> {
        let hrp_str = account_pub_hrp()?;
        let hrp = Hrp::parse(&hrp_str)
            .map_err(|e| CoreError::InvalidPubKey(hrp_str.clone(), e.to_string()))?;
        let mut data = match self {
            PubKey::Secp256k1(_) => SECP256K1_TYPE_PREFIX.to_vec(),
            PubKey::Ed25519(_) => ED25519_TYPE_PREFIX.to_vec(),
        };
        data.extend_from_slice(self.raw_bytes());
        bech32::encode::<Bech32>(hrp, &data)
            .map_err(|e| CoreError::InvalidPubKey(hrp_str, e.to_string()))
    }

    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            PubKey::Secp256k1(b) => b,
            PubKey::Ed25519(b) => b,
        }
    }

    /// Derive the transport peer id for this key. Every node derives the
    /// same id for a given participant key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(hex::encode(Sha256::digest(self.raw_bytes())))
    }
}

/// Peer id for an arbitrary raw key. Party coordination uses this so that
/// the mapping works for any key bytes, parsed or not.
pub fn peer_id_from_raw(key: &[u8]) -> PeerId {
    PeerId::new(hex::encode(Sha256::digest(key)))
}

/// Number of hash confirmations required before a broadcast message is
/// handed to the signing engine: `ceil(2n/3) - 1`.
pub fn get_threshold(party_count: usize) -> Result<usize> {
    if party_count == 0 {
        return Err(CoreError::InvalidPartyCount(party_count));
    }
    Ok((2 * party_count).div_ceil(3) - 1)
}

/// Hex SHA-256 of the given bytes. The message id of a keysign request is
/// this hash over the sorted, comma-joined message set.
pub fn msg_to_hash_string(msg: &[u8]) -> Result<String> {
    if msg.is_empty() {
        return Err(CoreError::EmptyMessage);
    }
    Ok(hex::encode(Sha256::digest(msg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        setup_bech32_prefix("oppy");
    }

    #[test]
    fn test_pubkey_roundtrip_ed25519() {
        setup();
        let key = PubKey::Ed25519([7u8; 32]);
        let encoded = key.to_bech32().unwrap();
        assert!(encoded.starts_with("oppypub1"));
        assert_eq!(PubKey::from_bech32(&encoded).unwrap(), key);
    }

    #[test]
    fn test_pubkey_roundtrip_secp256k1() {
        setup();
        let key = PubKey::Secp256k1([2u8; 33]);
        let encoded = key.to_bech32().unwrap();
        assert_eq!(PubKey::from_bech32(&encoded).unwrap(), key);
    }

    #[test]
    fn test_garbage_pubkey_rejected() {
        setup();
        assert!(PubKey::from_bech32("whatever").is_err());
        assert!(PubKey::from_bech32("").is_err());
    }

    #[test]
    fn test_unknown_type_prefix_rejected() {
        setup();
        let hrp = Hrp::parse("oppypub").unwrap();
        let encoded = bech32::encode::<Bech32>(hrp, &[0xAAu8; 37]).unwrap();
        assert!(matches!(
            PubKey::from_bech32(&encoded),
            Err(CoreError::InvalidPubKeyType)
        ));
    }

    #[test]
    fn test_peer_id_deterministic() {
        setup();
        let key = PubKey::Ed25519([9u8; 32]);
        assert_eq!(key.peer_id(), key.peer_id());
        assert_eq!(key.peer_id(), peer_id_from_raw(&[9u8; 32]));
    }

    #[test]
    fn test_threshold_formula() {
        assert!(get_threshold(0).is_err());
        assert_eq!(get_threshold(3).unwrap(), 1);
        assert_eq!(get_threshold(4).unwrap(), 2);
        assert_eq!(get_threshold(9).unwrap(), 5);
    }

    #[test]
    fn test_msg_to_hash_string_deterministic() {
        let a = msg_to_hash_string(b"helloworld-test,t").unwrap();
        let b = msg_to_hash_string(b"helloworld-test,t").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(msg_to_hash_string(b"").is_err());
    }
}
