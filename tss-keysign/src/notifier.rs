#![forbid(unsafe_code)]

//! End-to-end verification of the assembled signatures against the pool
//! public key, with a single-shot delivery channel to the caller.

use ed25519_dalek::Verifier;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use tss_core::conversion::PubKey;

use crate::engine::SignatureData;
use crate::error::{KeysignError, Result};

/// Receives the keysign outcome for one session. A `None` on the response
/// channel means the keysign failed; consult the blame report.
pub struct Notifier {
    pub message_id: String,
    messages: Vec<Vec<u8>>,
    pool_pub_key: String,
    resp_tx: mpsc::Sender<Option<Vec<SignatureData>>>,
    resp_rx: Mutex<Option<mpsc::Receiver<Option<Vec<SignatureData>>>>>,
}

impl Notifier {
    pub fn new(message_id: &str, messages: Vec<Vec<u8>>, pool_pub_key: &str) -> Result<Self> {
        if message_id.is_empty() {
            return Err(KeysignError::EmptyMessageId);
        }
        if messages.is_empty() || messages.iter().any(|m| m.is_empty()) {
            return Err(KeysignError::EmptyMessages);
        }
        if pool_pub_key.is_empty() {
            return Err(KeysignError::EmptyPoolPubKey);
        }
        let (resp_tx, resp_rx) = mpsc::channel(1);
        Ok(Self {
            message_id: message_id.to_string(),
            messages,
            pool_pub_key: pool_pub_key.to_string(),
            resp_tx,
            resp_rx: Mutex::new(Some(resp_rx)),
        })
    }

    /// Verify one candidate signature against the pool pubkey. The signed
    /// payload is used exactly as the caller provided it; this layer never
    /// re-hashes (callers hash before submitting).
    fn verify_signature(&self, data: &SignatureData) -> Result<bool> {
        if !self.messages.iter().any(|m| *m == data.msg) {
            debug!(message_id = %self.message_id, "signature for a message we never requested");
            return Ok(false);
        }
        match PubKey::from_bech32(&self.pool_pub_key)? {
            PubKey::Secp256k1(raw) => {
                let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&raw)
                    .map_err(|e| KeysignError::Protocol(format!("invalid secp256k1 key: {}", e)))?;
                let signature =
                    k256::ecdsa::Signature::from_scalars(pad32(&data.r)?, pad32(&data.s)?)
                        .map_err(|e| {
                            KeysignError::Protocol(format!("invalid ECDSA scalars: {}", e))
                        })?;
                Ok(key.verify_prehash(&data.msg, &signature).is_ok())
            }
            PubKey::Ed25519(raw) => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|e| KeysignError::Protocol(format!("invalid ed25519 key: {}", e)))?;
                let sig_bytes: [u8; 64] = data.signature.as_slice().try_into().map_err(|_| {
                    KeysignError::Protocol("ed25519 signature must be 64 bytes".into())
                })?;
                let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                Ok(key.verify(&data.msg, &signature).is_ok())
            }
        }
    }

    /// Verify and deliver the session outcome. `None` (keysign failed)
    /// passes through unverified. Returns false when a candidate failed
    /// verification, in which case nothing is delivered.
    pub fn process_signatures(&self, data: Option<Vec<SignatureData>>) -> Result<bool> {
        if let Some(signatures) = &data {
            for signature in signatures {
                if !self.verify_signature(signature)? {
                    return Ok(false);
                }
            }
        }
        self.resp_tx
            .try_send(data)
            .map_err(|_| KeysignError::Protocol("notifier already delivered".into()))?;
        Ok(true)
    }

    /// The single-shot response channel; can only be taken once.
    pub fn response_channel(&self) -> Option<mpsc::Receiver<Option<Vec<SignatureData>>>> {
        self.resp_rx.lock().take()
    }
}

fn pad32(scalar: &[u8]) -> Result<[u8; 32]> {
    if scalar.len() > 32 {
        return Err(KeysignError::Protocol("scalar longer than 32 bytes".into()));
    }
    let mut out = [0u8; 32];
    out[32 - scalar.len()..].copy_from_slice(scalar);
    Ok(out)
}
