#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use tss_core::msg_to_hash_string;

use crate::error::Result;

/// A keysign request as submitted by the caller. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub pool_pub_key: String,
    pub messages: Vec<String>,
    pub block_height: i64,
    pub signer_pub_keys: Vec<String>,
    pub version: String,
}

impl Request {
    pub fn new(
        pool_pub_key: &str,
        messages: Vec<String>,
        block_height: i64,
        signer_pub_keys: Vec<String>,
        version: &str,
    ) -> Self {
        Self {
            pool_pub_key: pool_pub_key.to_string(),
            messages,
            block_height,
            signer_pub_keys,
            version: version.to_string(),
        }
    }

    /// Session identifier: hash of the sorted, comma-joined message set.
    /// Every honest node derives the same id for the same request.
    pub fn msg_id(&self) -> Result<String> {
        let mut sorted = self.messages.clone();
        sorted.sort();
        Ok(msg_to_hash_string(sorted.join(",").as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_id_order_independent() {
        let a = Request::new(
            "pool",
            vec!["helloworld-test".into(), "t".into()],
            10,
            Vec::new(),
            "0.14.0",
        );
        let b = Request::new(
            "pool",
            vec!["t".into(), "helloworld-test".into()],
            10,
            Vec::new(),
            "0.14.0",
        );
        assert_eq!(a.msg_id().unwrap(), b.msg_id().unwrap());
    }

    #[test]
    fn test_msg_id_rejects_empty_set() {
        let req = Request::new("pool", Vec::new(), 0, Vec::new(), "");
        assert!(req.msg_id().is_err());
    }
}
