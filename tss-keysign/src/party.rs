#![forbid(unsafe_code)]

//! Maps the signer pubkey set onto protocol party identifiers with a
//! canonical ordering every participant derives identically.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tss_core::conversion::{peer_id_from_raw, PubKey};
use tss_core::PeerId;

use crate::error::{KeysignError, Result};

/// Protocol-level participant identifier. `id` is the participant's
/// bech32 pubkey and doubles as the moniker; `key` is the raw key bytes
/// the canonical ordering sorts by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    pub id: String,
    pub key: Vec<u8>,
    pub index: usize,
}

impl std::fmt::Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// The frozen quorum of one session: sorted parties, the pubkey ↔ party
/// bijection and the derived peer ids.
#[derive(Clone, Debug)]
pub struct PartyInfo {
    parties: Vec<PartyId>,
    by_id: HashMap<String, PartyId>,
    peer_by_party: HashMap<String, PeerId>,
    local_party: Option<PartyId>,
}

impl PartyInfo {
    /// Build the quorum from the signer pubkey set. Returns an info with
    /// no local party when `local_pub_key` is not among the signers
    /// (idle-observer mode).
    pub fn build(signer_pub_keys: &[String], local_pub_key: &str) -> Result<Self> {
        if signer_pub_keys.is_empty() {
            return Err(KeysignError::Party("empty signer set".into()));
        }
        let mut keyed: Vec<(String, Vec<u8>)> = Vec::with_capacity(signer_pub_keys.len());
        for pk in signer_pub_keys {
            let parsed = PubKey::from_bech32(pk)?;
            keyed.push((pk.clone(), parsed.raw_bytes().to_vec()));
        }
        keyed.sort_by(|a, b| a.1.cmp(&b.1));
        keyed.dedup_by(|a, b| a.0 == b.0);

        let parties: Vec<PartyId> = keyed
            .into_iter()
            .enumerate()
            .map(|(i, (id, key))| PartyId {
                id,
                key,
                index: i + 1,
            })
            .collect();
        Ok(Self::from_parties(parties, local_pub_key))
    }

    /// Assemble from pre-built parties. Peer ids are derived from the raw
    /// key bytes, so this works for synthetic parties in tests as well.
    pub fn from_parties(parties: Vec<PartyId>, local_pub_key: &str) -> Self {
        let by_id: HashMap<String, PartyId> =
            parties.iter().map(|p| (p.id.clone(), p.clone())).collect();
        let peer_by_party: HashMap<String, PeerId> = parties
            .iter()
            .map(|p| (p.id.clone(), peer_id_from_raw(&p.key)))
            .collect();
        let local_party = by_id.get(local_pub_key).cloned();
        Self {
            parties,
            by_id,
            peer_by_party,
            local_party,
        }
    }

    pub fn parties(&self) -> &[PartyId] {
        &self.parties
    }

    pub fn party_count(&self) -> usize {
        self.parties.len()
    }

    pub fn get(&self, party_id: &str) -> Option<&PartyId> {
        self.by_id.get(party_id)
    }

    pub fn local_party(&self) -> Option<&PartyId> {
        self.local_party.as_ref()
    }

    pub fn peer_for(&self, party_id: &str) -> Option<&PeerId> {
        self.peer_by_party.get(party_id)
    }

    /// Peer ids of all remote parties.
    pub fn remote_peers(&self) -> Vec<PeerId> {
        let local = self.local_party.as_ref().map(|p| p.id.as_str());
        self.parties
            .iter()
            .filter(|p| Some(p.id.as_str()) != local)
            .filter_map(|p| self.peer_by_party.get(&p.id).cloned())
            .collect()
    }
}
