#![forbid(unsafe_code)]

//! Tracks per-peer protocol progress and assembles the attribution report
//! when a session fails.

use std::collections::HashMap;

use parking_lot::Mutex;

use tss_core::PeerId;

use crate::cache::MessageCache;
use crate::messages::WireMessage;
use crate::party::PartyInfo;

pub const BLAME_TIMEOUT: &str = "keysign timeout";
pub const BLAME_MISSING_ROUND: &str = "missing round";
pub const BLAME_FAILED_BROADCAST: &str = "failed broadcast";
pub const BLAME_EQUIVOCATION: &str = "equivocation";
pub const BLAME_UNKNOWN_PARTY: &str = "unknown party";
pub const BLAME_SIG_VERIFY: &str = "signature verify failed";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlameNode {
    pub pubkey: String,
    pub reason: String,
    pub blame_data: Vec<u8>,
}

/// The attribution report. Appended monotonically across a session; nodes
/// are deduplicated by pubkey.
#[derive(Clone, Debug, Default)]
pub struct Blame {
    pub fail_reason: String,
    pub round: String,
    pub is_unicast: bool,
    pub blame_nodes: Vec<BlameNode>,
}

/// Parse the round number out of a round-info string: the digit run
/// immediately following `"Round"`, so multi-digit rounds parse whole.
pub fn round_from_info(round_info: &str) -> Option<u32> {
    let idx = round_info.find("Round")?;
    let digits: String = round_info[idx + "Round".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub struct BlameManager {
    last_msg: Mutex<Option<WireMessage>>,
    rounds_seen: Mutex<HashMap<String, u32>>,
    blame: Mutex<Blame>,
    peers: Mutex<Vec<PeerId>>,
}

impl BlameManager {
    pub fn new() -> Self {
        Self {
            last_msg: Mutex::new(None),
            rounds_seen: Mutex::new(HashMap::new()),
            blame: Mutex::new(Blame::default()),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_last_msg(&self, msg: WireMessage) {
        *self.last_msg.lock() = Some(msg);
    }

    pub fn last_msg(&self) -> Option<WireMessage> {
        self.last_msg.lock().clone()
    }

    /// Record the highest round a party has been observed producing.
    pub fn record_round(&self, party_id: &str, round: u32) {
        let mut rounds = self.rounds_seen.lock();
        let entry = rounds.entry(party_id.to_string()).or_insert(round);
        if *entry < round {
            *entry = round;
        }
    }

    pub fn rounds_seen(&self) -> HashMap<String, u32> {
        self.rounds_seen.lock().clone()
    }

    /// Current round-message target set. Tests swap this mid-session to
    /// simulate a peer rejecting part of the quorum.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().clone()
    }

    pub fn replace_peers(&self, peers: Vec<PeerId>) {
        *self.peers.lock() = peers;
    }

    pub fn add_blame_node(&self, pubkey: &str, reason: &str, blame_data: Vec<u8>) {
        let mut blame = self.blame.lock();
        if blame.blame_nodes.iter().any(|n| n.pubkey == pubkey) {
            return;
        }
        blame.blame_nodes.push(BlameNode {
            pubkey: pubkey.to_string(),
            reason: reason.to_string(),
            blame_data,
        });
    }

    pub fn add_equivocation(&self, pubkey: &str, observed: &str, claimed: &str) {
        self.add_blame_node(
            pubkey,
            BLAME_EQUIVOCATION,
            format!("{}!={}", observed, claimed).into_bytes(),
        );
    }

    pub fn set_fail_reason(&self, reason: &str) {
        let mut blame = self.blame.lock();
        blame.fail_reason = reason.to_string();
        if let Some(last) = self.last_msg.lock().as_ref() {
            blame.round = last.round_info.clone();
            blame.is_unicast = !last.routing.is_broadcast;
        }
    }

    pub fn blame(&self) -> Blame {
        self.blame.lock().clone()
    }

    /// Attribution on session timeout: peers whose highest observed round
    /// lags the maximum are blamed for the round they are missing; peers
    /// whose broadcast was echoed by others but never reached us are
    /// blamed for a failed broadcast.
    pub fn timeout_blame(&self, party_info: &PartyInfo, cache: &MessageCache) {
        let rounds = self.rounds_seen();
        let max_round = rounds.values().copied().max().unwrap_or(0);
        let local = party_info.local_party().map(|p| p.id.clone());

        for party in party_info.parties() {
            if Some(&party.id) == local.as_ref() {
                continue;
            }
            let seen = rounds.get(&party.id).copied().unwrap_or(0);
            if seen < max_round {
                self.add_blame_node(
                    &party.id,
                    BLAME_MISSING_ROUND,
                    format!("{} {}", BLAME_MISSING_ROUND, seen + 1).into_bytes(),
                );
            }
        }

        for sender in cache.unreceived_broadcast_senders() {
            if Some(&sender) == local.as_ref() {
                continue;
            }
            if party_info.get(&sender).is_some() {
                self.add_blame_node(&sender, BLAME_FAILED_BROADCAST, Vec::new());
            }
        }

        self.set_fail_reason(BLAME_TIMEOUT);
    }
}

impl Default for BlameManager {
    fn default() -> Self {
        Self::new()
    }
}
