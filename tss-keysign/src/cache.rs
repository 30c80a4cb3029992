#![forbid(unsafe_code)]

//! Per-(sender, round) message cache. Items live for the whole session so
//! late confirmations and blame introspection can still find them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::messages::WireMessage;

/// Result of folding one hash echo into a cache item.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Recorded,
    /// The echo disagrees with the payload we witnessed.
    Divergent { observed: String },
}

#[derive(Default)]
struct ItemInner {
    msg: Option<WireMessage>,
    hash: String,
    confirmed: HashMap<String, String>,
    delivered: bool,
}

/// One (sender, round) slot. Each item carries its own lock; the
/// transport ingest worker and the confirm path may touch it concurrently.
#[derive(Default)]
pub struct LocalCacheItem {
    inner: Mutex<ItemInner>,
}

impl LocalCacheItem {
    /// Record the payload. Returns false when a payload was already
    /// witnessed for this slot (the duplicate is discarded).
    pub fn set_msg(&self, msg: WireMessage, hash: String) -> bool {
        let mut inner = self.inner.lock();
        if inner.msg.is_some() {
            return false;
        }
        inner.msg = Some(msg);
        inner.hash = hash;
        true
    }

    pub fn msg(&self) -> Option<WireMessage> {
        self.inner.lock().msg.clone()
    }

    pub fn hash(&self) -> String {
        self.inner.lock().hash.clone()
    }

    pub fn update_confirm(&self, party_id: &str, hash: String) -> ConfirmOutcome {
        let mut inner = self.inner.lock();
        let divergent = inner.msg.is_some() && inner.hash != hash;
        let observed = inner.hash.clone();
        inner.confirmed.insert(party_id.to_string(), hash);
        if divergent {
            ConfirmOutcome::Divergent { observed }
        } else {
            ConfirmOutcome::Recorded
        }
    }

    pub fn total_confirmed(&self) -> usize {
        self.inner.lock().confirmed.len()
    }

    pub fn confirmed_matching(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .confirmed
            .values()
            .filter(|h| **h == inner.hash)
            .count()
    }

    pub fn delivered(&self) -> bool {
        self.inner.lock().delivered
    }

    /// Hand the payload out exactly once, after the payload is present and
    /// at least `needed` echoes agree with it.
    pub fn try_deliver(&self, needed: usize) -> Option<WireMessage> {
        let mut inner = self.inner.lock();
        if inner.delivered || inner.msg.is_none() {
            return None;
        }
        let matching = inner
            .confirmed
            .values()
            .filter(|h| **h == inner.hash)
            .count();
        if matching < needed {
            return None;
        }
        inner.delivered = true;
        inner.msg.clone()
    }

    /// Immediate delivery for unicast frames (no echo quorum).
    pub fn deliver_direct(&self) -> Option<WireMessage> {
        let mut inner = self.inner.lock();
        if inner.delivered {
            return None;
        }
        inner.delivered = true;
        inner.msg.clone()
    }

    /// Mark delivered without handing the payload out. Used for our own
    /// outbound frames, which are cached for resends but must never be
    /// fed back into the local engine.
    pub fn seal(&self) {
        self.inner.lock().delivered = true;
    }
}

pub struct MessageCache {
    items: Mutex<HashMap<String, Arc<LocalCacheItem>>>,
    round_first_seen: Mutex<HashMap<String, Instant>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            round_first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<LocalCacheItem> {
        self.items
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<LocalCacheItem>> {
        self.items.lock().get(key).cloned()
    }

    /// Remember when traffic for a round string was first observed; the
    /// stall detector keys its grace period off this.
    pub fn note_round(&self, round_info: &str) {
        self.round_first_seen
            .lock()
            .entry(round_info.to_string())
            .or_insert_with(Instant::now);
    }

    pub fn first_seen(&self, round_info: &str) -> Option<Instant> {
        self.round_first_seen.lock().get(round_info).copied()
    }

    pub fn round_infos(&self) -> Vec<String> {
        self.round_first_seen.lock().keys().cloned().collect()
    }

    /// Party ids that have a witnessed payload for the given round string.
    pub fn senders_for(&self, round_info: &str) -> HashSet<String> {
        let items = self.items.lock();
        items
            .iter()
            .filter_map(|(key, item)| {
                let (sender, rest) = key.split_once('-')?;
                (rest == round_info && item.msg().is_some()).then(|| sender.to_string())
            })
            .collect()
    }

    /// Senders whose broadcasts were confirmed by someone but whose
    /// payload never reached us. Evidence for "failed broadcast" blame.
    pub fn unreceived_broadcast_senders(&self) -> HashSet<String> {
        let items = self.items.lock();
        items
            .iter()
            .filter_map(|(key, item)| {
                let (sender, _) = key.split_once('-')?;
                (item.msg().is_none() && item.total_confirmed() > 0).then(|| sender.to_string())
            })
            .collect()
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRouting;
    use crate::party::PartyId;

    fn wire(from: &str, round_info: &str) -> WireMessage {
        WireMessage {
            routing: MessageRouting {
                from: PartyId {
                    id: from.to_string(),
                    key: from.as_bytes().to_vec(),
                    index: 1,
                },
                to: Vec::new(),
                is_broadcast: true,
            },
            round_info: round_info.to_string(),
            message: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_delivery_requires_payload_and_quorum() {
        let item = LocalCacheItem::default();
        assert!(item.try_deliver(2).is_none());

        item.update_confirm("a", "h1".into());
        item.update_confirm("b", "h1".into());
        assert!(item.try_deliver(2).is_none());

        assert!(item.set_msg(wire("x", "KeySignRound1Msg0"), "h1".into()));
        let delivered = item.try_deliver(2).unwrap();
        assert_eq!(delivered.round_info, "KeySignRound1Msg0");

        // one-shot
        assert!(item.try_deliver(2).is_none());
        assert!(item.delivered());
    }

    #[test]
    fn test_divergent_confirm_detected() {
        let item = LocalCacheItem::default();
        assert!(item.set_msg(wire("x", "KeySignRound2Msg0"), "good".into()));
        assert_eq!(
            item.update_confirm("a", "good".into()),
            ConfirmOutcome::Recorded
        );
        assert_eq!(
            item.update_confirm("b", "evil".into()),
            ConfirmOutcome::Divergent {
                observed: "good".into()
            }
        );
        assert_eq!(item.total_confirmed(), 2);
        assert_eq!(item.confirmed_matching(), 1);
    }

    #[test]
    fn test_duplicate_payload_discarded() {
        let item = LocalCacheItem::default();
        assert!(item.set_msg(wire("x", "KeySignRound1Msg0"), "h".into()));
        assert!(!item.set_msg(wire("x", "KeySignRound1Msg0"), "other".into()));
        assert_eq!(item.hash(), "h");
    }

    #[test]
    fn test_senders_for_round() {
        let cache = MessageCache::new();
        let a = cache.get_or_create("pa-KeySignRound3Msg0");
        a.set_msg(wire("pa", "KeySignRound3Msg0"), "h".into());
        // confirm-only item: no payload yet, so not a sender
        cache.get_or_create("pb-KeySignRound3Msg0");

        let senders = cache.senders_for("KeySignRound3Msg0");
        assert!(senders.contains("pa"));
        assert!(!senders.contains("pb"));
    }

    #[test]
    fn test_unreceived_broadcast_senders() {
        let cache = MessageCache::new();
        let item = cache.get_or_create("pc-KeySignRound4Msg0");
        item.update_confirm("pa", "h".into());
        assert!(cache.unreceived_broadcast_senders().contains("pc"));

        item.set_msg(wire("pc", "KeySignRound4Msg0"), "h".into());
        assert!(cache.unreceived_broadcast_senders().is_empty());
    }
}
