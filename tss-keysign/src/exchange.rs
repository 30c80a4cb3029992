#![forbid(unsafe_code)]

//! The broadcast-confirmation layer. Every inbound frame passes through
//! [`MessageExchange::process_one_message`]; a wire message comes out the
//! other side only once enough peers have echoed the same hash for it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tss_core::conversion::get_threshold;
use tss_core::PeerId;

use crate::blame::{round_from_info, BlameManager, BLAME_UNKNOWN_PARTY};
use crate::cache::{ConfirmOutcome, MessageCache};
use crate::error::{KeysignError, Result};
use crate::messages::{
    BroadcastConfirmMessage, BroadcastEnvelope, MessageType, TssControlMsg, TssTaskNotifier,
    WireMessage, WrappedMessage,
};
use crate::party::PartyInfo;

pub struct MessageExchange {
    msg_id: String,
    cache: Arc<MessageCache>,
    blame: Arc<BlameManager>,
    outbound: mpsc::UnboundedSender<BroadcastEnvelope>,
    party_info: RwLock<Option<Arc<PartyInfo>>>,
    task_done_seen: Mutex<HashSet<String>>,
    task_done_tx: mpsc::UnboundedSender<PeerId>,
}

impl MessageExchange {
    pub fn new(
        msg_id: String,
        cache: Arc<MessageCache>,
        blame: Arc<BlameManager>,
        outbound: mpsc::UnboundedSender<BroadcastEnvelope>,
        task_done_tx: mpsc::UnboundedSender<PeerId>,
    ) -> Self {
        Self {
            msg_id,
            cache,
            blame,
            outbound,
            party_info: RwLock::new(None),
            task_done_seen: Mutex::new(HashSet::new()),
            task_done_tx,
        }
    }

    /// Freeze the quorum for this session. Must happen before any round
    /// traffic is processed.
    pub fn set_party_info(&self, info: Arc<PartyInfo>) {
        *self.party_info.write() = Some(info);
    }

    pub fn party_info(&self) -> Option<Arc<PartyInfo>> {
        self.party_info.read().clone()
    }

    /// Cache one of our own outbound frames so peers can ask for a
    /// resend. Sealed so it is never delivered back into our engine.
    pub fn cache_outbound(&self, wire: &WireMessage) {
        self.cache.note_round(&wire.round_info);
        let item = self.cache.get_or_create(&wire.cache_key());
        item.set_msg(wire.clone(), hash_payload(&wire.message));
        item.seal();
    }

    /// Route one inbound frame. Returns the wire message when it became
    /// deliverable to the signing engine.
    pub fn process_one_message(
        &self,
        wrapped: &WrappedMessage,
        from_peer: &PeerId,
    ) -> Result<Option<WireMessage>> {
        match wrapped.message_type {
            MessageType::TSSKeySignMsg => {
                let wire: WireMessage = serde_json::from_slice(&wrapped.payload)?;
                self.process_tss_msg(wire)
            }
            MessageType::TSSKeySignVerMsg => {
                let confirm: BroadcastConfirmMessage = serde_json::from_slice(&wrapped.payload)?;
                self.process_ver_msg(confirm)
            }
            MessageType::TSSTaskDone => {
                let notifier: TssTaskNotifier = serde_json::from_slice(&wrapped.payload)?;
                self.process_task_done(notifier, from_peer)
            }
            MessageType::TSSControlMsg => {
                let ctrl: TssControlMsg = serde_json::from_slice(&wrapped.payload)?;
                self.process_control(ctrl, from_peer)
            }
            other => {
                debug!(message_type = %other, "dropping frame outside keysign scope");
                Ok(None)
            }
        }
    }

    fn process_tss_msg(&self, wire: WireMessage) -> Result<Option<WireMessage>> {
        let Some(info) = self.party_info() else {
            debug!("round message before quorum was built, dropped");
            return Ok(None);
        };
        if info.get(&wire.routing.from.id).is_none() {
            warn!(from = %wire.routing.from, "round message from unknown party");
            self.blame
                .add_blame_node(&wire.routing.from.id, BLAME_UNKNOWN_PARTY, Vec::new());
            return Ok(None);
        }

        if let Some(round) = round_from_info(&wire.round_info) {
            self.blame.record_round(&wire.routing.from.id, round);
        }
        self.blame.set_last_msg(wire.clone());
        self.cache.note_round(&wire.round_info);

        let key = wire.cache_key();
        let item = self.cache.get_or_create(&key);
        let hash = hash_payload(&wire.message);
        let fresh = item.set_msg(wire.clone(), hash.clone());
        if !fresh && item.delivered() {
            debug!(%key, "late duplicate discarded");
            return Ok(None);
        }

        if !wire.routing.is_broadcast {
            return Ok(item.deliver_direct());
        }

        if fresh {
            if let Some(local) = info.local_party() {
                let confirm = BroadcastConfirmMessage {
                    party_id: local.id.clone(),
                    key: key.clone(),
                    hash,
                };
                let wrapped = WrappedMessage::new(
                    MessageType::TSSKeySignVerMsg,
                    &self.msg_id,
                    serde_json::to_vec(&confirm)?,
                );
                self.send(wrapped, info.remote_peers());
            }
        }

        let needed = get_threshold(info.party_count())?;
        Ok(item.try_deliver(needed))
    }

    fn process_ver_msg(&self, confirm: BroadcastConfirmMessage) -> Result<Option<WireMessage>> {
        let Some(info) = self.party_info() else {
            return Ok(None);
        };
        if info.get(&confirm.party_id).is_none() {
            warn!(party = %confirm.party_id, "hash echo from unknown party");
            self.blame
                .add_blame_node(&confirm.party_id, BLAME_UNKNOWN_PARTY, Vec::new());
            return Ok(None);
        }
        if let Some((_, round_info)) = confirm.key.split_once('-') {
            self.cache.note_round(round_info);
        }

        let item = self.cache.get_or_create(&confirm.key);
        if let ConfirmOutcome::Divergent { observed } =
            item.update_confirm(&confirm.party_id, confirm.hash.clone())
        {
            warn!(
                party = %confirm.party_id,
                key = %confirm.key,
                "hash echo disagrees with witnessed payload"
            );
            self.blame
                .add_equivocation(&confirm.party_id, &observed, &confirm.hash);
        }

        let needed = get_threshold(info.party_count())?;
        Ok(item.try_deliver(needed))
    }

    fn process_task_done(
        &self,
        notifier: TssTaskNotifier,
        from_peer: &PeerId,
    ) -> Result<Option<WireMessage>> {
        if !notifier.task_done {
            return Ok(None);
        }
        if !self.task_done_seen.lock().insert(from_peer.to_string()) {
            return Err(KeysignError::DuplicateNotification(from_peer.to_string()));
        }
        debug!(peer = %from_peer, "peer finished its signing task");
        let _ = self.task_done_tx.send(from_peer.clone());
        Ok(None)
    }

    fn process_control(
        &self,
        ctrl: TssControlMsg,
        from_peer: &PeerId,
    ) -> Result<Option<WireMessage>> {
        let TssControlMsg::MsgRequest { key } = ctrl;
        let Some(info) = self.party_info() else {
            return Ok(None);
        };
        let Some(local) = info.local_party() else {
            return Ok(None);
        };
        let Some(wire) = self.cache.get(&key).and_then(|item| item.msg()) else {
            return Ok(None);
        };
        // only the original sender answers resend requests
        if wire.routing.from.id != local.id {
            return Ok(None);
        }
        debug!(%key, peer = %from_peer, "re-sending cached frame on request");
        let wrapped = WrappedMessage::new(
            MessageType::TSSKeySignMsg,
            &self.msg_id,
            serde_json::to_vec(&wire)?,
        );
        self.send(wrapped, vec![from_peer.clone()]);
        Ok(None)
    }

    /// Ask the frame's original sender directly for a resend of `key`.
    pub fn request_resend(&self, key: String, peer: PeerId) -> Result<()> {
        let ctrl = TssControlMsg::MsgRequest { key };
        let wrapped = WrappedMessage::new(
            MessageType::TSSControlMsg,
            &self.msg_id,
            serde_json::to_vec(&ctrl)?,
        );
        if !self.send(wrapped, vec![peer]) {
            return Err(KeysignError::Transport("outbound channel closed".into()));
        }
        Ok(())
    }

    fn send(&self, wrapped: WrappedMessage, peers: Vec<PeerId>) -> bool {
        if self
            .outbound
            .send(BroadcastEnvelope { wrapped, peers })
            .is_err()
        {
            debug!("outbound channel closed, frame dropped");
            return false;
        }
        true
    }
}

fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
