#![forbid(unsafe_code)]

//! The per-session keysign state machine: drives the signing engine's
//! rounds over the confirmed-broadcast exchange, collects the quorum's
//! task-done notifications and verifies the assembled signatures.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use tss_core::conversion::PubKey;
use tss_core::{KeygenLocalState, LocalStateManager, PeerId, TssConfig};

use crate::blame::{round_from_info, BlameManager, BLAME_SIG_VERIFY};
use crate::cache::MessageCache;
use crate::engine::{KeysignEngine, PartyParams, SignatureData, SigningParty};
use crate::error::{KeysignError, Result};
use crate::exchange::MessageExchange;
use crate::messages::{
    BroadcastEnvelope, Message, MessageType, TssTaskNotifier, WireMessage, WrappedMessage,
};
use crate::notifier::Notifier;
use crate::party::{PartyId, PartyInfo};
use crate::registry::MessageRegistry;

/// How long a round may sit with frames from only part of the quorum
/// before we start asking the stragglers for resends.
const STALL_GRACE: Duration = Duration::from_secs(1);
const STALL_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// The four frame types a keysign session subscribes to.
pub const KEYSIGN_MESSAGE_TYPES: [MessageType; 4] = [
    MessageType::TSSKeySignMsg,
    MessageType::TSSKeySignVerMsg,
    MessageType::TSSControlMsg,
    MessageType::TSSTaskDone,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    QuorumBuilt,
    Running,
    Finalizing,
    Done,
    Blamed,
    TimedOut,
    Stopped,
}

pub struct KeysignSession {
    local_peer_id: PeerId,
    conf: TssConfig,
    outbound: mpsc::UnboundedSender<BroadcastEnvelope>,
    stop_rx: watch::Receiver<bool>,
    msg_id: String,
    node_key: ed25519_dalek::SigningKey,
    registry: Arc<MessageRegistry>,
    engine: Arc<dyn KeysignEngine>,
    threshold: usize,
    state_mgr: Option<Arc<dyn LocalStateManager>>,

    cache: Arc<MessageCache>,
    blame: Arc<BlameManager>,
    exchange: Arc<MessageExchange>,
    state: Mutex<SessionState>,

    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    task_done_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
}

impl KeysignSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer_id: PeerId,
        conf: TssConfig,
        outbound: mpsc::UnboundedSender<BroadcastEnvelope>,
        stop_rx: watch::Receiver<bool>,
        msg_id: impl Into<String>,
        node_key: ed25519_dalek::SigningKey,
        registry: Arc<MessageRegistry>,
        engine: Arc<dyn KeysignEngine>,
        threshold: usize,
    ) -> Self {
        let msg_id = msg_id.into();
        let cache = Arc::new(MessageCache::new());
        let blame = Arc::new(BlameManager::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (task_done_tx, task_done_rx) = mpsc::unbounded_channel();
        let exchange = Arc::new(MessageExchange::new(
            msg_id.clone(),
            cache.clone(),
            blame.clone(),
            outbound.clone(),
            task_done_tx,
        ));
        Self {
            local_peer_id,
            conf,
            outbound,
            stop_rx,
            msg_id,
            node_key,
            registry,
            engine,
            threshold,
            state_mgr: None,
            cache,
            blame,
            exchange,
            state: Mutex::new(SessionState::Init),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            task_done_rx: Mutex::new(Some(task_done_rx)),
        }
    }

    pub fn with_state_manager(mut self, state_mgr: Arc<dyn LocalStateManager>) -> Self {
        self.state_mgr = Some(state_mgr);
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn blame_mgr(&self) -> Arc<BlameManager> {
        self.blame.clone()
    }

    pub fn exchange(&self) -> Arc<MessageExchange> {
        self.exchange.clone()
    }

    /// Sender the transport (or test harness) registers for this
    /// session's four message types.
    pub fn message_channel(&self) -> mpsc::UnboundedSender<Message> {
        self.inbound_tx.clone()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        debug!(msg_id = %self.msg_id, from = ?*state, to = ?next, "session state");
        *state = next;
    }

    fn cancel_subscriptions(&self) {
        for msg_type in KEYSIGN_MESSAGE_TYPES {
            self.registry.cancel_subscribe(msg_type, &self.msg_id);
        }
    }

    /// Load the local share from the configured state manager and sign.
    pub async fn sign_stored(
        &self,
        messages: Vec<Vec<u8>>,
        pool_pub_key: &str,
        signer_pub_keys: &[String],
    ) -> Result<Vec<SignatureData>> {
        let mgr = self
            .state_mgr
            .as_ref()
            .ok_or_else(|| KeysignError::Protocol("no state manager configured".into()))?;
        let local_state = mgr.get_local_state(pool_pub_key)?;
        self.sign_message(messages, &local_state, signer_pub_keys).await
    }

    /// Run one signing session to completion. Signatures come back in the
    /// order of the lexicographically sorted input messages.
    pub async fn sign_message(
        &self,
        messages: Vec<Vec<u8>>,
        local_state: &KeygenLocalState,
        signer_pub_keys: &[String],
    ) -> Result<Vec<SignatureData>> {
        self.set_state(SessionState::Init);

        // the pool pubkey must parse before any network traffic happens
        PubKey::from_bech32(&local_state.pub_key)?;
        let notifier = Notifier::new(&self.msg_id, messages.clone(), &local_state.pub_key)?;

        if signer_pub_keys.len() < self.threshold + 1 {
            return Err(KeysignError::NotEnoughSigners {
                got: signer_pub_keys.len(),
                need: self.threshold + 1,
            });
        }

        let local_pub_key =
            PubKey::Ed25519(self.node_key.verifying_key().to_bytes()).to_bech32()?;
        let party_info = Arc::new(PartyInfo::build(signer_pub_keys, &local_pub_key)?);

        let mut inbound_rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| KeysignError::Protocol("session already started".into()))?;

        if party_info.local_party().is_none() {
            info!(
                msg_id = %self.msg_id,
                peer = %self.local_peer_id,
                "local node is not in the signer set, idling until the quorum finishes"
            );
            let result = self
                .wait_as_observer(&mut inbound_rx, party_info.party_count())
                .await;
            self.cancel_subscriptions();
            return result;
        }

        let mut task_done_rx = self
            .task_done_rx
            .lock()
            .take()
            .ok_or_else(|| KeysignError::Protocol("session already started".into()))?;

        let local_party = party_info
            .local_party()
            .cloned()
            .ok_or_else(|| KeysignError::Party("local party vanished".into()))?;
        self.exchange.set_party_info(party_info.clone());
        self.blame.replace_peers(party_info.remote_peers());
        self.set_state(SessionState::QuorumBuilt);

        // sort so every participant assigns the same index to each digest
        let mut msgs = messages;
        msgs.sort();

        let (out_tx, out_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (end_tx, mut end_rx) = mpsc::unbounded_channel::<SignatureData>();
        let params = PartyParams {
            parties: party_info.parties().to_vec(),
            local_party: local_party.clone(),
            threshold: self.threshold,
        };

        let parties = timeout(self.conf.pre_param_timeout, async {
            let mut parties: Vec<Box<dyn SigningParty>> = Vec::with_capacity(msgs.len());
            for (index, msg) in msgs.iter().enumerate() {
                parties.push(self.engine.new_party(
                    msg,
                    index,
                    params.clone(),
                    local_state,
                    out_tx.clone(),
                    end_tx.clone(),
                )?);
            }
            for party in parties.iter_mut() {
                party.start()?;
            }
            Ok::<_, KeysignError>(parties)
        })
        .await
        .map_err(|_| KeysignError::Timeout(self.msg_id.clone()))??;
        drop(out_tx);
        drop(end_tx);

        info!(
            msg_id = %self.msg_id,
            peer = %self.local_peer_id,
            parties = party_info.party_count(),
            messages = msgs.len(),
            "keysign session started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outbound_worker =
            self.spawn_outbound_worker(out_rx, party_info.clone(), &local_party, shutdown_rx.clone());
        let ingest_worker = self.spawn_ingest_worker(inbound_rx, parties, shutdown_rx);

        self.set_state(SessionState::Running);
        let deadline = Instant::now() + self.conf.key_sign_timeout;
        let mut stop_rx = self.stop_rx.clone();
        let mut resend_tick = interval(STALL_CHECK_INTERVAL);
        resend_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let total = msgs.len();
        let remote_needed = party_info.party_count() - 1;
        let mut collected: Vec<SignatureData> = Vec::with_capacity(total);
        let mut remote_done: HashSet<PeerId> = HashSet::new();
        let mut local_done = false;

        let outcome: Result<()> = loop {
            if local_done && remote_done.len() >= remote_needed {
                break Ok(());
            }
            tokio::select! {
                _ = sleep_until(deadline) => {
                    break Err(KeysignError::Timeout(self.msg_id.clone()));
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        if local_done {
                            // stop after finalization still delivers
                            break Ok(());
                        }
                        break Err(KeysignError::Stopped);
                    }
                }
                maybe = end_rx.recv(), if !local_done => {
                    match maybe {
                        Some(signature) => {
                            collected.push(signature);
                            if collected.len() == total {
                                local_done = true;
                                self.set_state(SessionState::Finalizing);
                                self.broadcast_task_done(&party_info);
                            }
                        }
                        None => {
                            break Err(KeysignError::Protocol(
                                "signing engine ended without producing signatures".into(),
                            ));
                        }
                    }
                }
                maybe = task_done_rx.recv() => {
                    if let Some(peer) = maybe {
                        remote_done.insert(peer);
                    }
                }
                _ = resend_tick.tick() => {
                    self.chase_missing_frames(&party_info, &local_party.id);
                }
            }
        };

        let _ = shutdown_tx.send(true);
        self.cancel_subscriptions();
        let _ = outbound_worker.await;
        let _ = ingest_worker.await;

        match outcome {
            Ok(()) => {
                if !notifier.process_signatures(Some(collected))? {
                    self.blame.set_fail_reason(BLAME_SIG_VERIFY);
                    self.set_state(SessionState::Blamed);
                    return Err(KeysignError::SignatureVerify);
                }
                let mut resp_rx = notifier
                    .response_channel()
                    .ok_or_else(|| KeysignError::Protocol("notifier channel already taken".into()))?;
                let mut signatures = resp_rx
                    .recv()
                    .await
                    .flatten()
                    .ok_or(KeysignError::SignatureVerify)?;
                signatures.sort_by(|a, b| a.msg.cmp(&b.msg));
                self.set_state(SessionState::Done);
                info!(msg_id = %self.msg_id, peer = %self.local_peer_id, "keysign complete");
                Ok(signatures)
            }
            Err(KeysignError::Timeout(id)) => {
                self.set_state(SessionState::TimedOut);
                self.blame.timeout_blame(&party_info, &self.cache);
                let _ = notifier.process_signatures(None);
                warn!(
                    msg_id = %self.msg_id,
                    peer = %self.local_peer_id,
                    blamed = self.blame.blame().blame_nodes.len(),
                    "keysign timed out"
                );
                Err(KeysignError::Timeout(id))
            }
            Err(KeysignError::Stopped) => {
                self.set_state(SessionState::Stopped);
                let _ = notifier.process_signatures(None);
                info!(msg_id = %self.msg_id, peer = %self.local_peer_id, "keysign stopped");
                Err(KeysignError::Stopped)
            }
            Err(err) => {
                self.set_state(SessionState::Blamed);
                let _ = notifier.process_signatures(None);
                Err(err)
            }
        }
    }

    fn spawn_outbound_worker(
        &self,
        mut out_rx: mpsc::UnboundedReceiver<WireMessage>,
        party_info: Arc<PartyInfo>,
        local_party: &PartyId,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let exchange = self.exchange.clone();
        let blame = self.blame.clone();
        let outbound = self.outbound.clone();
        let msg_id = self.msg_id.clone();
        let local_party_id = local_party.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    maybe = out_rx.recv() => {
                        let Some(wire) = maybe else { break };
                        if let Some(round) = round_from_info(&wire.round_info) {
                            blame.record_round(&local_party_id, round);
                        }
                        blame.set_last_msg(wire.clone());
                        exchange.cache_outbound(&wire);

                        let peers = if wire.routing.is_broadcast {
                            blame.peers()
                        } else {
                            wire.routing
                                .to
                                .iter()
                                .filter_map(|p| party_info.peer_for(&p.id).cloned())
                                .collect()
                        };
                        let payload = match serde_json::to_vec(&wire) {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(error = %err, "failed to encode outbound wire message");
                                continue;
                            }
                        };
                        let wrapped =
                            WrappedMessage::new(MessageType::TSSKeySignMsg, &msg_id, payload);
                        if outbound.send(BroadcastEnvelope { wrapped, peers }).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_ingest_worker(
        &self,
        mut inbound_rx: mpsc::UnboundedReceiver<Message>,
        mut parties: Vec<Box<dyn SigningParty>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let exchange = self.exchange.clone();
        let msg_id = self.msg_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    maybe = inbound_rx.recv() => {
                        let Some(message) = maybe else { break };
                        let wrapped = match WrappedMessage::from_bytes(&message.payload) {
                            Ok(wrapped) => wrapped,
                            Err(err) => {
                                debug!(error = %err, peer = %message.peer_id, "undecodable frame");
                                continue;
                            }
                        };
                        if wrapped.msg_id != msg_id {
                            continue;
                        }
                        match exchange.process_one_message(&wrapped, &message.peer_id) {
                            Ok(Some(wire)) => {
                                for party in parties.iter_mut() {
                                    if let Err(err) = party.update(&wire) {
                                        warn!(
                                            error = %err,
                                            round = %wire.round_info,
                                            "engine rejected confirmed message"
                                        );
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!(error = %err, peer = %message.peer_id, "failed to process frame");
                            }
                        }
                    }
                }
            }
        })
    }

    fn broadcast_task_done(&self, party_info: &PartyInfo) {
        let note = TssTaskNotifier { task_done: true };
        let payload = match serde_json::to_vec(&note) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode task-done notifier");
                return;
            }
        };
        let wrapped = WrappedMessage::new(MessageType::TSSTaskDone, &self.msg_id, payload);
        let envelope = BroadcastEnvelope {
            wrapped,
            peers: party_info.remote_peers(),
        };
        if self.outbound.send(envelope).is_err() {
            warn!(msg_id = %self.msg_id, "transport closed before task-done notification");
        }
    }

    /// Ask stragglers directly for frames a round has been missing for
    /// longer than the grace period. Peers without a matching cached
    /// frame simply ignore the request.
    fn chase_missing_frames(&self, party_info: &PartyInfo, local_party_id: &str) {
        for round_info in self.cache.round_infos() {
            let Some(first_seen) = self.cache.first_seen(&round_info) else {
                continue;
            };
            if first_seen.elapsed() < STALL_GRACE {
                continue;
            }
            let senders = self.cache.senders_for(&round_info);
            for party in party_info.parties() {
                if party.id == local_party_id || senders.contains(&party.id) {
                    continue;
                }
                let key = format!("{}-{}", party.id, round_info);
                if let Some(peer) = party_info.peer_for(&party.id) {
                    debug!(%key, peer = %peer, "requesting resend of missing frame");
                    if let Err(err) = self.exchange.request_resend(key, peer.clone()) {
                        warn!(error = %err, "failed to request resend");
                    }
                }
            }
        }
    }

    async fn wait_as_observer(
        &self,
        inbound_rx: &mut mpsc::UnboundedReceiver<Message>,
        quorum: usize,
    ) -> Result<Vec<SignatureData>> {
        self.set_state(SessionState::Running);
        let deadline = Instant::now() + self.conf.key_sign_timeout;
        let mut stop_rx = self.stop_rx.clone();
        let mut done: HashSet<PeerId> = HashSet::new();

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        self.set_state(SessionState::Stopped);
                        return Err(KeysignError::Stopped);
                    }
                }
                maybe = inbound_rx.recv() => {
                    let Some(message) = maybe else { break };
                    let Ok(wrapped) = WrappedMessage::from_bytes(&message.payload) else {
                        continue;
                    };
                    if wrapped.msg_id != self.msg_id
                        || wrapped.message_type != MessageType::TSSTaskDone
                    {
                        continue;
                    }
                    if let Ok(note) = serde_json::from_slice::<TssTaskNotifier>(&wrapped.payload) {
                        if note.task_done {
                            done.insert(message.peer_id);
                            if done.len() >= quorum {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.set_state(SessionState::Done);
        Ok(Vec::new())
    }
}
