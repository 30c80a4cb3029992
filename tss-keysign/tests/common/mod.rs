#![forbid(unsafe_code)]

//! Shared harness for the end-to-end tests: an in-memory transport hub
//! and a paced, scripted signing engine standing in for the threshold
//! library.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Signer;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use tss_core::conversion::PubKey;
use tss_core::{KeygenLocalState, PeerId, TssConfig};

use tss_keysign::{
    round_from_info, BlameManager, BroadcastEnvelope, KeysignEngine, KeysignSession, Message,
    MessageRegistry, MessageRouting, PartyParams, SignatureData, SigningParty, WireMessage,
    KEYSIGN_MESSAGE_TYPES,
};

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
    tss_core::setup_bech32_prefix("oppy");
}

/// Routes [`BroadcastEnvelope`]s between per-node registries, the way the
/// gossip transport would. Unknown targets are silently dropped.
pub struct MemoryHub {
    registries: Arc<Mutex<HashMap<PeerId, Arc<MessageRegistry>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            registries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn join(
        &self,
        peer: PeerId,
    ) -> (Arc<MessageRegistry>, mpsc::UnboundedSender<BroadcastEnvelope>) {
        let registry = Arc::new(MessageRegistry::new());
        self.registries.lock().insert(peer.clone(), registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel::<BroadcastEnvelope>();
        let registries = self.registries.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                deliver(&registries, &peer, envelope);
            }
        });
        (registry, tx)
    }
}

fn deliver(
    registries: &Mutex<HashMap<PeerId, Arc<MessageRegistry>>>,
    from: &PeerId,
    envelope: BroadcastEnvelope,
) {
    let Ok(payload) = envelope.wrapped.to_bytes() else {
        return;
    };
    let registries = registries.lock();
    for target in &envelope.peers {
        if target == from {
            continue;
        }
        let Some(registry) = registries.get(target) else {
            continue;
        };
        if let Some(subscriber) =
            registry.get_subscriber(envelope.wrapped.message_type, &envelope.wrapped.msg_id)
        {
            let _ = subscriber.send(Message {
                peer_id: from.clone(),
                payload: payload.clone(),
            });
        }
    }
}

/// A deterministic multi-round "protocol": each party broadcasts one
/// frame per round and advances only once every other party's frame for
/// the current round has been delivered. After the last round it emits
/// the pool key's real Ed25519 signature over the message, so every
/// party produces byte-identical, verifiable output.
pub struct ScriptedEngine {
    rounds: u32,
    round_delay: Duration,
}

impl ScriptedEngine {
    pub fn new(rounds: u32, round_delay: Duration) -> Self {
        Self {
            rounds,
            round_delay,
        }
    }
}

impl KeysignEngine for ScriptedEngine {
    fn new_party(
        &self,
        msg: &[u8],
        msg_index: usize,
        params: PartyParams,
        local_state: &KeygenLocalState,
        out_tx: mpsc::UnboundedSender<WireMessage>,
        end_tx: mpsc::UnboundedSender<SignatureData>,
    ) -> tss_keysign::Result<Box<dyn SigningParty>> {
        let secret: [u8; 32] = local_state
            .local_data
            .as_slice()
            .try_into()
            .map_err(|_| tss_keysign::KeysignError::Party("share blob must be 32 bytes".into()))?;
        Ok(Box::new(ScriptedParty {
            rounds: self.rounds,
            round_delay: self.round_delay,
            msg: msg.to_vec(),
            msg_index,
            params,
            secret,
            emitted: 0,
            finished: false,
            received: HashMap::new(),
            out_tx,
            end_tx,
        }))
    }
}

struct ScriptedParty {
    rounds: u32,
    round_delay: Duration,
    msg: Vec<u8>,
    msg_index: usize,
    params: PartyParams,
    secret: [u8; 32],
    emitted: u32,
    finished: bool,
    received: HashMap<u32, HashSet<String>>,
    out_tx: mpsc::UnboundedSender<WireMessage>,
    end_tx: mpsc::UnboundedSender<SignatureData>,
}

impl ScriptedParty {
    fn round_info(&self, round: u32) -> String {
        format!("KeySignRound{}Msg{}", round, self.msg_index)
    }

    fn emit(&mut self, round: u32) {
        let wire = WireMessage {
            routing: MessageRouting {
                from: self.params.local_party.clone(),
                to: Vec::new(),
                is_broadcast: true,
            },
            round_info: self.round_info(round),
            message: format!(
                "round{}:party{}:msg{}",
                round, self.params.local_party.index, self.msg_index
            )
            .into_bytes(),
        };
        self.emitted = round;
        if round == 1 {
            let _ = self.out_tx.send(wire);
        } else {
            // pace the protocol so tests can observe and interfere
            // mid-session, the way a real signing round takes time
            let tx = self.out_tx.clone();
            let delay = self.round_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(wire);
            });
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        let signing = ed25519_dalek::SigningKey::from_bytes(&self.secret);
        let sig = signing.sign(&self.msg).to_bytes();
        let _ = self.end_tx.send(SignatureData {
            r: sig[..32].to_vec(),
            s: sig[32..].to_vec(),
            signature: sig.to_vec(),
            signature_recovery: Vec::new(),
            msg: self.msg.clone(),
        });
    }

    fn advance(&mut self) {
        loop {
            if self.finished {
                return;
            }
            let others = self.params.parties.len() - 1;
            let have = self
                .received
                .get(&self.emitted)
                .map(|s| s.len())
                .unwrap_or(0);
            if have < others {
                return;
            }
            if self.emitted == self.rounds {
                self.finish();
                return;
            }
            let next = self.emitted + 1;
            self.emit(next);
        }
    }
}

impl SigningParty for ScriptedParty {
    fn start(&mut self) -> tss_keysign::Result<()> {
        self.emit(1);
        Ok(())
    }

    fn update(&mut self, msg: &WireMessage) -> tss_keysign::Result<()> {
        if !msg.round_info.ends_with(&format!("Msg{}", self.msg_index)) {
            return Ok(());
        }
        if msg.routing.from.id == self.params.local_party.id {
            return Ok(());
        }
        let Some(round) = round_from_info(&msg.round_info) else {
            return Ok(());
        };
        self.received
            .entry(round)
            .or_default()
            .insert(msg.routing.from.id.clone());
        self.advance();
        Ok(())
    }
}

pub struct TestNode {
    pub session: Arc<KeysignSession>,
    pub stop_tx: Arc<watch::Sender<bool>>,
    pub pub_key: String,
    pub local_state: KeygenLocalState,
}

/// The shared pool key every node's share blob resolves to. The scripted
/// engine signs with it directly, so the assembled signatures verify
/// under the pool pubkey exactly like a real threshold signature would.
pub fn pool_fixture() -> (String, [u8; 32]) {
    let secret = [42u8; 32];
    let signing = ed25519_dalek::SigningKey::from_bytes(&secret);
    let pool = PubKey::Ed25519(signing.verifying_key().to_bytes())
        .to_bech32()
        .unwrap();
    (pool, secret)
}

#[allow(clippy::too_many_arguments)]
pub fn make_node(
    hub: &MemoryHub,
    seed: u8,
    msg_id: &str,
    conf: TssConfig,
    rounds: u32,
    round_delay: Duration,
    threshold: usize,
    signer_pub_keys: &[String],
) -> TestNode {
    let (pool, pool_secret) = pool_fixture();
    let node_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    let pub_key = PubKey::Ed25519(node_key.verifying_key().to_bytes())
        .to_bech32()
        .unwrap();
    let peer_id = PubKey::Ed25519(node_key.verifying_key().to_bytes()).peer_id();

    let (registry, outbound_tx) = hub.join(peer_id.clone());
    let (stop_tx, stop_rx) = watch::channel(false);
    let session = Arc::new(KeysignSession::new(
        peer_id.clone(),
        conf,
        outbound_tx,
        stop_rx,
        msg_id,
        node_key,
        registry.clone(),
        Arc::new(ScriptedEngine::new(rounds, round_delay)),
        threshold,
    ));
    for msg_type in KEYSIGN_MESSAGE_TYPES {
        registry.set_subscribe(msg_type, msg_id, session.message_channel());
    }

    let local_state = KeygenLocalState {
        pub_key: pool,
        local_data: pool_secret.to_vec(),
        participant_keys: signer_pub_keys.to_vec(),
        local_party_key: pub_key.clone(),
    };
    TestNode {
        session,
        stop_tx: Arc::new(stop_tx),
        pub_key,
        local_state,
    }
}

pub fn node_pub_key(seed: u8) -> String {
    let key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    PubKey::Ed25519(key.verifying_key().to_bytes())
        .to_bech32()
        .unwrap()
}

/// Poll the blame manager's last message (the test-only instrumentation
/// path) and fire the stop signal once the protocol passes `after_round`.
pub async fn observe_and_stop(
    blame: Arc<BlameManager>,
    stop_tx: Arc<watch::Sender<bool>>,
    after_round: u32,
) {
    for _ in 0..30_000 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Some(last) = blame.last_msg() {
            if let Some(round) = round_from_info(&last.round_info) {
                if round > after_round {
                    let _ = stop_tx.send(true);
                    return;
                }
            }
        }
    }
}

/// Re-point the node's round traffic at a disjoint target set once the
/// protocol passes `after_round`.
pub async fn observe_and_redirect(blame: Arc<BlameManager>, targets: Vec<PeerId>, after_round: u32) {
    for _ in 0..30_000 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Some(last) = blame.last_msg() {
            if let Some(round) = round_from_info(&last.round_info) {
                if round > after_round {
                    blame.replace_peers(targets);
                    return;
                }
            }
        }
    }
}
