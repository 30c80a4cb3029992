#![forbid(unsafe_code)]

//! Seam to the underlying threshold-signature library. The engine is a
//! black box: parties ingest confirmed wire messages and emit outbound
//! round messages plus, eventually, one signature per message digest.

use tokio::sync::mpsc;

use tss_core::KeygenLocalState;

use crate::error::Result;
use crate::messages::WireMessage;
use crate::party::PartyId;

/// The signature a party produces for one message digest. `r`/`s` are
/// big-endian scalars; `signature` is the curve's canonical encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureData {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    pub signature: Vec<u8>,
    pub signature_recovery: Vec<u8>,
    pub msg: Vec<u8>,
}

/// Quorum parameters handed to a party at construction.
#[derive(Clone, Debug)]
pub struct PartyParams {
    pub parties: Vec<PartyId>,
    pub local_party: PartyId,
    pub threshold: usize,
}

/// One in-flight signing computation. `start` emits the first round;
/// `update` feeds it a confirmed inbound frame. A party's intermediate
/// state is not recoverable; a cancelled session discards it.
pub trait SigningParty: Send {
    fn start(&mut self) -> Result<()>;
    fn update(&mut self, msg: &WireMessage) -> Result<()>;
}

/// Factory for signing parties, one per message digest in a session.
pub trait KeysignEngine: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn new_party(
        &self,
        msg: &[u8],
        msg_index: usize,
        params: PartyParams,
        local_state: &KeygenLocalState,
        out_tx: mpsc::UnboundedSender<WireMessage>,
        end_tx: mpsc::UnboundedSender<SignatureData>,
    ) -> Result<Box<dyn SigningParty>>;
}
