#![forbid(unsafe_code)]

mod blame;
mod cache;
mod engine;
mod error;
mod exchange;
mod keysign;
mod messages;
mod notifier;
mod party;
mod registry;
mod request;

pub use blame::{
    round_from_info, Blame, BlameManager, BlameNode, BLAME_EQUIVOCATION, BLAME_FAILED_BROADCAST,
    BLAME_MISSING_ROUND, BLAME_SIG_VERIFY, BLAME_TIMEOUT, BLAME_UNKNOWN_PARTY,
};
pub use cache::{ConfirmOutcome, LocalCacheItem, MessageCache};
pub use engine::{KeysignEngine, PartyParams, SignatureData, SigningParty};
pub use error::{KeysignError, Result};
pub use exchange::MessageExchange;
pub use keysign::{KeysignSession, SessionState, KEYSIGN_MESSAGE_TYPES};
pub use messages::{
    BroadcastConfirmMessage, BroadcastEnvelope, Message, MessageRouting, MessageType,
    TssControlMsg, TssTaskNotifier, WireMessage, WrappedMessage,
};
pub use notifier::Notifier;
pub use party::{PartyId, PartyInfo};
pub use registry::MessageRegistry;
pub use request::Request;
