#![forbid(unsafe_code)]

//! Subscription multiplexer shared by all sessions on one transport.
//! The transport holds only the subscriber channel, never the session, so
//! cancelling the subscription is all it takes to tear a session down.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::{Message, MessageType};

pub struct MessageRegistry {
    subscribers: Mutex<HashMap<(MessageType, String), mpsc::UnboundedSender<Message>>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register the subscriber channel for `(msg_type, msg_id)`,
    /// replacing any previous one.
    pub fn set_subscribe(
        &self,
        msg_type: MessageType,
        msg_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) {
        self.subscribers
            .lock()
            .insert((msg_type, msg_id.to_string()), sender);
    }

    pub fn get_subscriber(
        &self,
        msg_type: MessageType,
        msg_id: &str,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        self.subscribers
            .lock()
            .get(&(msg_type, msg_id.to_string()))
            .cloned()
    }

    /// Idempotent: cancelling an unknown subscription is a no-op.
    pub fn cancel_subscribe(&self, msg_type: MessageType, msg_id: &str) {
        if self
            .subscribers
            .lock()
            .remove(&(msg_type, msg_id.to_string()))
            .is_none()
        {
            debug!(%msg_type, msg_id, "cancel for unknown subscription ignored");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
