use crate::chat::ChatMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// UI-facing changes published by the chat widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A message was appended to the transcript
    MessageAdded(ChatMessage),

    /// The identification form should be shown
    IdentificationRequested,

    /// Inline form error (validation or start failure)
    FormError(String),

    /// Identification succeeded; the input is available
    ChatReady { welcome: String },

    /// The typing indicator changed
    Typing(bool),

    /// The "End Chat" affordance was shown or relabelled
    FinishActionShown { label: String },

    /// The conversation was closed; input is disabled
    ConversationEnded,

    /// A fresh conversation was started
    ConversationReset,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
