//! Notifier: best-effort delivery to the submitting user and the ops chat.
//!
//! Failures are logged and reported as `false`; they never abort the
//! operation that triggered the notification.

use std::sync::Arc;

use tracing::warn;

use crate::channels::{ChatId, ChatTransport, OutgoingMessage};

pub struct Notifier {
    transport: Arc<dyn ChatTransport>,
    ops_chat_id: ChatId,
}

impl Notifier {
    pub fn new(transport: Arc<dyn ChatTransport>, ops_chat_id: ChatId) -> Arc<Self> {
        Arc::new(Self {
            transport,
            ops_chat_id,
        })
    }

    /// The underlying transport, for non-message calls (invoices, callbacks).
    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn ops_chat_id(&self) -> ChatId {
        self.ops_chat_id
    }

    /// Send to a user's chat.
    pub async fn to_user(&self, chat_id: ChatId, message: impl Into<OutgoingMessage>) -> bool {
        match self.transport.send(chat_id, message.into()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to notify user");
                false
            }
        }
    }

    /// Send to the operations chat.
    pub async fn to_ops(&self, text: impl Into<String>) -> bool {
        match self
            .transport
            .send(self.ops_chat_id, OutgoingMessage::text(text))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(ops_chat_id = self.ops_chat_id, error = %e, "Failed to notify operations");
                false
            }
        }
    }
}
