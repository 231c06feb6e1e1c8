//! In-memory transport that records every outbound call.
//!
//! Used to drive the engines without a network, in tests and local runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channels::{ChatId, ChatTransport, Invoice, OutgoingMessage, PreCheckoutAnswer};
use crate::error::ChannelError;

/// One recorded outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Message {
        chat_id: ChatId,
        message: OutgoingMessage,
    },
    Edit {
        chat_id: ChatId,
        message_id: i64,
        message: OutgoingMessage,
    },
    ButtonAnswer {
        callback_id: String,
    },
    PreCheckout {
        query_id: String,
        answer: PreCheckoutAnswer,
    },
    Invoice {
        chat_id: ChatId,
        invoice: Invoice,
    },
}

#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentItem>>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentItem> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Texts of plain messages and edits delivered to `chat_id`, in order.
    pub fn texts_to(&self, chat_id: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|item| match item {
                SentItem::Message { chat_id: c, message } | SentItem::Edit { chat_id: c, message, .. }
                    if c == chat_id =>
                {
                    Some(message.text)
                }
                _ => None,
            })
            .collect()
    }

    /// Messages (not edits) delivered to `chat_id`, keyboards included.
    pub fn messages_to(&self, chat_id: ChatId) -> Vec<OutgoingMessage> {
        self.sent()
            .into_iter()
            .filter_map(|item| match item {
                SentItem::Message { chat_id: c, message } if c == chat_id => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn invoices_to(&self, chat_id: ChatId) -> Vec<Invoice> {
        self.sent()
            .into_iter()
            .filter_map(|item| match item {
                SentItem::Invoice { chat_id: c, invoice } if c == chat_id => Some(invoice),
                _ => None,
            })
            .collect()
    }

    pub fn pre_checkout_answers(&self) -> Vec<(String, PreCheckoutAnswer)> {
        self.sent()
            .into_iter()
            .filter_map(|item| match item {
                SentItem::PreCheckout { query_id, answer } => Some((query_id, answer)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, item: SentItem) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: "memory".into(),
                reason: "transport set to fail".into(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(item);
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, chat_id: ChatId, message: OutgoingMessage) -> Result<(), ChannelError> {
        self.record(SentItem::Message { chat_id, message })
    }

    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: i64,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        self.record(SentItem::Edit {
            chat_id,
            message_id,
            message,
        })
    }

    async fn answer_button(&self, callback_id: &str) -> Result<(), ChannelError> {
        self.record(SentItem::ButtonAnswer {
            callback_id: callback_id.to_string(),
        })
    }

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        answer: &PreCheckoutAnswer,
    ) -> Result<(), ChannelError> {
        self.record(SentItem::PreCheckout {
            query_id: query_id.to_string(),
            answer: answer.clone(),
        })
    }

    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> Result<(), ChannelError> {
        self.record(SentItem::Invoice {
            chat_id,
            invoice: invoice.clone(),
        })
    }
}
