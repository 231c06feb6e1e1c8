//! Transport-neutral inbound events and the outbound `ChatTransport` trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Stable identifier of the person talking to the bot.
pub type UserId = i64;

/// Identifier of a chat (private chat with a user, or the ops group).
pub type ChatId = i64;

/// Stream of inbound events produced by a transport.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Who sent an event and where replies should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub user_id: UserId,
    pub chat_id: ChatId,
    /// Display name, if the transport knows one.
    pub display_name: Option<String>,
}

impl Sender {
    pub fn new(user_id: UserId, chat_id: ChatId) -> Self {
        Self {
            user_id,
            chat_id,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name used in operations messages.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{name} (ID {})", self.user_id),
            None => format!("ID {}", self.user_id),
        }
    }
}

/// An event delivered by the chat transport.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// Plain text message (commands included).
    Text { from: Sender, text: String },
    /// Inline button press.
    Button {
        from: Sender,
        callback_id: String,
        message_id: Option<i64>,
        data: String,
    },
    /// Processor asks for a go/no-go before moving funds.
    PreCheckout {
        from: Sender,
        query_id: String,
        payload: String,
        total_amount: i64,
        currency: String,
    },
    /// Processor reports that funds were moved.
    PaymentSucceeded {
        from: Sender,
        payload: String,
        total_amount: i64,
        currency: String,
        provider_charge_id: Option<String>,
    },
}

impl InboundEvent {
    pub fn sender(&self) -> &Sender {
        match self {
            Self::Text { from, .. }
            | Self::Button { from, .. }
            | Self::PreCheckout { from, .. }
            | Self::PaymentSucceeded { from, .. } => from,
        }
    }
}

/// One inline button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Inline keyboard attached to a message, one `Vec` per row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    /// One button per row.
    pub fn column(buttons: impl IntoIterator<Item = Button>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }
}

/// Outbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

impl From<&str> for OutgoingMessage {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for OutgoingMessage {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

/// Invoice handed to the payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub title: String,
    pub description: String,
    /// Opaque payload echoed back in processor callbacks.
    pub payload: String,
    pub currency: String,
    pub price_label: String,
    /// Amount in the smallest unit of `currency`.
    pub amount: i64,
}

/// Answer to a pre-checkout query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreCheckoutAnswer {
    Approve,
    Deny { reason: String },
}

impl PreCheckoutAnswer {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

/// Escape user-supplied text for HTML-formatted messages.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Outbound operations the core needs from a chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Send a message to a chat.
    async fn send(&self, chat_id: ChatId, message: OutgoingMessage) -> Result<(), ChannelError>;

    /// Replace the text (and keyboard) of an earlier message.
    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: i64,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError>;

    /// Acknowledge a button press.
    async fn answer_button(&self, callback_id: &str) -> Result<(), ChannelError>;

    /// Approve or deny a pre-checkout query.
    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        answer: &PreCheckoutAnswer,
    ) -> Result<(), ChannelError>;

    /// Present an invoice to a chat.
    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> Result<(), ChannelError>;
}

/// A transport that can also produce inbound events.
#[async_trait]
pub trait Channel: ChatTransport {
    /// Start receiving events.
    async fn start(&self) -> Result<EventStream, ChannelError>;

    /// Check that the transport is reachable.
    async fn health_check(&self) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_label_with_and_without_name() {
        assert_eq!(Sender::new(7, 7).label(), "ID 7");
        assert_eq!(
            Sender::new(7, 7).with_display_name("Анна").label(),
            "Анна (ID 7)"
        );
    }

    #[test]
    fn keyboard_column_puts_one_button_per_row() {
        let kb = Keyboard::column([Button::new("a", "1"), Button::new("b", "2")]);
        assert_eq!(kb.rows.len(), 2);
        assert_eq!(kb.rows[1][0].callback_data, "2");
    }

    #[test]
    fn escape_html_special_chars() {
        assert_eq!(escape_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
        assert_eq!(escape_html("Сбербанк"), "Сбербанк");
    }

    #[test]
    fn event_sender_accessor() {
        let event = InboundEvent::PreCheckout {
            from: Sender::new(1, 2),
            query_id: "q".into(),
            payload: "p".into(),
            total_amount: 10,
            currency: "RUB".into(),
        };
        assert_eq!(event.sender().chat_id, 2);
    }
}
