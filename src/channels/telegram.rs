//! Telegram channel: long-polls the Bot API for updates.
//!
//! Native Bot API implementation over `reqwest`: text messages, inline
//! buttons, invoices, pre-checkout queries and successful payments.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::channels::{
    Channel, ChatId, ChatTransport, EventStream, InboundEvent, Invoice, Keyboard,
    OutgoingMessage, PreCheckoutAnswer, Sender,
};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Back-off after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Telegram channel: connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    provider_token: SecretString,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, provider_token: SecretString) -> Self {
        Self {
            bot_token,
            provider_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    /// POST a Bot API method and check the `ok` flag.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| send_failed(format!("{method}: {e}")))?;

        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| send_failed(format!("{method}: unreadable response ({status}): {e}")))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(data.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            Err(send_failed(format!("{method} failed ({status}): {description}")))
        }
    }

    /// Send a single chunk, HTML first with plain-text fallback.
    async fn send_chunk(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(kb) = keyboard {
            body["reply_markup"] = keyboard_markup(kb);
        }

        match self.call("sendMessage", &body).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    chat_id,
                    error = %e,
                    "Telegram sendMessage with HTML failed; retrying without parse_mode"
                );
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.call("sendMessage", &body).await.map(|_| ())
            }
        }
    }
}

fn api_url(token: &SecretString, method: &str) -> String {
    format!(
        "https://api.telegram.org/bot{}/{method}",
        token.expose_secret()
    )
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

/// Render a keyboard as Bot API `reply_markup`.
fn keyboard_markup(keyboard: &Keyboard) -> Value {
    let rows: Vec<Value> = keyboard
        .rows
        .iter()
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|b| json!({"text": b.text, "callback_data": b.callback_data}))
                    .collect(),
            )
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

// ── Transport implementation ────────────────────────────────────────

#[async_trait]
impl ChatTransport for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, chat_id: ChatId, message: OutgoingMessage) -> Result<(), ChannelError> {
        let chunks = split_message(&message.text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            // Keyboard rides on the final chunk only.
            let keyboard = if i == last {
                message.keyboard.as_ref()
            } else {
                None
            };
            self.send_chunk(chat_id, chunk, keyboard).await?;
        }
        Ok(())
    }

    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: i64,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": message.text,
            "parse_mode": "HTML",
        });
        if let Some(kb) = &message.keyboard {
            body["reply_markup"] = keyboard_markup(kb);
        }
        self.call("editMessageText", &body).await.map(|_| ())
    }

    async fn answer_button(&self, callback_id: &str) -> Result<(), ChannelError> {
        self.call(
            "answerCallbackQuery",
            &json!({ "callback_query_id": callback_id }),
        )
        .await
        .map(|_| ())
    }

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        answer: &PreCheckoutAnswer,
    ) -> Result<(), ChannelError> {
        let body = match answer {
            PreCheckoutAnswer::Approve => json!({
                "pre_checkout_query_id": query_id,
                "ok": true,
            }),
            PreCheckoutAnswer::Deny { reason } => json!({
                "pre_checkout_query_id": query_id,
                "ok": false,
                "error_message": reason,
            }),
        };
        self.call("answerPreCheckoutQuery", &body).await.map(|_| ())
    }

    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> Result<(), ChannelError> {
        let body = json!({
            "chat_id": chat_id,
            "title": invoice.title,
            "description": invoice.description,
            "payload": invoice.payload,
            "provider_token": self.provider_token.expose_secret(),
            "currency": invoice.currency,
            "prices": [{ "label": invoice.price_label, "amount": invoice.amount }],
        });
        self.call("sendInvoice", &body).await.map(|_| ())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    async fn start(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for updates...");

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "callback_query", "pre_checkout_query"],
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    tracing::warn!(response = %data, "Telegram getUpdates returned no result");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = parse_update(update) else {
                        tracing::debug!("Telegram: skipping unsupported update");
                        continue;
                    };

                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a `Sender` from a Bot API `from` object and chat id.
fn sender_from(from: &Value, chat_id: Option<i64>) -> Option<Sender> {
    let user_id = from.get("id").and_then(Value::as_i64)?;
    let chat_id = chat_id.unwrap_or(user_id);

    let first = from.get("first_name").and_then(Value::as_str);
    let last = from.get("last_name").and_then(Value::as_str);
    let name = match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (Some(f), None) => Some(f.to_string()),
        _ => from
            .get("username")
            .and_then(Value::as_str)
            .map(String::from),
    };

    let sender = Sender::new(user_id, chat_id);
    Some(match name {
        Some(n) => sender.with_display_name(n),
        None => sender,
    })
}

/// Convert one Bot API update into an event. Returns `None` for update
/// kinds the bot does not handle (stickers, photos, edits, ...).
pub fn parse_update(update: &Value) -> Option<InboundEvent> {
    if let Some(query) = update.get("pre_checkout_query") {
        let from = sender_from(query.get("from")?, None)?;
        return Some(InboundEvent::PreCheckout {
            from,
            query_id: query.get("id")?.as_str()?.to_string(),
            payload: query
                .get("invoice_payload")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            total_amount: query.get("total_amount")?.as_i64()?,
            currency: query.get("currency")?.as_str()?.to_string(),
        });
    }

    if let Some(callback) = update.get("callback_query") {
        let message = callback.get("message");
        let chat_id = message
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64);
        let from = sender_from(callback.get("from")?, chat_id)?;
        return Some(InboundEvent::Button {
            from,
            callback_id: callback.get("id")?.as_str()?.to_string(),
            message_id: message
                .and_then(|m| m.get("message_id"))
                .and_then(Value::as_i64),
            data: callback
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let message = update.get("message")?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64);
    let from = sender_from(message.get("from")?, chat_id)?;

    if let Some(payment) = message.get("successful_payment") {
        return Some(InboundEvent::PaymentSucceeded {
            from,
            payload: payment
                .get("invoice_payload")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            total_amount: payment.get("total_amount")?.as_i64()?,
            currency: payment.get("currency")?.as_str()?.to_string(),
            provider_charge_id: payment
                .get("telegram_payment_charge_id")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }

    let text = message.get("text").and_then(Value::as_str)?;
    Some(InboundEvent::Text {
        from,
        text: text.to_string(),
    })
}

/// Split a message into chunks of at most `max_chars` characters.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > max_chars {
        // Byte offset of the first char past the limit.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    if !remaining.is_empty() || chunks.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
