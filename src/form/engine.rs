//! Form engine: drives one user at a time through the intake questions.
//!
//! Every read-modify-write of a session happens under that user's session
//! lock. The lock is released while a correction hint is being generated;
//! the session epoch decides whether the hint is still wanted afterwards.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::field::FormField;
use super::session::{FormSession, SessionStore};
use super::validator::validate;
use crate::advisor::CorrectionAdvisor;
use crate::channels::{Button, ChatId, Keyboard, OutgoingMessage, Sender, UserId, escape_html};
use crate::notify::Notifier;
use crate::payments::{Currency, PaymentEngine};
use crate::store::{Database, IntakeRecord, NewIntakeRecord};

/// Delay unit between record write attempts; attempt `n` waits `n` units.
const DEFAULT_PERSIST_BACKOFF: Duration = Duration::from_millis(500);

pub const CANCELLED: &str = "❌ Процесс отменён.";
pub const RELAY_PROMPT: &str = "📨 Напишите ваше сообщение для админа:";
pub const RELAY_DELIVERED: &str = "✅ Ваше сообщение отправлено администратору.";
pub const RELAY_FAILED: &str =
    "⚠️ Не удалось отправить сообщение администратору. Попробуйте ещё раз позже.";
pub const SAVE_FAILED: &str = "⚠️ Не удалось сохранить заявку. Отправьте номер телефона ещё раз, \
чтобы повторить попытку, или обратитесь к администратору.";
pub const PAYMENT_PROMPT: &str = "💰 Оплатите услугу для завершения:";

/// Callback data of the payment option buttons.
pub const PAY_FIAT: &str = "pay:fiat";
pub const PAY_POINTS: &str = "pay:points";

/// What happened to a text message sent while a form might be open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// No open form for this user; the text is not an answer.
    NotAForm,
    /// Answer accepted; `next` is now current.
    Advanced { next: FormField },
    /// Answer rejected; `hint_delivered` is false if the session changed
    /// while the hint was being generated.
    Rejected { field: FormField, hint_delivered: bool },
    /// Form complete, record stored and first invoice issued.
    Submitted {
        record_id: i64,
        payment_token: Option<String>,
    },
    /// Every write attempt failed; the session waits at the last field.
    SaveFailed,
    /// Text forwarded to operations.
    Relayed,
    /// Answered as a free-form question.
    FreeText,
}

pub struct FormEngine {
    sessions: Arc<SessionStore>,
    advisor: Arc<CorrectionAdvisor>,
    db: Arc<dyn Database>,
    payments: Arc<PaymentEngine>,
    notifier: Arc<Notifier>,
    persist_attempts: u32,
    persist_backoff: Duration,
}

impl FormEngine {
    pub fn new(
        sessions: Arc<SessionStore>,
        advisor: Arc<CorrectionAdvisor>,
        db: Arc<dyn Database>,
        payments: Arc<PaymentEngine>,
        notifier: Arc<Notifier>,
        persist_attempts: u32,
    ) -> Self {
        Self {
            sessions,
            advisor,
            db,
            payments,
            notifier,
            persist_attempts: persist_attempts.max(1),
            persist_backoff: DEFAULT_PERSIST_BACKOFF,
        }
    }

    /// Override the delay between record write attempts.
    pub fn with_persist_backoff(mut self, backoff: Duration) -> Self {
        self.persist_backoff = backoff;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Show `text` to the user, replacing the menu message when there is one.
    async fn reply(&self, chat_id: ChatId, replace: Option<i64>, text: &str) {
        if let Some(message_id) = replace {
            match self
                .notifier
                .transport()
                .edit(chat_id, message_id, OutgoingMessage::text(text))
                .await
            {
                Ok(()) => return,
                Err(e) => debug!(chat_id, error = %e, "Edit failed; sending instead"),
            }
        }
        self.notifier.to_user(chat_id, text).await;
    }

    // ── Entry points ────────────────────────────────────────────────

    /// Start (or restart) the form at the first field.
    pub async fn begin(&self, from: &Sender, replace: Option<i64>) {
        let _guard = self.sessions.lock(from.user_id).await;
        let epoch = self.sessions.next_epoch();
        let session = FormSession::begin(from.user_id, from.chat_id, epoch);
        info!(user_id = from.user_id, epoch = session.epoch, "Form started");
        self.sessions.put(session).await;
        self.reply(from.chat_id, replace, FormField::Fio.prompt()).await;
    }

    /// Drop the user's session, if any. Always acknowledges.
    pub async fn cancel(&self, user_id: UserId, chat_id: ChatId) -> bool {
        let existed = {
            let _guard = self.sessions.lock(user_id).await;
            self.sessions.delete(user_id).await.is_some()
        };
        self.sessions.prune_locks();
        info!(user_id, existed, "Form cancelled");
        self.notifier.to_user(chat_id, CANCELLED).await;
        existed
    }

    /// Make the user's next text go to operations.
    pub async fn open_relay(&self, from: &Sender, replace: Option<i64>) {
        {
            let _guard = self.sessions.lock(from.user_id).await;
            let session = match self.sessions.get(from.user_id).await {
                Some(mut existing) => {
                    existing.admin_relay_mode = true;
                    existing
                }
                None => FormSession::relay_only(
                    from.user_id,
                    from.chat_id,
                    self.sessions.next_epoch(),
                ),
            };
            self.sessions.put(session).await;
        }
        debug!(user_id = from.user_id, "Relay mode opened");
        self.reply(from.chat_id, replace, RELAY_PROMPT).await;
    }

    /// Route a text message: relay, form answer, or free-form question.
    pub async fn handle_text(&self, from: &Sender, text: &str) -> AnswerOutcome {
        if self.relay(from, text).await {
            return AnswerOutcome::Relayed;
        }
        match self.submit_answer(from, text).await {
            AnswerOutcome::NotAForm => {
                let answer = self.advisor.answer_question(text).await;
                self.notifier
                    .to_user(from.chat_id, escape_html(&answer))
                    .await;
                AnswerOutcome::FreeText
            }
            other => other,
        }
    }

    // ── Relay ───────────────────────────────────────────────────────

    /// Forward `text` to operations if the user is in relay mode.
    async fn relay(&self, from: &Sender, text: &str) -> bool {
        let _guard = self.sessions.lock(from.user_id).await;
        let Some(mut session) = self.sessions.get(from.user_id).await else {
            return false;
        };
        if !session.admin_relay_mode {
            return false;
        }

        let delivered = self
            .notifier
            .to_ops(format!(
                "✉️ Сообщение от пользователя {}:\n{}",
                escape_html(&from.label()),
                escape_html(text)
            ))
            .await;
        if !delivered {
            self.notifier.to_user(from.chat_id, RELAY_FAILED).await;
            return true;
        }

        if let Err(e) = self.db.insert_relay_message(from.user_id, text).await {
            error!(user_id = from.user_id, error = %e, "Failed to store relayed message");
        }

        if session.form_open {
            session.admin_relay_mode = false;
            self.sessions.put(session).await;
        } else {
            self.sessions.delete(from.user_id).await;
        }
        info!(user_id = from.user_id, "Message relayed to operations");
        self.notifier.to_user(from.chat_id, RELAY_DELIVERED).await;
        true
    }

    // ── Answers ─────────────────────────────────────────────────────

    /// Apply `raw` as the answer to the user's current field.
    pub async fn submit_answer(&self, from: &Sender, raw: &str) -> AnswerOutcome {
        let guard = self.sessions.lock(from.user_id).await;
        let Some(mut session) = self.sessions.get(from.user_id).await else {
            return AnswerOutcome::NotAForm;
        };
        if !session.accepts_answers() {
            return AnswerOutcome::NotAForm;
        }

        let field = session.current_field;
        let rejection = match validate(field, raw) {
            Ok(answer) => {
                let next = match session.accept(answer) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(user_id = from.user_id, error = %e, "Session could not advance");
                        return AnswerOutcome::NotAForm;
                    }
                };
                debug!(user_id = from.user_id, field = %field, next = %next, "Answer accepted");
                if next.is_terminal() {
                    return self.complete(from, session).await;
                }
                self.sessions.put(session).await;
                self.notifier.to_user(from.chat_id, next.prompt()).await;
                return AnswerOutcome::Advanced { next };
            }
            Err(rejection) => rejection,
        };

        debug!(user_id = from.user_id, reason = %rejection, "Answer rejected");
        session.awaiting_correction_retry = true;
        let epoch = session.epoch;
        self.sessions.put(session).await;
        drop(guard);

        let hint = self
            .advisor
            .correct(field.constraint(), raw.trim(), field.fallback_hint())
            .await;

        let _guard = self.sessions.lock(from.user_id).await;
        let still_current = match self.sessions.get(from.user_id).await {
            Some(mut session) if session.epoch == epoch && session.current_field == field => {
                session.awaiting_correction_retry = false;
                self.sessions.put(session).await;
                true
            }
            _ => false,
        };

        if still_current {
            self.notifier
                .to_user(from.chat_id, escape_html(&hint))
                .await;
        } else {
            debug!(user_id = from.user_id, epoch, "Session changed; discarding hint");
        }
        AnswerOutcome::Rejected {
            field,
            hint_delivered: still_current,
        }
    }

    // ── Completion ──────────────────────────────────────────────────

    /// Persist the finished form, alert operations and start payment.
    /// Called with the user's session lock held.
    async fn complete(&self, from: &Sender, mut session: FormSession) -> AnswerOutcome {
        let Some(new_record) = new_record(&session) else {
            error!(user_id = from.user_id, "Completed session is missing answers");
            self.sessions.delete(from.user_id).await;
            self.notifier.to_user(from.chat_id, SAVE_FAILED).await;
            return AnswerOutcome::SaveFailed;
        };

        let record = match self.persist(&new_record).await {
            Some(record) => record,
            None => {
                self.notifier
                    .to_ops(format!(
                        "❗ Не удалось сохранить заявку от {}:\n{}",
                        escape_html(&from.label()),
                        summary_lines(&new_record)
                    ))
                    .await;
                session.reopen(FormField::Phone);
                self.sessions.put(session).await;
                self.notifier.to_user(from.chat_id, SAVE_FAILED).await;
                return AnswerOutcome::SaveFailed;
            }
        };

        self.sessions.delete(from.user_id).await;
        info!(user_id = from.user_id, record_id = record.id, "Intake record stored");

        self.notifier.to_ops(ops_summary(&record, from)).await;

        let fee = self.payments.fee(Currency::Fiat);
        let payment_token = match self
            .payments
            .issue_invoice(
                from.user_id,
                from.chat_id,
                Some(record.id),
                fee,
                Currency::Fiat,
            )
            .await
        {
            Ok(token) => Some(token),
            Err(e) => {
                error!(user_id = from.user_id, error = %e, "Failed to issue invoice");
                None
            }
        };

        self.notifier
            .to_user(
                from.chat_id,
                OutgoingMessage::text(PAYMENT_PROMPT).with_keyboard(self.payment_keyboard()),
            )
            .await;

        AnswerOutcome::Submitted {
            record_id: record.id,
            payment_token,
        }
    }

    /// Write the record, retrying with linear backoff.
    async fn persist(&self, record: &NewIntakeRecord) -> Option<IntakeRecord> {
        for attempt in 1..=self.persist_attempts {
            match self.db.create_record(record).await {
                Ok(stored) => return Some(stored),
                Err(e) => {
                    warn!(
                        user_id = record.user_id,
                        attempt,
                        max_attempts = self.persist_attempts,
                        error = %e,
                        "Record write failed"
                    );
                    if attempt < self.persist_attempts {
                        tokio::time::sleep(self.persist_backoff * attempt).await;
                    }
                }
            }
        }
        error!(user_id = record.user_id, "Giving up on record write");
        None
    }

    /// Buttons offering both payment options.
    pub fn payment_keyboard(&self) -> Keyboard {
        let pricing = self.payments.pricing();
        Keyboard::column([
            Button::new(format!("💳 Оплатить {}₽", pricing.fiat_price), PAY_FIAT),
            Button::new(format!("⭐ Оплатить {}⭐", pricing.points_price), PAY_POINTS),
        ])
    }
}

fn new_record(session: &FormSession) -> Option<NewIntakeRecord> {
    let get = |field| session.answer(field).map(str::to_string);
    Some(NewIntakeRecord {
        user_id: session.user_id,
        fio: get(FormField::Fio)?,
        source: get(FormField::Source)?,
        bank: get(FormField::Bank)?,
        card: get(FormField::Card)?,
        email: get(FormField::Email)?,
        phone: get(FormField::Phone)?,
    })
}

fn summary_lines(record: &NewIntakeRecord) -> String {
    let values = [
        &record.fio,
        &record.source,
        &record.bank,
        &record.card,
        &record.email,
        &record.phone,
    ];
    FormField::ANSWERS
        .iter()
        .zip(values)
        .map(|(field, value)| format!("{}: {}", field.summary_label(), escape_html(value)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Operations message announcing a new submission.
pub fn ops_summary(record: &IntakeRecord, from: &Sender) -> String {
    let lines = summary_lines(&NewIntakeRecord {
        user_id: record.user_id,
        fio: record.fio.clone(),
        source: record.source.clone(),
        bank: record.bank.clone(),
        card: record.card.clone(),
        email: record.email.clone(),
        phone: record.phone.clone(),
    });
    format!(
        "<b>Новая заявка на отписку #{}</b>\nОт: {}\n{lines}",
        record.id,
        escape_html(&from.label())
    )
}
