//! Dispatcher: routes inbound transport events to the form and payment
//! engines.
//!
//! Events from one user are applied in arrival order by a per-user lane: a
//! worker task fed by an unbounded channel that exits after sitting idle.
//! `/cancel` and payment callbacks bypass the lanes. A `/cancel` also bumps
//! the lane generation, so events queued before it are dropped unhandled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channels::{
    Button, EventStream, InboundEvent, Keyboard, OutgoingMessage, Sender, UserId,
};
use crate::form::engine::{PAYMENT_PROMPT, PAY_FIAT, PAY_POINTS};
use crate::form::FormEngine;
use crate::notify::Notifier;
use crate::payments::{Currency, PaymentEngine};
use crate::store::{Database, PaymentStatus};

pub const WELCOME: &str = "👋 <b>Здравствуйте!</b>\n\
Вы обратились в <i>Отписка Бот</i> для отмены нежелательных списаний.";
pub const NO_RECORD: &str = "Заявка не найдена. Заполните анкету заново: /start";
pub const ALREADY_PAID: &str = "✅ Эта заявка уже оплачена.";
pub const INVOICE_FAILED: &str =
    "⚠️ Не удалось выставить счёт. Попробуйте ещё раз или обратитесь к администратору.";

/// Callback data of the welcome menu buttons.
pub const BEGIN_FORM: &str = "begin_form";
pub const CONTACT_ADMIN: &str = "contact_admin";

const DEFAULT_LANE_IDLE: Duration = Duration::from_secs(60);

/// Welcome menu shown on `/start`.
pub fn welcome_message() -> OutgoingMessage {
    OutgoingMessage::text(WELCOME).with_keyboard(Keyboard::column([
        Button::new("✅ Продолжить", BEGIN_FORM),
        Button::new("📨 Связаться с админом", CONTACT_ADMIN),
    ]))
}

/// Events queued for one user, tagged with the generation they were sent in.
struct Lane {
    tx: mpsc::UnboundedSender<(u64, InboundEvent)>,
    generation: Arc<AtomicU64>,
}

pub struct Dispatcher {
    forms: Arc<FormEngine>,
    payments: Arc<PaymentEngine>,
    db: Arc<dyn Database>,
    notifier: Arc<Notifier>,
    lanes: Mutex<HashMap<UserId, Lane>>,
    lane_idle: Duration,
}

impl Dispatcher {
    pub fn new(
        forms: Arc<FormEngine>,
        payments: Arc<PaymentEngine>,
        db: Arc<dyn Database>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            forms,
            payments,
            db,
            notifier,
            lanes: Mutex::new(HashMap::new()),
            lane_idle: DEFAULT_LANE_IDLE,
        }
    }

    /// How long a lane worker waits for its next event before exiting.
    pub fn with_lane_idle(mut self, idle: Duration) -> Self {
        self.lane_idle = idle;
        self
    }

    /// Number of live per-user lanes.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Consume the transport's event stream until it ends.
    pub async fn run(self: Arc<Self>, mut events: EventStream) {
        info!("Dispatcher started");
        while let Some(event) = events.next().await {
            self.dispatch(event);
        }
        info!("Event stream ended; dispatcher stopping");
    }

    /// Route one event without waiting for it to be handled.
    pub fn dispatch(self: &Arc<Self>, event: InboundEvent) {
        let cancel = matches!(
            &event,
            InboundEvent::Text { text, .. } if command(text) == Some("/cancel")
        );
        let bypass = cancel
            || matches!(
                event,
                InboundEvent::PreCheckout { .. } | InboundEvent::PaymentSucceeded { .. }
            );
        if bypass {
            if cancel {
                self.invalidate_queued(event.sender().user_id);
            }
            let this = Arc::clone(self);
            tokio::spawn(async move { this.handle(event).await });
            return;
        }

        let user_id = event.sender().user_id;
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let event = match lanes.get(&user_id) {
            Some(lane) => {
                let generation = lane.generation.load(Ordering::SeqCst);
                match lane.tx.send((generation, event)) {
                    Ok(()) => return,
                    // Worker already gone; start a fresh lane below.
                    Err(mpsc::error::SendError((_, event))) => event,
                }
            }
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send((0, event)).is_err() {
            return;
        }
        let generation = Arc::new(AtomicU64::new(0));
        lanes.insert(
            user_id,
            Lane {
                tx,
                generation: Arc::clone(&generation),
            },
        );
        debug!(user_id, "Lane opened");
        tokio::spawn(Arc::clone(self).lane_worker(user_id, rx, generation));
    }

    /// Mark everything already queued for `user_id` as stale.
    fn invalidate_queued(&self, user_id: UserId) {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lane) = lanes.get(&user_id) {
            lane.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn lane_worker(
        self: Arc<Self>,
        user_id: UserId,
        mut rx: mpsc::UnboundedReceiver<(u64, InboundEvent)>,
        generation: Arc<AtomicU64>,
    ) {
        loop {
            match tokio::time::timeout(self.lane_idle, rx.recv()).await {
                Ok(Some((queued_in, event))) => {
                    if queued_in < generation.load(Ordering::SeqCst) {
                        debug!(user_id, "Dropping event queued before /cancel");
                        continue;
                    }
                    self.handle(event).await;
                }
                Ok(None) => break,
                Err(_) => {
                    // Senders push under the lanes lock, so an empty queue
                    // checked under that lock stays empty.
                    let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
                    if rx.is_empty() {
                        lanes.remove(&user_id);
                        break;
                    }
                }
            }
        }
        self.forms.sessions().prune_locks();
        debug!(user_id, "Lane closed");
    }

    /// Handle one event to completion.
    pub async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Text { from, text } => self.on_text(&from, &text).await,
            InboundEvent::Button {
                from,
                callback_id,
                message_id,
                data,
            } => {
                if let Err(e) = self
                    .notifier
                    .transport()
                    .answer_button(&callback_id)
                    .await
                {
                    debug!(user_id = from.user_id, error = %e, "Failed to acknowledge button");
                }
                self.on_button(&from, message_id, &data).await;
            }
            InboundEvent::PreCheckout {
                from,
                query_id,
                payload,
                total_amount,
                currency,
            } => {
                self.payments
                    .handle_pre_authorization(&query_id, &from, &payload, total_amount, &currency)
                    .await;
            }
            InboundEvent::PaymentSucceeded {
                from,
                payload,
                total_amount,
                currency,
                provider_charge_id,
            } => {
                self.payments
                    .handle_completion(
                        &from,
                        &payload,
                        total_amount,
                        &currency,
                        provider_charge_id.as_deref(),
                    )
                    .await;
            }
        }
    }

    async fn on_text(&self, from: &Sender, text: &str) {
        match command(text) {
            Some("/start") => {
                self.notifier.to_user(from.chat_id, welcome_message()).await;
            }
            Some("/cancel") => {
                self.forms.cancel(from.user_id, from.chat_id).await;
            }
            _ => {
                let outcome = self.forms.handle_text(from, text).await;
                debug!(user_id = from.user_id, outcome = ?outcome, "Text handled");
            }
        }
    }

    async fn on_button(&self, from: &Sender, message_id: Option<i64>, data: &str) {
        match data {
            BEGIN_FORM => self.forms.begin(from, message_id).await,
            CONTACT_ADMIN => self.forms.open_relay(from, message_id).await,
            PAY_FIAT => self.pay(from, message_id, Currency::Fiat).await,
            PAY_POINTS => self.pay(from, message_id, Currency::Points).await,
            other => warn!(user_id = from.user_id, data = other, "Unknown button"),
        }
    }

    /// Issue a new invoice for the user's latest record in `currency`.
    async fn pay(&self, from: &Sender, message_id: Option<i64>, currency: Currency) {
        if let Some(message_id) = message_id {
            if let Err(e) = self
                .notifier
                .transport()
                .edit(from.chat_id, message_id, OutgoingMessage::text(PAYMENT_PROMPT))
                .await
            {
                debug!(user_id = from.user_id, error = %e, "Failed to remove payment buttons");
            }
        }

        let record = match self.db.latest_record_for_user(from.user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.notifier.to_user(from.chat_id, NO_RECORD).await;
                return;
            }
            Err(e) => {
                error!(user_id = from.user_id, error = %e, "Failed to load record for payment");
                self.notifier.to_user(from.chat_id, INVOICE_FAILED).await;
                return;
            }
        };
        if record.payment_status == PaymentStatus::Completed {
            self.notifier.to_user(from.chat_id, ALREADY_PAID).await;
            return;
        }

        let amount = self.payments.fee(currency);
        match self
            .payments
            .issue_invoice(from.user_id, from.chat_id, Some(record.id), amount, currency)
            .await
        {
            Ok(token) => {
                info!(user_id = from.user_id, token = %token, currency = %currency, "Invoice requested")
            }
            Err(e) => {
                error!(user_id = from.user_id, error = %e, "Failed to issue invoice");
                self.notifier.to_user(from.chat_id, INVOICE_FAILED).await;
            }
        }
    }
}

/// The command word of a text (`/start@BotName arg` → `/start`).
fn command(text: &str) -> Option<&str> {
    let word = text.split_whitespace().next()?;
    if !word.starts_with('/') {
        return None;
    }
    Some(word.split('@').next().unwrap_or(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::advisor::CorrectionAdvisor;
    use crate::channels::{MemoryTransport, PreCheckoutAnswer, SentItem};
    use crate::config::{AdvisorConfig, PricingConfig};
    use crate::form::{FormField, SessionStore};
    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::payments::AllowAll;
    use crate::store::LibSqlBackend;

    const OPS: i64 = -100;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        transport: Arc<MemoryTransport>,
        db: Arc<dyn Database>,
        sessions: Arc<SessionStore>,
    }

    /// Holds every completion until released.
    struct GatedLlm {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LlmProvider for GatedLlm {
        fn model_name(&self) -> &str {
            "gated"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(CompletionResponse {
                content: "late hint".into(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    async fn harness() -> Harness {
        harness_with(CorrectionAdvisor::disabled()).await
    }

    async fn harness_with(advisor: CorrectionAdvisor) -> Harness {
        let transport = MemoryTransport::new();
        let notifier = Notifier::new(transport.clone(), OPS);
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let payments = PaymentEngine::new(
            db.clone(),
            notifier.clone(),
            Arc::new(AllowAll),
            PricingConfig::default(),
            Duration::from_secs(1800),
        );
        let sessions = SessionStore::new();
        let forms = Arc::new(FormEngine::new(
            sessions.clone(),
            Arc::new(advisor),
            db.clone(),
            payments.clone(),
            notifier.clone(),
            1,
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(forms, payments, db.clone(), notifier)
                .with_lane_idle(Duration::from_millis(50)),
        );
        Harness {
            dispatcher,
            transport,
            db,
            sessions,
        }
    }

    fn text(user: i64, text: &str) -> InboundEvent {
        InboundEvent::Text {
            from: Sender::new(user, user),
            text: text.into(),
        }
    }

    fn button(user: i64, data: &str, message_id: Option<i64>) -> InboundEvent {
        InboundEvent::Button {
            from: Sender::new(user, user),
            callback_id: format!("cb-{data}"),
            message_id,
            data: data.into(),
        }
    }

    const ANSWERS: [&str; 6] = [
        "Иванов Петр Сергеевич",
        "Netflix subscription",
        "Сбербанк",
        "123456*7890",
        "ivan@example.com",
        "+79991234567",
    ];

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn command_parsing() {
        assert_eq!(command("/start"), Some("/start"));
        assert_eq!(command("  /cancel  "), Some("/cancel"));
        assert_eq!(command("/start@OtpiskaBot ref"), Some("/start"));
        assert_eq!(command("Иванов"), None);
        assert_eq!(command(""), None);
    }

    #[tokio::test]
    async fn start_sends_welcome_menu() {
        let h = harness().await;
        h.dispatcher.handle(text(1, "/start")).await;
        let messages = h.transport.messages_to(1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, WELCOME);
        let keyboard = messages[0].keyboard.as_ref().unwrap();
        assert_eq!(keyboard.rows[0][0].callback_data, BEGIN_FORM);
        assert_eq!(keyboard.rows[1][0].callback_data, CONTACT_ADMIN);
    }

    #[tokio::test]
    async fn begin_button_is_acknowledged_and_edits_menu() {
        let h = harness().await;
        h.dispatcher.handle(button(1, BEGIN_FORM, Some(9))).await;
        let sent = h.transport.sent();
        assert!(matches!(&sent[0], SentItem::ButtonAnswer { callback_id } if callback_id == "cb-begin_form"));
        assert!(matches!(&sent[1], SentItem::Edit { message_id: 9, message, .. } if message.text == FormField::Fio.prompt()));
        assert_eq!(
            h.sessions.get(1).await.unwrap().current_field,
            FormField::Fio
        );
    }

    #[tokio::test]
    async fn points_button_issues_points_invoice() {
        let h = harness().await;
        h.dispatcher.handle(button(1, BEGIN_FORM, None)).await;
        for answer in ANSWERS {
            h.dispatcher.handle(text(1, answer)).await;
        }
        assert_eq!(h.transport.invoices_to(1).len(), 1);

        h.dispatcher.handle(button(1, PAY_POINTS, Some(20))).await;
        let invoices = h.transport.invoices_to(1);
        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[1].currency, "XTR");
        assert_eq!(invoices[1].amount, 200);
        assert!(h.transport.sent().iter().any(|item| matches!(
            item,
            SentItem::Edit { message_id: 20, message, .. } if message.keyboard.is_none()
        )));
    }

    #[tokio::test]
    async fn pay_button_without_record_explains() {
        let h = harness().await;
        h.dispatcher.handle(button(1, PAY_FIAT, None)).await;
        assert_eq!(h.transport.texts_to(1), vec![NO_RECORD.to_string()]);
        assert!(h.transport.invoices_to(1).is_empty());
    }

    #[tokio::test]
    async fn full_payment_through_events() {
        let h = harness().await;
        h.dispatcher.handle(button(1, BEGIN_FORM, None)).await;
        for answer in ANSWERS {
            h.dispatcher.handle(text(1, answer)).await;
        }
        let token = h.transport.invoices_to(1)[0].payload.clone();

        h.dispatcher
            .handle(InboundEvent::PreCheckout {
                from: Sender::new(1, 1),
                query_id: "q1".into(),
                payload: token.clone(),
                total_amount: 39900,
                currency: "RUB".into(),
            })
            .await;
        assert_eq!(
            h.transport.pre_checkout_answers(),
            vec![("q1".to_string(), PreCheckoutAnswer::Approve)]
        );

        h.dispatcher
            .handle(InboundEvent::PaymentSucceeded {
                from: Sender::new(1, 1),
                payload: token,
                total_amount: 39900,
                currency: "RUB".into(),
                provider_charge_id: Some("ch_1".into()),
            })
            .await;
        let record = h.db.latest_record_for_user(1).await.unwrap().unwrap();
        assert_eq!(record.payment_status, PaymentStatus::Completed);

        h.dispatcher.handle(button(1, PAY_FIAT, None)).await;
        assert_eq!(h.transport.texts_to(1).last().unwrap(), ALREADY_PAID);
    }

    #[tokio::test]
    async fn lane_preserves_order_and_closes_when_idle() {
        let h = harness().await;
        h.dispatcher.dispatch(button(1, BEGIN_FORM, None));
        for answer in &ANSWERS[..3] {
            h.dispatcher.dispatch(text(1, answer));
        }
        assert_eq!(h.dispatcher.active_lanes(), 1);

        let sessions = h.sessions.clone();
        eventually(|| {
            let sessions = sessions.clone();
            async move {
                sessions
                    .get(1)
                    .await
                    .is_some_and(|s| s.current_field == FormField::Card)
            }
        })
        .await;

        let dispatcher = h.dispatcher.clone();
        eventually(|| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.active_lanes() == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_bypasses_lane() {
        let h = harness().await;
        h.dispatcher.handle(button(1, BEGIN_FORM, None)).await;
        h.dispatcher.dispatch(text(1, "/cancel"));
        assert_eq!(h.dispatcher.active_lanes(), 0);

        let sessions = h.sessions.clone();
        eventually(|| {
            let sessions = sessions.clone();
            async move { sessions.get(1).await.is_none() }
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_drops_events_queued_behind_advisor_call() {
        let llm = Arc::new(GatedLlm {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let advisor = CorrectionAdvisor::new(
            Some(llm.clone() as Arc<dyn LlmProvider>),
            &AdvisorConfig::default(),
        );
        let h = harness_with(advisor).await;
        h.dispatcher.handle(button(1, BEGIN_FORM, None)).await;

        // The rejected answer holds the lane inside the advisor call.
        h.dispatcher.dispatch(text(1, "bad"));
        llm.entered.notified().await;
        h.dispatcher.dispatch(button(1, BEGIN_FORM, None));
        h.dispatcher.dispatch(text(1, "/cancel"));

        let sessions = h.sessions.clone();
        eventually(|| {
            let sessions = sessions.clone();
            async move { sessions.get(1).await.is_none() }
        })
        .await;
        llm.release.notify_one();

        let dispatcher = h.dispatcher.clone();
        eventually(|| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.active_lanes() == 0 }
        })
        .await;
        assert!(h.sessions.get(1).await.is_none());

        // Events sent after the cancel are handled normally.
        h.dispatcher.dispatch(button(1, BEGIN_FORM, None));
        let sessions = h.sessions.clone();
        eventually(|| {
            let sessions = sessions.clone();
            async move { sessions.get(1).await.is_some() }
        })
        .await;
    }
}
