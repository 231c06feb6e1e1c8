#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use intake_bot::advisor::CorrectionAdvisor;
use intake_bot::bot::Dispatcher;
use intake_bot::channels::{InboundEvent, MemoryTransport, Sender};
use intake_bot::config::{AdvisorConfig, PricingConfig};
use intake_bot::error::LlmError;
use intake_bot::form::{FormEngine, SessionStore};
use intake_bot::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use intake_bot::notify::Notifier;
use intake_bot::payments::{AllowAll, PaymentEngine};
use intake_bot::store::{Database, LibSqlBackend};

pub const OPS: i64 = -1001;

pub const VALID_ANSWERS: [&str; 6] = [
    "Иванов Петр Сергеевич",
    "Netflix subscription",
    "Сбербанк",
    "123456*7890",
    "ivan@example.com",
    "+79991234567",
];

/// Provider that always replies with a fixed text, or always fails.
pub struct ScriptedLlm {
    pub reply: Option<String>,
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match &self.reply {
            Some(text) => Ok(CompletionResponse {
                content: text.clone(),
                input_tokens: 10,
                output_tokens: 5,
                finish_reason: FinishReason::Stop,
            }),
            None => Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "offline".into(),
            }),
        }
    }
}

pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub db: Arc<dyn Database>,
    pub sessions: Arc<SessionStore>,
    pub forms: Arc<FormEngine>,
    pub payments: Arc<PaymentEngine>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(None, Duration::from_secs(1800)).await
    }

    /// Harness whose advisor always answers `reply`.
    pub async fn with_advisor_reply(reply: &str) -> Self {
        let llm: Arc<dyn LlmProvider> = Arc::new(ScriptedLlm {
            reply: Some(reply.to_string()),
        });
        Self::build(Some(llm), Duration::from_secs(1800)).await
    }

    pub async fn with_authorization_ttl(ttl: Duration) -> Self {
        Self::build(None, ttl).await
    }

    async fn build(llm: Option<Arc<dyn LlmProvider>>, ttl: Duration) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::with_db(db, llm, ttl)
    }

    pub fn with_db(db: Arc<dyn Database>, llm: Option<Arc<dyn LlmProvider>>, ttl: Duration) -> Self {
        let transport = MemoryTransport::new();
        let notifier = Notifier::new(transport.clone(), OPS);
        let payments = PaymentEngine::new(
            db.clone(),
            notifier.clone(),
            Arc::new(AllowAll),
            PricingConfig::default(),
            ttl,
        );
        let sessions = SessionStore::new();
        let advisor = CorrectionAdvisor::new(llm, &AdvisorConfig::default());
        let forms = Arc::new(
            FormEngine::new(
                sessions.clone(),
                Arc::new(advisor),
                db.clone(),
                payments.clone(),
                notifier.clone(),
                3,
            )
            .with_persist_backoff(Duration::ZERO),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            forms.clone(),
            payments.clone(),
            db.clone(),
            notifier,
        ));
        Self {
            transport,
            db,
            sessions,
            forms,
            payments,
            dispatcher,
        }
    }

    /// Begin the form and send all six valid answers. Returns the token of
    /// the invoice issued at submission.
    pub async fn submit_valid_form(&self, user: i64) -> String {
        self.forms.begin(&sender(user), None).await;
        for answer in VALID_ANSWERS {
            self.forms.handle_text(&sender(user), answer).await;
        }
        self.transport
            .invoices_to(user)
            .last()
            .map(|invoice| invoice.payload.clone())
            .unwrap()
    }

    pub async fn pre_checkout(&self, user: i64, query: &str, token: &str, amount: i64, currency: &str) {
        self.dispatcher
            .handle(InboundEvent::PreCheckout {
                from: sender(user),
                query_id: query.into(),
                payload: token.into(),
                total_amount: amount,
                currency: currency.into(),
            })
            .await;
    }

    pub async fn payment_succeeded(&self, user: i64, token: &str, amount: i64, currency: &str) {
        self.dispatcher
            .handle(InboundEvent::PaymentSucceeded {
                from: sender(user),
                payload: token.into(),
                total_amount: amount,
                currency: currency.into(),
                provider_charge_id: Some(format!("charge-{token}")),
            })
            .await;
    }
}

pub fn sender(user: i64) -> Sender {
    Sender::new(user, user).with_display_name(format!("User{user}"))
}
