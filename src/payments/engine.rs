//! Payment engine: issues invoices and reconciles processor callbacks.
//!
//! Each `PaymentRequest` lives behind its own async mutex, so callbacks for
//! one correlation token are applied one at a time while different tokens
//! proceed in parallel. The token map lock is never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::fraud::{FraudCheck, FraudVerdict};
use super::model::{Currency, PaymentRequest, PaymentState};
use crate::channels::{ChatId, Invoice, PreCheckoutAnswer, Sender, UserId};
use crate::config::PricingConfig;
use crate::error::PaymentError;
use crate::notify::Notifier;
use crate::store::{Database, PaymentStatus};

/// How long terminal requests are kept for lookups before being dropped.
const TERMINAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const INVOICE_DESCRIPTION: &str = "Услуга отмены нежелательных подписок и списаний";
const INVOICE_PRICE_LABEL: &str = "Услуга отписки";

pub const PAYMENT_CONFIRMED: &str = "✅ Ваш платёж подтверждён! Мы уже начали работу над вашей отпиской.\n\
Обычно это занимает 1-3 рабочих дня. Вы получите уведомление о результате.";
pub const PAYMENT_EXPIRED: &str =
    "❌ Платёж не был завершён. Если деньги списались, напишите администратору через /start.";

const DENY_UNKNOWN: &str = "Счёт не найден. Запросите новый счёт.";
const DENY_STALE: &str = "Счёт уже недействителен. Запросите новый счёт.";
const DENY_FOREIGN: &str = "Счёт выставлен другому пользователю.";
const DENY_AMOUNT: &str = "Сумма платежа не совпадает со счётом.";
const DENY_CURRENCY: &str = "Валюта платежа не совпадает со счётом.";
const DENY_FRAUD: &str = "Платёж отклонён. Обратитесь к администратору.";

/// Result of a completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The request moved to `completed`.
    Completed {
        /// Settled amount differed from the invoiced amount.
        amount_mismatch: bool,
        /// Another request for the same record had already completed.
        double_payment: bool,
    },
    /// Unknown token or wrong state; nothing changed.
    Ignored,
}

/// Request counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentStats {
    pub issued: usize,
    pub authorized: usize,
    pub completed: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub struct PaymentEngine {
    requests: RwLock<HashMap<String, Arc<Mutex<PaymentRequest>>>>,
    /// Records with at least one completed request.
    paid_records: std::sync::Mutex<HashSet<i64>>,
    db: Arc<dyn Database>,
    notifier: Arc<Notifier>,
    fraud: Arc<dyn FraudCheck>,
    pricing: PricingConfig,
    authorization_ttl: Duration,
}

impl PaymentEngine {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: Arc<Notifier>,
        fraud: Arc<dyn FraudCheck>,
        pricing: PricingConfig,
        authorization_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: RwLock::new(HashMap::new()),
            paid_records: std::sync::Mutex::new(HashSet::new()),
            db,
            notifier,
            fraud,
            pricing,
            authorization_ttl,
        })
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Fixed fee for `currency`, in its smallest unit.
    pub fn fee(&self, currency: Currency) -> i64 {
        currency.fee(&self.pricing)
    }

    /// Create an `issued` request and present its invoice. Returns the
    /// correlation token. Delivery failure is logged; the request stays issued.
    pub async fn issue_invoice(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        record_id: Option<i64>,
        amount: i64,
        currency: Currency,
    ) -> Result<String, PaymentError> {
        if amount <= 0 {
            return Err(PaymentError::InvalidAmount(amount));
        }

        let request = PaymentRequest::new(user_id, chat_id, record_id, amount, currency);
        let token = request.token.clone();
        let invoice = self.invoice_for(&request);

        self.requests
            .write()
            .await
            .insert(token.clone(), Arc::new(Mutex::new(request)));

        info!(
            user_id,
            token = %token,
            amount,
            currency = %currency,
            record_id = ?record_id,
            "Payment request issued"
        );

        if let Err(e) = self.notifier.transport().send_invoice(chat_id, &invoice).await {
            warn!(user_id, token = %token, error = %e, "Invoice delivery failed");
        }

        Ok(token)
    }

    fn invoice_for(&self, request: &PaymentRequest) -> Invoice {
        let title = match request.currency {
            Currency::Fiat => "Отписка Бот (рубли)",
            Currency::Points => "Отписка Бот (звёзды)",
        };
        Invoice {
            title: title.to_string(),
            description: INVOICE_DESCRIPTION.to_string(),
            payload: request.token.clone(),
            currency: request.currency.code(&self.pricing).to_string(),
            price_label: INVOICE_PRICE_LABEL.to_string(),
            amount: request.amount,
        }
    }

    async fn lookup(&self, token: &str) -> Option<Arc<Mutex<PaymentRequest>>> {
        self.requests.read().await.get(token).cloned()
    }

    /// Snapshot of one request.
    pub async fn get(&self, token: &str) -> Option<PaymentRequest> {
        let entry = self.lookup(token).await?;
        let request = entry.lock().await;
        Some(request.clone())
    }

    /// All requests issued to `user_id`, oldest first.
    pub async fn requests_for_user(&self, user_id: UserId) -> Vec<PaymentRequest> {
        let mut out = Vec::new();
        for entry in self.snapshot().await {
            let request = entry.lock().await;
            if request.user_id == user_id {
                out.push(request.clone());
            }
        }
        out.sort_by_key(|r| r.issued_at);
        out
    }

    pub async fn stats(&self) -> PaymentStats {
        let mut stats = PaymentStats::default();
        for entry in self.snapshot().await {
            match entry.lock().await.state {
                PaymentState::Issued => stats.issued += 1,
                PaymentState::Authorized => stats.authorized += 1,
                PaymentState::Completed => stats.completed += 1,
                PaymentState::Rejected => stats.rejected += 1,
                PaymentState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    async fn snapshot(&self) -> Vec<Arc<Mutex<PaymentRequest>>> {
        self.requests.read().await.values().cloned().collect()
    }

    // ── Pre-authorization ───────────────────────────────────────────

    /// Decide a pre-checkout query and answer it on the transport.
    pub async fn handle_pre_authorization(
        &self,
        query_id: &str,
        from: &Sender,
        token: &str,
        claimed_amount: i64,
        currency_code: &str,
    ) -> PreCheckoutAnswer {
        let answer = self
            .decide_pre_authorization(from, token, claimed_amount, currency_code)
            .await;

        if let Err(e) = self
            .notifier
            .transport()
            .answer_pre_checkout(query_id, &answer)
            .await
        {
            error!(token = %token, error = %e, "Failed to answer pre-checkout query");
        }
        answer
    }

    async fn decide_pre_authorization(
        &self,
        from: &Sender,
        token: &str,
        claimed_amount: i64,
        currency_code: &str,
    ) -> PreCheckoutAnswer {
        let Some(entry) = self.lookup(token).await else {
            return self
                .deny(from, token, DENY_UNKNOWN, "unknown correlation token")
                .await;
        };
        let mut request = entry.lock().await;

        let state = request.state;
        let duplicate = match state {
            PaymentState::Issued => false,
            PaymentState::Authorized => true,
            _ => {
                drop(request);
                return self
                    .deny(from, token, DENY_STALE, &format!("request already {state}"))
                    .await;
            }
        };

        let expected_code = request.currency.code(&self.pricing).to_string();
        let failure = if request.user_id != from.user_id {
            Some((DENY_FOREIGN, format!("payer {} is not the invoiced user", from.user_id)))
        } else if claimed_amount != request.amount {
            Some((
                DENY_AMOUNT,
                format!("amount {claimed_amount} != invoiced {}", request.amount),
            ))
        } else if currency_code != expected_code {
            Some((
                DENY_CURRENCY,
                format!("currency {currency_code} != invoiced {expected_code}"),
            ))
        } else if duplicate {
            None
        } else {
            match self.fraud.assess(&request).await {
                Ok(FraudVerdict::Approve) => None,
                Ok(FraudVerdict::Deny { reason }) => {
                    Some((DENY_FRAUD, format!("fraud check denied: {reason}")))
                }
                Err(e) => Some((DENY_FRAUD, format!("fraud check failed: {e}"))),
            }
        };

        match failure {
            None if duplicate => {
                info!(token = %token, "Duplicate pre-authorization; re-approving");
                PreCheckoutAnswer::Approve
            }
            None => {
                // Issued → Authorized is always valid here.
                let _ = request.transition(PaymentState::Authorized);
                info!(user_id = request.user_id, token = %token, "Payment authorized");
                PreCheckoutAnswer::Approve
            }
            Some((user_reason, detail)) => {
                // An authorized request keeps its state; only issued ones are rejected.
                if !duplicate {
                    let _ = request.transition(PaymentState::Rejected);
                }
                drop(request);
                self.deny(from, token, user_reason, &detail).await
            }
        }
    }

    async fn deny(
        &self,
        from: &Sender,
        token: &str,
        user_reason: &str,
        detail: &str,
    ) -> PreCheckoutAnswer {
        warn!(
            user_id = from.user_id,
            token = %token,
            reason = %detail,
            "Pre-authorization denied"
        );
        self.notifier
            .to_ops(format!(
                "⚠️ Отклонён платёж: {}\nПричина: {detail}\nToken: {token}",
                from.label()
            ))
            .await;
        PreCheckoutAnswer::Deny {
            reason: user_reason.to_string(),
        }
    }

    // ── Completion ──────────────────────────────────────────────────

    /// Apply a successful-payment callback.
    pub async fn handle_completion(
        &self,
        from: &Sender,
        token: &str,
        settled_amount: i64,
        currency_code: &str,
        provider_charge_id: Option<&str>,
    ) -> CompletionOutcome {
        let Some(entry) = self.lookup(token).await else {
            warn!(user_id = from.user_id, token = %token, "Completion for unknown token; ignoring");
            return CompletionOutcome::Ignored;
        };

        let completed = {
            let mut request = entry.lock().await;
            if let Err((from_state, _)) = request.transition(PaymentState::Completed) {
                warn!(
                    user_id = from.user_id,
                    token = %token,
                    state = %from_state,
                    "Completion in wrong state; ignoring"
                );
                return CompletionOutcome::Ignored;
            }
            request.clone()
        };

        info!(
            user_id = completed.user_id,
            token = %token,
            settled_amount,
            charge_id = ?provider_charge_id,
            "Payment completed"
        );

        let double_payment = match completed.record_id {
            Some(id) => !self
                .paid_records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id),
            None => false,
        };

        let updated = match completed.record_id {
            Some(id) => self.db.update_record_status(id, PaymentStatus::Completed).await,
            None => {
                self.db
                    .update_payment_status(completed.user_id, PaymentStatus::Completed)
                    .await
            }
        };
        match updated {
            Ok(true) => {}
            Ok(false) => warn!(token = %token, "No intake record to mark completed"),
            Err(e) => {
                error!(token = %token, error = %e, "Failed to record completed payment");
                self.notifier
                    .to_ops(format!(
                        "❗ Оплата получена, но статус не сохранён: {} (token {token}): {e}",
                        from.label()
                    ))
                    .await;
            }
        }

        let amount_mismatch = settled_amount != completed.amount;
        if amount_mismatch {
            warn!(
                token = %token,
                settled_amount,
                invoiced = completed.amount,
                "Settled amount differs from invoice"
            );
            self.notifier
                .to_ops(format!(
                    "⚠️ Сумма оплаты не совпадает со счётом: {}\nОплачено: {} {currency_code}, выставлено: {} {}",
                    from.label(),
                    completed.currency.to_major(settled_amount),
                    completed.currency.to_major(completed.amount),
                    completed.currency.code(&self.pricing),
                ))
                .await;
        }
        if double_payment {
            warn!(token = %token, record_id = ?completed.record_id, "Double payment for record");
            self.notifier
                .to_ops(format!(
                    "⚠️ Повторная оплата заявки #{}: {}",
                    completed.record_id.unwrap_or_default(),
                    from.label()
                ))
                .await;
        }

        self.notifier
            .to_ops(format!(
                "✅ Оплата прошла: {}\nСумма: {} {currency_code}",
                from.label(),
                completed.currency.to_major(settled_amount)
            ))
            .await;
        self.notifier
            .to_user(completed.chat_id, PAYMENT_CONFIRMED)
            .await;

        CompletionOutcome::Completed {
            amount_mismatch,
            double_payment,
        }
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Fail authorized requests whose completion never arrived and drop
    /// old terminal requests. Returns how many requests were failed.
    pub async fn expire_stale_authorizations(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.authorization_ttl)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let retention = chrono::Duration::from_std(TERMINAL_RETENTION)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();

        let mut expired = Vec::new();
        let mut finished = Vec::new();
        for entry in self.snapshot().await {
            let mut request = entry.lock().await;
            if request.state == PaymentState::Authorized && now - request.updated_at > ttl {
                let _ = request.transition(PaymentState::Failed);
                expired.push(request.clone());
            } else if request.state.is_terminal() && now - request.updated_at > retention {
                finished.push(request.token.clone());
            }
        }

        if !finished.is_empty() {
            let mut requests = self.requests.write().await;
            for token in &finished {
                requests.remove(token);
            }
        }

        for request in &expired {
            warn!(
                user_id = request.user_id,
                token = %request.token,
                "Authorization expired without completion"
            );
            let already_paid = request.record_id.is_some_and(|id| {
                self.paid_records
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(&id)
            });
            if !already_paid {
                let result = match request.record_id {
                    Some(id) => self.db.update_record_status(id, PaymentStatus::Failed).await,
                    None => {
                        self.db
                            .update_payment_status(request.user_id, PaymentStatus::Failed)
                            .await
                    }
                };
                if let Err(e) = result {
                    error!(token = %request.token, error = %e, "Failed to record failed payment");
                }
            }
            self.notifier.to_user(request.chat_id, PAYMENT_EXPIRED).await;
        }

        expired.len()
    }
}

/// Spawn a background task that periodically fails stale authorizations.
pub fn spawn_expiry_task(
    engine: Arc<PaymentEngine>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let expired = engine.expire_stale_authorizations().await;
            if expired > 0 {
                info!(expired, "Stale authorizations failed");
            }
        }
    })
}
