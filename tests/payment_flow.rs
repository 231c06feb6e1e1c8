mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, OPS, sender};
use intake_bot::channels::PreCheckoutAnswer;
use intake_bot::payments::engine::{PAYMENT_CONFIRMED, PAYMENT_EXPIRED};
use intake_bot::payments::{CompletionOutcome, Currency, PaymentState};
use intake_bot::store::{Database, LibSqlBackend, PaymentStatus};

#[tokio::test]
async fn authorized_then_completed_marks_record() {
    let h = Harness::new().await;
    let token = h.submit_valid_form(1).await;
    let ops_before = h.transport.texts_to(OPS).len();

    h.pre_checkout(1, "q1", &token, 39900, "RUB").await;
    assert_eq!(
        h.transport.pre_checkout_answers(),
        vec![("q1".to_string(), PreCheckoutAnswer::Approve)]
    );
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Authorized
    );

    h.payment_succeeded(1, &token, 39900, "RUB").await;
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Completed
    );
    let record = h.db.latest_record_for_user(1).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::Completed);

    let confirmations = h
        .transport
        .texts_to(1)
        .into_iter()
        .filter(|t| t == PAYMENT_CONFIRMED)
        .count();
    assert_eq!(confirmations, 1);

    let ops = h.transport.texts_to(OPS);
    assert_eq!(ops.len(), ops_before + 1);
    assert!(ops.last().unwrap().contains("Сумма: 399 RUB"));
}

#[tokio::test]
async fn wrong_amount_is_denied_and_record_untouched() {
    let h = Harness::new().await;
    let token = h.submit_valid_form(1).await;
    let ops_before = h.transport.texts_to(OPS).len();

    h.pre_checkout(1, "q1", &token, 1, "RUB").await;
    let answers = h.transport.pre_checkout_answers();
    assert_eq!(answers.len(), 1);
    assert!(!answers[0].1.is_approved());
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Rejected
    );
    assert_eq!(h.transport.texts_to(OPS).len(), ops_before + 1);
    assert_eq!(
        h.db.latest_record_for_user(1)
            .await
            .unwrap()
            .unwrap()
            .payment_status,
        PaymentStatus::Pending
    );

    // A later completion for the rejected request changes nothing.
    h.payment_succeeded(1, &token, 1, "RUB").await;
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Rejected
    );
}

#[tokio::test]
async fn duplicate_completion_is_applied_once() {
    let h = Harness::new().await;
    let token = h.submit_valid_form(1).await;
    h.pre_checkout(1, "q1", &token, 39900, "RUB").await;

    let from = sender(1);
    let first = h
        .payments
        .handle_completion(&from, &token, 39900, "RUB", None)
        .await;
    let second = h
        .payments
        .handle_completion(&from, &token, 39900, "RUB", None)
        .await;
    assert!(matches!(first, CompletionOutcome::Completed { .. }));
    assert_eq!(second, CompletionOutcome::Ignored);

    let confirmations = h
        .transport
        .texts_to(1)
        .into_iter()
        .filter(|t| t == PAYMENT_CONFIRMED)
        .count();
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn concurrent_duplicate_completions_apply_once() {
    let h = Arc::new(Harness::new().await);
    let token = h.submit_valid_form(1).await;
    h.pre_checkout(1, "q1", &token, 39900, "RUB").await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let h = h.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            h.payments
                .handle_completion(&sender(1), &token, 39900, "RUB", None)
                .await
        }));
    }
    let mut completed = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), CompletionOutcome::Completed { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn completion_before_authorization_is_ignored() {
    let h = Harness::new().await;
    let token = h.submit_valid_form(1).await;

    h.payment_succeeded(1, &token, 39900, "RUB").await;
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Issued
    );
    assert_eq!(
        h.db.latest_record_for_user(1)
            .await
            .unwrap()
            .unwrap()
            .payment_status,
        PaymentStatus::Pending
    );
    assert!(!h.transport.texts_to(1).iter().any(|t| t == PAYMENT_CONFIRMED));

    // The normal sequence still works afterwards.
    h.pre_checkout(1, "q1", &token, 39900, "RUB").await;
    h.payment_succeeded(1, &token, 39900, "RUB").await;
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Completed
    );
}

#[tokio::test]
async fn unknown_token_is_denied() {
    let h = Harness::new().await;
    h.pre_checkout(1, "q9", "not-a-token", 39900, "RUB").await;
    let answers = h.transport.pre_checkout_answers();
    assert!(matches!(answers[0].1, PreCheckoutAnswer::Deny { .. }));
    assert_eq!(h.transport.texts_to(OPS).len(), 1);
}

#[tokio::test]
async fn points_payment_after_fiat_rejection() {
    let h = Harness::new().await;
    let fiat = h.submit_valid_form(1).await;
    h.pre_checkout(1, "q1", &fiat, 39900, "XTR").await;
    assert_eq!(
        h.payments.get(&fiat).await.unwrap().state,
        PaymentState::Rejected
    );

    let record = h.db.latest_record_for_user(1).await.unwrap().unwrap();
    let points = h
        .payments
        .issue_invoice(1, 1, Some(record.id), h.payments.fee(Currency::Points), Currency::Points)
        .await
        .unwrap();
    h.pre_checkout(1, "q2", &points, 200, "XTR").await;
    h.payment_succeeded(1, &points, 200, "XTR").await;

    assert_eq!(
        h.db.get_record(record.id).await.unwrap().unwrap().payment_status,
        PaymentStatus::Completed
    );
    assert!(h.transport.texts_to(OPS).last().unwrap().contains("Сумма: 200 XTR"));
}

#[tokio::test]
async fn stale_authorization_fails_record() {
    let h = Harness::with_authorization_ttl(Duration::ZERO).await;
    let token = h.submit_valid_form(1).await;
    h.pre_checkout(1, "q1", &token, 39900, "RUB").await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.payments.expire_stale_authorizations().await, 1);
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Failed
    );
    assert_eq!(
        h.db.latest_record_for_user(1)
            .await
            .unwrap()
            .unwrap()
            .payment_status,
        PaymentStatus::Failed
    );
    assert_eq!(h.transport.texts_to(1).last().unwrap(), PAYMENT_EXPIRED);

    // A completion arriving after expiry is ignored.
    h.payment_succeeded(1, &token, 39900, "RUB").await;
    assert_eq!(
        h.payments.get(&token).await.unwrap().state,
        PaymentState::Failed
    );
}

#[tokio::test]
async fn records_survive_reopening_on_disk_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("intake.db");

    {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let h = Harness::with_db(db, None, Duration::from_secs(1800));
        let token = h.submit_valid_form(1).await;
        h.pre_checkout(1, "q1", &token, 39900, "RUB").await;
        h.payment_succeeded(1, &token, 39900, "RUB").await;
        h.forms.open_relay(&sender(1), None).await;
        h.forms.handle_text(&sender(1), "спасибо").await;
    }

    let reopened = LibSqlBackend::new_local(&path).await.unwrap();
    assert_eq!(reopened.count_records().await.unwrap(), 1);
    let record = reopened.latest_record_for_user(1).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::Completed);
    assert_eq!(record.email, "ivan@example.com");
    assert_eq!(reopened.relay_messages_for_user(1).await.unwrap().len(), 1);
}
