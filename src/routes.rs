//! Ops HTTP surface: health, payment lookup and counters.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::payments::PaymentEngine;
use crate::store::Database;

/// Shared state for ops routes.
#[derive(Clone)]
pub struct OpsState {
    pub payments: Arc<PaymentEngine>,
    pub db: Arc<dyn Database>,
}

/// Build the ops router.
pub fn ops_routes(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/payments/{token}", get(get_payment))
        .route("/api/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "intake-bot",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/payments/{token}
///
/// Snapshot of one payment request, or 404 for an unknown token.
async fn get_payment(
    State(state): State<OpsState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.payments.get(&token).await {
        Some(request) => (StatusCode::OK, Json(serde_json::json!(request))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Payment request not found"})),
        ),
    }
}

/// GET /api/stats
async fn stats(State(state): State<OpsState>) -> impl IntoResponse {
    let records = match state.db.count_records_by_status().await {
        Ok(counts) => counts,
        Err(e) => {
            error!(error = %e, "Failed to count records");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Database unavailable"})),
            );
        }
    };
    let payments = state.payments.stats().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "records": {
                "total": records.total(),
                "pending": records.pending,
                "completed": records.completed,
                "failed": records.failed,
            },
            "payments": payments,
        })),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::channels::MemoryTransport;
    use crate::config::PricingConfig;
    use crate::notify::Notifier;
    use crate::payments::{AllowAll, Currency};
    use crate::store::{LibSqlBackend, NewIntakeRecord};

    async fn state() -> OpsState {
        let transport = MemoryTransport::new();
        let notifier = Notifier::new(transport, -100);
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let payments = PaymentEngine::new(
            db.clone(),
            notifier,
            Arc::new(AllowAll),
            PricingConfig::default(),
            Duration::from_secs(1800),
        );
        OpsState { payments, db }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = get_json(ops_routes(state().await), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_payment_is_404() {
        let (status, body) = get_json(ops_routes(state().await), "/api/payments/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn issued_payment_is_visible() {
        let state = state().await;
        let token = state
            .payments
            .issue_invoice(7, 7, None, 39900, Currency::Fiat)
            .await
            .unwrap();
        let (status, body) =
            get_json(ops_routes(state), &format!("/api/payments/{token}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token"], token.as_str());
        assert_eq!(body["state"], "issued");
        assert_eq!(body["amount"], 39900);
    }

    #[tokio::test]
    async fn stats_counts_records_and_payments() {
        let state = state().await;
        state
            .db
            .create_record(&NewIntakeRecord {
                user_id: 1,
                fio: "Иванов Петр Сергеевич".into(),
                source: "Netflix".into(),
                bank: "Сбербанк".into(),
                card: "123456*7890".into(),
                email: "ivan@example.com".into(),
                phone: "+79991234567".into(),
            })
            .await
            .unwrap();
        state
            .payments
            .issue_invoice(1, 1, None, 200, Currency::Points)
            .await
            .unwrap();

        let (status, body) = get_json(ops_routes(state), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"]["total"], 1);
        assert_eq!(body["records"]["pending"], 1);
        assert_eq!(body["payments"]["issued"], 1);
    }
}
