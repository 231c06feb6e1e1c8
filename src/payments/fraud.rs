//! Fraud screening consulted before a payment is authorized.

use async_trait::async_trait;

use super::model::PaymentRequest;
use crate::error::PaymentError;

/// Verdict of a fraud check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FraudVerdict {
    Approve,
    Deny { reason: String },
}

/// Decides whether an issued request may be authorized.
///
/// An `Err` is treated as a denial.
#[async_trait]
pub trait FraudCheck: Send + Sync {
    async fn assess(&self, request: &PaymentRequest) -> Result<FraudVerdict, PaymentError>;
}

/// Approves everything. Used when no screening service is configured.
pub struct AllowAll;

#[async_trait]
impl FraudCheck for AllowAll {
    async fn assess(&self, _request: &PaymentRequest) -> Result<FraudVerdict, PaymentError> {
        Ok(FraudVerdict::Approve)
    }
}
