//! `Database` trait: the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::UserId;
use crate::error::DatabaseError;

/// Payment status of an intake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// A validated submission, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIntakeRecord {
    pub user_id: UserId,
    pub fio: String,
    pub source: String,
    pub bank: String,
    pub card: String,
    pub email: String,
    pub phone: String,
}

/// A stored submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntakeRecord {
    pub id: i64,
    pub user_id: UserId,
    pub fio: String,
    pub source: String,
    pub bank: String,
    pub card: String,
    pub email: String,
    pub phone: String,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message a user asked to forward to operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayMessage {
    pub id: i64,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Number of records per payment status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
}

impl RecordCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.completed + self.failed
    }
}

/// Backend-agnostic persistence. Records are appended and their payment
/// status updated; nothing is ever deleted.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Intake records ──────────────────────────────────────────────

    /// Store a completed submission with status `pending`.
    async fn create_record(&self, record: &NewIntakeRecord) -> Result<IntakeRecord, DatabaseError>;

    /// Set the payment status of the user's most recent record.
    /// Returns `false` if the user has no record.
    async fn update_payment_status(
        &self,
        user_id: UserId,
        status: PaymentStatus,
    ) -> Result<bool, DatabaseError>;

    /// Set the payment status of one record. Returns `false` if it does not exist.
    async fn update_record_status(
        &self,
        record_id: i64,
        status: PaymentStatus,
    ) -> Result<bool, DatabaseError>;

    async fn get_record(&self, id: i64) -> Result<Option<IntakeRecord>, DatabaseError>;

    async fn latest_record_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<IntakeRecord>, DatabaseError>;

    async fn count_records(&self) -> Result<i64, DatabaseError>;

    async fn count_records_by_status(&self) -> Result<RecordCounts, DatabaseError>;

    // ── Relay messages ──────────────────────────────────────────────

    async fn insert_relay_message(
        &self,
        user_id: UserId,
        content: &str,
    ) -> Result<RelayMessage, DatabaseError>;

    /// Relay messages from one user, oldest first.
    async fn relay_messages_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<RelayMessage>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_round_trips_through_str() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Completed,
            PaymentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn record_counts_total() {
        let counts = RecordCounts {
            pending: 2,
            completed: 3,
            failed: 1,
        };
        assert_eq!(counts.total(), 6);
    }
}
