//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::channels::UserId;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Database, IntakeRecord, NewIntakeRecord, PaymentStatus, RecordCounts, RelayMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_one_record(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<IntakeRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

const RECORD_COLUMNS: &str =
    "id, user_id, fio, source, bank, card, email, phone, payment_status, created_at, updated_at";

/// Map a libsql Row to an IntakeRecord. Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<IntakeRecord, libsql::Error> {
    let status_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(IntakeRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        fio: row.get(2)?,
        source: row.get(3)?,
        bank: row.get(4)?,
        card: row.get(5)?,
        email: row.get(6)?,
        phone: row.get(7)?,
        payment_status: status_str.parse().unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_relay(row: &libsql::Row) -> Result<RelayMessage, libsql::Error> {
    let created_str: String = row.get(3)?;
    Ok(RelayMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        created_at: parse_datetime(&created_str),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Intake records ──────────────────────────────────────────────

    async fn create_record(&self, record: &NewIntakeRecord) -> Result<IntakeRecord, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let created = self
            .query_one_record(
                "create_record",
                &format!(
                    "INSERT INTO intake_records
                        (user_id, fio, source, bank, card, email, phone, payment_status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![
                    record.user_id,
                    record.fio.as_str(),
                    record.source.as_str(),
                    record.bank.as_str(),
                    record.card.as_str(),
                    record.email.as_str(),
                    record.phone.as_str(),
                    now
                ],
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("create_record: no row returned".into()))?;

        debug!(record_id = created.id, user_id = created.user_id, "Intake record created");
        Ok(created)
    }

    async fn update_payment_status(
        &self,
        user_id: UserId,
        status: PaymentStatus,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE intake_records SET payment_status = ?1, updated_at = ?2
                 WHERE id = (SELECT id FROM intake_records WHERE user_id = ?3 ORDER BY id DESC LIMIT 1)",
                params![status.as_str(), now, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_payment_status: {e}")))?;
        Ok(affected > 0)
    }

    async fn update_record_status(
        &self,
        record_id: i64,
        status: PaymentStatus,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE intake_records SET payment_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_record_status: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_record(&self, id: i64) -> Result<Option<IntakeRecord>, DatabaseError> {
        self.query_one_record(
            "get_record",
            &format!("SELECT {RECORD_COLUMNS} FROM intake_records WHERE id = ?1"),
            params![id],
        )
        .await
    }

    async fn latest_record_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<IntakeRecord>, DatabaseError> {
        self.query_one_record(
            "latest_record_for_user",
            &format!(
                "SELECT {RECORD_COLUMNS} FROM intake_records
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1"
            ),
            params![user_id],
        )
        .await
    }

    async fn count_records(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM intake_records", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count_records row parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_records: {e}"))),
        }
    }

    async fn count_records_by_status(&self) -> Result<RecordCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT payment_status, COUNT(*) FROM intake_records GROUP BY payment_status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records_by_status: {e}")))?;

        let mut counts = RecordCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records_by_status: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_records_by_status: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("count_records_by_status: {e}")))?;
            match status.parse::<PaymentStatus>() {
                Ok(PaymentStatus::Pending) => counts.pending += n,
                Ok(PaymentStatus::Completed) => counts.completed += n,
                Ok(PaymentStatus::Failed) => counts.failed += n,
                Err(e) => debug!(error = %e, "Skipping unknown payment status in counts"),
            }
        }
        Ok(counts)
    }

    // ── Relay messages ──────────────────────────────────────────────

    async fn insert_relay_message(
        &self,
        user_id: UserId,
        content: &str,
    ) -> Result<RelayMessage, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO relay_messages (user_id, content, created_at) VALUES (?1, ?2, ?3)
                 RETURNING id, user_id, content, created_at",
                params![user_id, content, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_relay_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_relay(&row)
                .map_err(|e| DatabaseError::Query(format!("insert_relay_message row parse: {e}"))),
            Ok(None) => Err(DatabaseError::Query(
                "insert_relay_message: no row returned".into(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("insert_relay_message: {e}"))),
        }
    }

    async fn relay_messages_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<RelayMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, content, created_at FROM relay_messages
                 WHERE user_id = ?1 ORDER BY id ASC",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("relay_messages_for_user: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("relay_messages_for_user: {e}")))?
        {
            messages.push(row_to_relay(&row).map_err(|e| {
                DatabaseError::Query(format!("relay_messages_for_user row parse: {e}"))
            })?);
        }
        Ok(messages)
    }
}
