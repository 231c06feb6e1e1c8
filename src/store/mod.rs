//! Persistence layer: libSQL-backed storage for intake records and relayed messages.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, IntakeRecord, NewIntakeRecord, PaymentStatus, RecordCounts, RelayMessage,
};
