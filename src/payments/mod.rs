//! Payments: invoice issuance, pre-authorization checks and completion.

pub mod engine;
pub mod fraud;
pub mod model;

pub use engine::{CompletionOutcome, PaymentEngine, PaymentStats, spawn_expiry_task};
pub use fraud::{AllowAll, FraudCheck, FraudVerdict};
pub use model::{Currency, PaymentRequest, PaymentState};
