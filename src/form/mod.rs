//! Intake form: fields, validation, per-user sessions and the engine
//! that drives them.

pub mod engine;
pub mod field;
pub mod session;
pub mod validator;

pub use engine::{AnswerOutcome, FormEngine, PAY_FIAT, PAY_POINTS};
pub use field::FormField;
pub use session::{FormSession, SessionStore};
pub use validator::{RejectReason, Rejection, validate};
