//! Payment request model and its state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::{ChatId, UserId};
use crate::config::PricingConfig;

/// Kind of currency an invoice is priced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    /// Money, counted in minor units (kopecks).
    Fiat,
    /// In-platform points; no sub-unit.
    Points,
}

impl Currency {
    /// Minor units per major unit.
    pub fn minor_per_major(&self) -> i64 {
        match self {
            Self::Fiat => 100,
            Self::Points => 1,
        }
    }

    /// Processor currency code for this kind.
    pub fn code<'a>(&self, pricing: &'a PricingConfig) -> &'a str {
        match self {
            Self::Fiat => &pricing.fiat_currency,
            Self::Points => &pricing.points_currency,
        }
    }

    /// Fixed service fee in the smallest unit.
    pub fn fee(&self, pricing: &PricingConfig) -> i64 {
        match self {
            Self::Fiat => pricing.fiat_price * self.minor_per_major(),
            Self::Points => pricing.points_price,
        }
    }

    /// Amount in major units, for display.
    pub fn to_major(&self, amount: i64) -> Decimal {
        (Decimal::new(amount, 0) / Decimal::new(self.minor_per_major(), 0)).normalize()
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fiat => "fiat",
            Self::Points => "points",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of one payment request.
///
/// issued → authorized → completed; issued → rejected; authorized → failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Issued,
    Authorized,
    Completed,
    Rejected,
    Failed,
}

impl PaymentState {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: PaymentState) -> bool {
        use PaymentState::*;
        matches!(
            (self, target),
            (Issued, Authorized) | (Issued, Rejected) | (Authorized, Completed) | (Authorized, Failed)
        )
    }

    /// Whether this state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Issued => "issued",
            Self::Authorized => "authorized",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One issued invoice and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRequest {
    /// Correlation token echoed back by the processor.
    pub token: String,
    pub user_id: UserId,
    pub chat_id: ChatId,
    /// Record being paid for, when known.
    pub record_id: Option<i64>,
    /// Amount in the smallest unit of `currency`.
    pub amount: i64,
    pub currency: Currency,
    pub state: PaymentState,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRequest {
    pub fn new(
        user_id: UserId,
        chat_id: ChatId,
        record_id: Option<i64>,
        amount: i64,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            token: Uuid::new_v4().to_string(),
            user_id,
            chat_id,
            record_id,
            amount,
            currency,
            state: PaymentState::Issued,
            issued_at: now,
            updated_at: now,
        }
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition(&mut self, target: PaymentState) -> Result<(), (PaymentState, PaymentState)> {
        if !self.state.can_transition_to(target) {
            return Err((self.state, target));
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}
