//! Per-field answer validation.
//!
//! Pure functions: the same field and text always give the same verdict.
//! Input is trimmed before any rule is applied.

use std::sync::LazyLock;

use regex::Regex;

use super::field::FormField;

static FIO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+$").unwrap()
});
static BANK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w\s]{3,}$").unwrap());
static CARD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{6}\*[0-9]{4}$").unwrap());
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9]{10,15}$").unwrap());

/// Minimum length of a free-form source description, in characters.
const SOURCE_MIN_CHARS: usize = 3;

/// Why an answer was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Nothing but whitespace.
    Empty,
    /// Shorter than the field allows.
    TooShort { min: usize },
    /// Does not match the field's format.
    Format,
    /// The field takes no answers.
    NotAnswerable,
}

/// A rejected answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub field: FormField,
    pub reason: RejectReason,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            RejectReason::Empty => write!(f, "{}: empty answer", self.field),
            RejectReason::TooShort { min } => {
                write!(f, "{}: shorter than {min} characters", self.field)
            }
            RejectReason::Format => write!(f, "{}: format mismatch", self.field),
            RejectReason::NotAnswerable => write!(f, "{}: takes no answer", self.field),
        }
    }
}

/// Validate `raw` for `field`. Returns the trimmed answer on success.
pub fn validate(field: FormField, raw: &str) -> Result<String, Rejection> {
    let text = raw.trim();
    let reject = |reason| Rejection { field, reason };

    if field.is_terminal() {
        return Err(reject(RejectReason::NotAnswerable));
    }
    if text.is_empty() {
        return Err(reject(RejectReason::Empty));
    }

    let ok = match field {
        FormField::Fio => FIO.is_match(text),
        FormField::Source => {
            if text.chars().count() < SOURCE_MIN_CHARS {
                return Err(reject(RejectReason::TooShort {
                    min: SOURCE_MIN_CHARS,
                }));
            }
            true
        }
        FormField::Bank => BANK.is_match(text),
        FormField::Card => CARD.is_match(text),
        FormField::Email => EMAIL.is_match(text),
        FormField::Phone => PHONE.is_match(text),
        FormField::Done => false,
    };

    if ok {
        Ok(text.to_string())
    } else {
        Err(reject(RejectReason::Format))
    }
}
