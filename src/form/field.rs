//! Form fields: the fixed order of questions and their texts.

use serde::{Deserialize, Serialize};

/// The steps of the intake form.
///
/// Progresses linearly: Fio → Source → Bank → Card → Email → Phone → Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormField {
    #[default]
    Fio,
    Source,
    Bank,
    Card,
    Email,
    Phone,
    Done,
}

impl FormField {
    /// Fields that collect an answer, in order.
    pub const ANSWERS: [FormField; 6] = [
        FormField::Fio,
        FormField::Source,
        FormField::Bank,
        FormField::Card,
        FormField::Email,
        FormField::Phone,
    ];

    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: FormField) -> bool {
        self.next() == Some(target)
    }

    /// Whether the form is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Get the next field in the linear progression, if any.
    pub fn next(&self) -> Option<FormField> {
        use FormField::*;
        match self {
            Fio => Some(Source),
            Source => Some(Bank),
            Bank => Some(Card),
            Card => Some(Email),
            Email => Some(Phone),
            Phone => Some(Done),
            Done => None,
        }
    }

    /// Question shown when the field becomes current.
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::Fio => "👤 Введите ФИО (три слова, первая буква заглавная):",
            Self::Source => "📃 Укажите источник списания (сайт или сервис):",
            Self::Bank => "🏦 Введите название банка:",
            Self::Card => "💳 Введите 6 первых и 4 последних цифры карты (формат: 123456*7890):",
            Self::Email => "📧 Введите email:",
            Self::Phone => "📱 Введите телефон (10-15 цифр, можно с +):",
            Self::Done => "✅ Анкета заполнена.",
        }
    }

    /// What a valid answer looks like, phrased for the correction model.
    pub fn constraint(&self) -> &'static str {
        match self {
            Self::Fio => {
                "ФИО в формате «Фамилия Имя Отчество»: три слова кириллицей, каждое с заглавной буквы"
            }
            Self::Source => "источник списания: название сайта или сервиса, не короче 3 символов",
            Self::Bank => "название банка: буквы, цифры и пробелы, не короче 3 символов",
            Self::Card => "маска карты: 6 первых цифр, звёздочка, 4 последних цифры (123456*7890)",
            Self::Email => "адрес электронной почты вида name@example.com",
            Self::Phone => "номер телефона из 10-15 цифр, можно с + в начале",
            Self::Done => "",
        }
    }

    /// Canned hint used when the correction model is unavailable.
    pub fn fallback_hint(&self) -> &'static str {
        match self {
            Self::Fio => "❗ Пожалуйста, введите корректное ФИО, например: Иванов Петр Сергеевич",
            Self::Source => "❗ Опишите источник списания подробнее (минимум 3 символа).",
            Self::Bank => "❗ Введите название банка, например: Сбербанк",
            Self::Card => "❗ Введите карту в формате 123456*7890",
            Self::Email => "❗ Введите корректный email, например: name@example.com",
            Self::Phone => "❗ Введите телефон из 10-15 цифр, например: +79991234567",
            Self::Done => "",
        }
    }

    /// Line label in the operations summary.
    pub fn summary_label(&self) -> &'static str {
        match self {
            Self::Fio => "👤 ФИО",
            Self::Source => "📄 Источник",
            Self::Bank => "🏦 Банк",
            Self::Card => "💳 Карта",
            Self::Email => "📧 Email",
            Self::Phone => "📱 Телефон",
            Self::Done => "",
        }
    }
}

impl std::fmt::Display for FormField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fio => "fio",
            Self::Source => "source",
            Self::Bank => "bank",
            Self::Card => "card",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}
