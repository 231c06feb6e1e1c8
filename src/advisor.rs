//! Correction advisor: turns a rejected answer into a human-readable hint.
//!
//! Exactly one bounded model call per hint. Any failure (no provider,
//! timeout, HTTP error, empty reply) degrades to a fixed text.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AdvisorConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Upper bound on the length of a hint forwarded to the user.
const MAX_HINT_CHARS: usize = 1000;

/// Reply to free text when the model is unavailable.
pub const FREE_TEXT_FALLBACK: &str =
    "Извините, сейчас не могу ответить. Пожалуйста, попробуйте позже.";

const SYSTEM_PROMPT: &str = "\
Ты помощник в боте для отмены подписок и нежелательных списаний. Твоя задача:
1. Помогать пользователям правильно заполнить анкету на отписку.
2. Отвечать на вопросы о процессе отписки и о том, как работает сервис.
3. Если пользователь ввёл данные с ошибкой, вежливо объяснить, что не так, и попросить исправить.

Правила:
- Не отвечай на вопросы, не связанные с отпиской.
- Сохраняй профессиональный и вежливый тон.
- Отвечай кратко, 1-3 предложения.";

fn correction_prompt(constraint: &str, rejected: &str) -> String {
    format!(
        "Пользователь ввёл: «{rejected}». Это не подходит, требуется: {constraint}. \
         Объясни, что исправить, и попроси ввести заново."
    )
}

/// Bounded, fail-soft wrapper around an `LlmProvider`.
pub struct CorrectionAdvisor {
    llm: Option<Arc<dyn LlmProvider>>,
    timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

impl CorrectionAdvisor {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, config: &AdvisorConfig) -> Self {
        Self {
            llm,
            timeout: config.timeout,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Advisor that always answers with fallback texts.
    pub fn disabled() -> Self {
        Self::new(None, &AdvisorConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.llm.is_some()
    }

    /// Hint for a rejected answer, or `fallback` if the model fails.
    pub async fn correct(&self, constraint: &str, rejected: &str, fallback: &str) -> String {
        match self.ask(correction_prompt(constraint, rejected)).await {
            Ok(hint) => hint,
            Err(e) => {
                warn!(error = %e, "Correction advisor failed; using fallback hint");
                fallback.to_string()
            }
        }
    }

    /// Short answer to a free-form question asked outside the form.
    pub async fn answer_question(&self, text: &str) -> String {
        match self.ask(text.to_string()).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Free-text answer failed; using fallback");
                FREE_TEXT_FALLBACK.to_string()
            }
        }
    }

    async fn ask(&self, prompt: String) -> Result<String, LlmError> {
        let Some(llm) = &self.llm else {
            return Err(LlmError::RequestFailed {
                provider: "none".into(),
                reason: "no provider configured".into(),
            });
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = tokio::time::timeout(self.timeout, llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: llm.model_name().to_string(),
                timeout: self.timeout,
            })??;

        let content = response.content.trim();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: llm.model_name().to_string(),
                reason: "empty completion".into(),
            });
        }

        debug!(
            model = llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Advisor completion"
        );
        Ok(content.chars().take(MAX_HINT_CHARS).collect())
    }
}
