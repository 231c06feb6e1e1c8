//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// A request split the way rig wants it.
#[derive(Debug, PartialEq, Eq)]
struct RigParts {
    preamble: Option<String>,
    history: Vec<ChatMessage>,
    prompt: String,
}

/// System messages become the preamble, the last user message becomes the
/// prompt and everything in between is history.
fn split_messages(messages: &[ChatMessage]) -> Result<RigParts, LlmError> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut rest: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let prompt = match rest.pop() {
        Some(last) if last.role == Role::User => last.content,
        _ => {
            return Err(LlmError::InvalidResponse {
                provider: "rig".into(),
                reason: "request must end with a user message".into(),
            });
        }
    };

    Ok(RigParts {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: rest,
        prompt,
    })
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        Role::User | Role::System => Message::user(message.content.clone()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let parts = split_messages(&request.messages)?;

        let mut builder = self
            .model
            .completion_request(parts.prompt)
            .messages(parts.history.iter().map(to_rig_message).collect());
        if let Some(preamble) = parts.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = self
            .model
            .completion(builder.build())
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            finish_reason: if content.is_empty() {
                FinishReason::Unknown
            } else {
                FinishReason::Stop
            },
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_preamble() {
        let parts = split_messages(&[
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("what now?"),
        ])
        .unwrap();
        assert_eq!(parts.preamble.as_deref(), Some("be brief"));
        assert_eq!(parts.history.len(), 2);
        assert_eq!(parts.prompt, "what now?");
    }

    #[test]
    fn single_user_message_has_no_preamble() {
        let parts = split_messages(&[ChatMessage::user("q")]).unwrap();
        assert!(parts.preamble.is_none());
        assert!(parts.history.is_empty());
    }

    #[test]
    fn request_must_end_with_user_message() {
        assert!(split_messages(&[ChatMessage::system("s")]).is_err());
        assert!(
            split_messages(&[ChatMessage::user("q"), ChatMessage::assistant("a")]).is_err()
        );
    }
}
