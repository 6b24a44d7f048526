//! Request bodies accepted by the chat endpoints. Field names are camelCase;
//! the older snake_case spellings are accepted as aliases.

use chatgate_core::types::{ChatMessage, ConversationRequest, GenerationOptions, TaskType};
use chatgate_core::GatewayError;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default, alias = "conversationHistory", alias = "conversation_history")]
    pub history: Vec<ChatMessage>,
    #[serde(default, alias = "task_type")]
    pub task_type: Option<String>,
    #[serde(default, alias = "useRag", alias = "use_rag", alias = "use_local_search")]
    pub use_local_search: bool,
    #[serde(default, alias = "use_web_search")]
    pub use_web_search: bool,
    #[serde(default)]
    pub options: GenerationOptions,
    #[serde(default, alias = "temporary_prompts")]
    pub temporary_prompts: Vec<String>,
}

impl ChatBody {
    /// Trim and validate. A missing or blank session id gets a fresh one.
    pub fn into_request(self) -> Result<ConversationRequest, GatewayError> {
        let message = self.message.trim();
        if message.is_empty() {
            return Err(GatewayError::Validation("message must not be empty".into()));
        }
        let session_id = self
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task_type = self.task_type.as_deref().map(TaskType::parse).unwrap_or_default();

        let mut req = ConversationRequest::new(session_id, message)
            .with_task_type(task_type)
            .with_history(self.history)
            .with_local_search(self.use_local_search)
            .with_web_search(self.use_web_search);
        req.options = self.options;
        req.temporary_prompts = self.temporary_prompts;
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_spellings() {
        let camel: ChatBody = serde_json::from_str(
            r#"{"message":" hi ","sessionId":"s1","taskType":"research","useWebSearch":true,"temporaryPrompts":["be brief"]}"#,
        )
        .unwrap();
        let snake: ChatBody = serde_json::from_str(
            r#"{"message":"hi","session_id":"s1","task_type":"research","use_web_search":true,"use_rag":true,"conversation_history":[{"role":"user","content":"before"}]}"#,
        )
        .unwrap();

        let a = camel.into_request().unwrap();
        assert_eq!(a.user_message, "hi");
        assert_eq!(a.session_id, "s1");
        assert_eq!(a.task_type, TaskType::Research);
        assert!(a.use_web_search);
        assert_eq!(a.temporary_prompts, vec!["be brief".to_string()]);

        let b = snake.into_request().unwrap();
        assert!(b.use_local_search);
        assert_eq!(b.history.len(), 1);
    }

    #[test]
    fn blank_message_is_rejected_and_session_is_generated() {
        let blank = ChatBody { message: "  ".into(), ..ChatBody::default() };
        assert!(matches!(blank.into_request(), Err(GatewayError::Validation(_))));

        let fresh = ChatBody { message: "hello".into(), session_id: Some(" ".into()), ..ChatBody::default() };
        let req = fresh.into_request().unwrap();
        assert_eq!(req.session_id.len(), 36);
        assert_eq!(req.task_type, TaskType::Auto);
    }
}
