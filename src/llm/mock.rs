//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 默认按 system 消息里的 `mode:` 行给出固定形状的 JSON；也可预置一串回复按顺序吐出。

use std::collections::VecDeque;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<Result<String, String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定回复，用完后回落到默认行为
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<S, S>>,
        S: Into<String>,
    {
        let queue = responses
            .into_iter()
            .map(|r| r.map(Into::into).map_err(Into::into))
            .collect();
        Self {
            scripted: Mutex::new(queue),
        }
    }

    async fn next_scripted(&self) -> Option<Result<String, String>> {
        self.scripted.lock().await.pop_front()
    }
}

fn mode_of(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::System)
        .flat_map(|m| m.content.lines())
        .find_map(|line| line.trim().strip_prefix("mode:").map(|v| v.trim().to_lowercase()))
        .unwrap_or_default()
}

fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(scripted) = self.next_scripted().await {
            return scripted;
        }
        let input = last_user(messages);
        let reply = match mode_of(messages).as_str() {
            "classify" => serde_json::json!({
                "kind": if input.contains('?') { "question" } else { "simple_task" },
                "confidence": 0.9,
                "reasoning": "Mock classification",
            }),
            "clarify" => serde_json::json!({
                "interpretations": [format!("Apply the request to the selected object: {}", input)],
                "questions": ["Which object should this apply to?"],
            }),
            "plan" => serde_json::json!({
                "title": "Mock plan",
                "steps": [
                    {"description": "Prepare the scene", "action": {"type": "task", "text": "prepare"}},
                    {"description": format!("Carry out: {}", input), "action": {"type": "task", "text": input}, "depends_on": [0]},
                ],
            }),
            _ => serde_json::json!({"answer": format!("Echo from Mock: {}", input)}),
        };
        Ok(reply.to_string())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
