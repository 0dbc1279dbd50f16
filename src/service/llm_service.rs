//! 基于 LlmClient 的 AI 服务实现
//!
//! 按模式拼 system 提示（首行 `mode: <mode>`，随后是期望的 JSON 形状与场景摘要），
//! 调用 LLM 后从回复中提取 JSON。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{CoreError, Result};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::service::{extract_json, AiMode, AiRequest, AiService};

pub struct LlmAiService {
    llm: Arc<dyn LlmClient>,
}

impl LlmAiService {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    fn system_prompt(request: &AiRequest) -> String {
        let shape = match request.mode {
            AiMode::Classify => {
                "Classify the user request. Reply with JSON only: \
                 {\"kind\": \"question\" | \"simple_task\" | \"complex_task\" | \"ambiguous\", \
                 \"confidence\": <0..1>, \"reasoning\": \"...\"}"
            }
            AiMode::Clarify => {
                "The user request is ambiguous. Reply with JSON only: \
                 {\"interpretations\": [\"...\"], \"questions\": [\"...\"]}"
            }
            AiMode::Plan => {
                "Break the request into ordered steps. Reply with JSON only: \
                 {\"title\": \"...\", \"steps\": [{\"description\": \"...\", \"action\": {...}, \
                 \"depends_on\": [<earlier step indices>], \"risk\": \"low\" | \"medium\" | \"high\", \
                 \"expected_outcome\": \"...\"}]}"
            }
            AiMode::Respond => "Answer the user. Reply with JSON only: {\"answer\": \"...\"}",
        };
        let mut prompt = format!(
            "mode: {}\n{}\n\nScene:\n{}",
            request.mode,
            shape,
            request.snapshot.summary()
        );
        if let Some(context) = &request.context {
            prompt.push_str("\n\n");
            prompt.push_str(context);
        }
        prompt
    }
}

#[async_trait]
impl AiService for LlmAiService {
    async fn request(&self, request: &AiRequest) -> Result<serde_json::Value> {
        let messages = vec![
            Message::system(Self::system_prompt(request)),
            Message::user(request.instruction.clone()),
        ];
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(CoreError::ServiceUnavailable)?;
        tracing::debug!(mode = %request.mode, backend = self.llm.name(), "llm reply received");
        extract_json(&output)
    }
}
