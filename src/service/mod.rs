//! 外部协作方边界：AI 服务与动作执行器
//!
//! 核心只通过这两个 trait 与外界交互；返回值是结构化 JSON 或执行报告，具体含义由上层解释。

pub mod executor;
pub mod gateway;
pub mod llm_service;
pub mod mock;
pub mod parse;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Result, Snapshot};

pub use executor::{ActionExecutor, ActionPayload, DryRunExecutor, ExecutionReport, MockExecutor};
pub use gateway::ServiceGateway;
pub use llm_service::LlmAiService;
pub use mock::MockAiService;
pub use parse::extract_json;

/// 请求用途，决定 AI 回复的 JSON 形状
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    /// {kind, confidence, reasoning}
    Classify,
    /// {interpretations, questions}
    Clarify,
    /// {title, steps: [{description, action, depends_on, ...}]}
    Plan,
    /// {answer}
    Respond,
}

impl AiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiMode::Classify => "classify",
            AiMode::Clarify => "clarify",
            AiMode::Plan => "plan",
            AiMode::Respond => "respond",
        }
    }
}

impl std::fmt::Display for AiMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次 AI 请求
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub instruction: String,
    pub snapshot: Arc<Snapshot>,
    pub mode: AiMode,
    /// 对话上下文摘要（可为空）
    pub context: Option<String>,
}

impl AiRequest {
    pub fn new(mode: AiMode, instruction: impl Into<String>, snapshot: Arc<Snapshot>) -> Self {
        Self {
            instruction: instruction.into(),
            snapshot,
            mode,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = if context.is_empty() { None } else { Some(context) };
        self
    }
}

/// AI 服务：给定指令与快照，返回结构化 JSON
///
/// 网络 / 后端错误返回 ServiceUnavailable，无法解析为 JSON 的回复返回 MalformedResponse。
#[async_trait]
pub trait AiService: Send + Sync {
    async fn request(&self, request: &AiRequest) -> Result<serde_json::Value>;
}
