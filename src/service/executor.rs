//! 动作执行器边界
//!
//! 真正改动宿主（场景修改、脚本执行、渲染）的执行器在核心之外；核心只传递不透明的动作载荷，
//! 拿回执行报告。`MockExecutor` 与 `DryRunExecutor` 用于测试与无宿主运行。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::{CoreError, Result, Snapshot};

/// 不透明的动作载荷（JSON），约定 `{"type": "task" | "question", "text": ...}`，其余字段原样透传
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionPayload(pub serde_json::Value);

impl ActionPayload {
    pub fn task(text: impl Into<String>) -> Self {
        Self(serde_json::json!({"type": "task", "text": text.into()}))
    }

    pub fn question(text: impl Into<String>) -> Self {
        Self(serde_json::json!({"type": "question", "text": text.into()}))
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(|v| v.as_str())
    }

    pub fn text(&self) -> Option<&str> {
        self.0.get("text").and_then(|v| v.as_str())
    }

    /// 日志用的截断预览
    pub fn preview(&self) -> String {
        let s = self.0.to_string();
        if s.chars().count() > 120 {
            let cut: String = s.chars().take(120).collect();
            format!("{}...", cut)
        } else {
            s
        }
    }
}

/// 执行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl ExecutionReport {
    pub fn ok(output: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            error: None,
            output,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            output: None,
        }
    }
}

/// 执行器：Err 表示执行通道本身不可用（可重试），报告中的 success=false 表示动作执行失败
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, payload: &ActionPayload, snapshot: &Snapshot) -> Result<ExecutionReport>;
}

/// 只记录载荷、总是成功
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn execute(&self, payload: &ActionPayload, snapshot: &Snapshot) -> Result<ExecutionReport> {
        tracing::info!(
            payload = %payload.preview(),
            objects = snapshot.objects.len(),
            "dry run: action not applied"
        );
        Ok(ExecutionReport::ok(Some(serde_json::json!({
            "dry_run": true,
            "action": payload.0.clone(),
        }))))
    }
}

/// 可编程执行器：按载荷文本中的关键词制造失败或不可用，可加延迟，记录所有执行过的载荷
#[derive(Debug, Default)]
pub struct MockExecutor {
    fail_on: HashSet<String>,
    unavailable_on: HashSet<String>,
    delay: Option<Duration>,
    executed: Mutex<Vec<ActionPayload>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 载荷文本包含 needle 时报告失败
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on.insert(needle.into());
        self
    }

    /// 载荷文本包含 needle 时返回 ServiceUnavailable
    pub fn unavailable_on(mut self, needle: impl Into<String>) -> Self {
        self.unavailable_on.insert(needle.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn executed(&self) -> Vec<ActionPayload> {
        self.executed.lock().await.clone()
    }

    pub async fn executed_texts(&self) -> Vec<String> {
        self.executed
            .lock()
            .await
            .iter()
            .map(|p| p.text().map(String::from).unwrap_or_else(|| p.0.to_string()))
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(&self, payload: &ActionPayload, _snapshot: &Snapshot) -> Result<ExecutionReport> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = payload.text().map(String::from).unwrap_or_else(|| payload.0.to_string());
        if self.unavailable_on.iter().any(|n| text.contains(n.as_str())) {
            return Err(CoreError::ServiceUnavailable(format!("executor offline for '{}'", text)));
        }
        self.executed.lock().await.push(payload.clone());
        if self.fail_on.iter().any(|n| text.contains(n.as_str())) {
            return Ok(ExecutionReport::failed(format!("mock failure: {}", text)));
        }
        Ok(ExecutionReport::ok(Some(serde_json::json!({"done": text}))))
    }
}
