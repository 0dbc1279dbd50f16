//! 可编程的 AI 服务替身（测试与离线演示用）
//!
//! 每个模式有一个回复队列，队列空时使用该模式的默认回复；可设置固定延迟，记录调用次数与指令。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::core::Result;
use crate::service::{AiMode, AiRequest, AiService};

#[derive(Debug, Default)]
pub struct MockAiService {
    queued: Mutex<HashMap<AiMode, VecDeque<Result<Value>>>>,
    defaults: Mutex<HashMap<AiMode, Value>>,
    calls: Mutex<HashMap<AiMode, usize>>,
    instructions: Mutex<Vec<(AiMode, String)>>,
    delay: Option<Duration>,
}

impl MockAiService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次请求先等待 delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 替换某模式的默认回复
    pub fn with_response(mut self, mode: AiMode, value: Value) -> Self {
        self.defaults.get_mut().insert(mode, value);
        self
    }

    /// 一次性回复（先进先出）
    pub async fn push_response(&self, mode: AiMode, value: Value) {
        self.queued
            .lock()
            .await
            .entry(mode)
            .or_default()
            .push_back(Ok(value));
    }

    /// 一次性错误
    pub async fn push_error(&self, mode: AiMode, err: crate::core::CoreError) {
        self.queued
            .lock()
            .await
            .entry(mode)
            .or_default()
            .push_back(Err(err));
    }

    pub async fn calls(&self, mode: AiMode) -> usize {
        self.calls.lock().await.get(&mode).copied().unwrap_or(0)
    }

    pub async fn instructions(&self, mode: AiMode) -> Vec<String> {
        self.instructions
            .lock()
            .await
            .iter()
            .filter(|(m, _)| *m == mode)
            .map(|(_, s)| s.clone())
            .collect()
    }

    fn builtin_default(request: &AiRequest) -> Value {
        let text = request.instruction.as_str();
        match request.mode {
            AiMode::Classify => {
                let kind = if text.trim_end().ends_with('?') {
                    "question"
                } else if crate::classifier::complexity_hint(text) {
                    "complex_task"
                } else {
                    "simple_task"
                };
                json!({"kind": kind, "confidence": 0.9, "reasoning": "mock"})
            }
            AiMode::Clarify => json!({
                "interpretations": [format!("Apply to the active object: {}", text)],
                "questions": [],
            }),
            AiMode::Plan => json!({
                "title": format!("Plan: {}", text),
                "steps": [
                    {"description": "Inspect the scene", "action": {"type": "task", "text": "inspect"}},
                    {"description": format!("Do: {}", text), "action": {"type": "task", "text": text}, "depends_on": [0]},
                ],
            }),
            AiMode::Respond => json!({"answer": format!("Mock answer to: {}", text)}),
        }
    }
}

#[async_trait]
impl AiService for MockAiService {
    async fn request(&self, request: &AiRequest) -> Result<Value> {
        *self.calls.lock().await.entry(request.mode).or_insert(0) += 1;
        self.instructions
            .lock()
            .await
            .push((request.mode, request.instruction.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .await
            .get_mut(&request.mode)
            .and_then(|q| q.pop_front());
        if let Some(result) = queued {
            return result;
        }
        if let Some(value) = self.defaults.lock().await.get(&request.mode) {
            return Ok(value.clone());
        }
        Ok(Self::builtin_default(request))
    }
}
