//! 任务分类器
//!
//! 把请求分为 question / simple_task / complex_task / ambiguous 四类，附带置信度。
//! 先查缓存（键 = classify 命名空间 + 归一化文本 + 快照指纹），未命中才请求 AI 服务；
//! 置信度低于阈值时强制视为 ambiguous。服务错误原样上报，不会被降级为默认分类。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::config::AppConfig;
use crate::core::{CoreError, Result, Snapshot};
use crate::service::{AiMode, AiRequest, ServiceGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Question,
    SimpleTask,
    ComplexTask,
    Ambiguous,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Question => "question",
            TaskKind::SimpleTask => "simple_task",
            TaskKind::ComplexTask => "complex_task",
            TaskKind::Ambiguous => "ambiguous",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: TaskKind,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl Classification {
    /// 服务回复的形状校验：{kind, confidence}，confidence 在 [0, 1]
    pub fn from_response(value: &serde_json::Value) -> Result<Self> {
        let parsed: Classification = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::MalformedResponse(format!("classification: {}", e)))?;
        if !parsed.confidence.is_finite() || !(0.0..=1.0).contains(&parsed.confidence) {
            return Err(CoreError::MalformedResponse(format!(
                "classification confidence out of range: {}",
                parsed.confidence
            )));
        }
        Ok(parsed)
    }
}

#[derive(Clone)]
pub struct TaskClassifier {
    gateway: ServiceGateway,
    threshold: f64,
    auto_promote: bool,
}

impl TaskClassifier {
    pub fn new(gateway: ServiceGateway, threshold: f64) -> Self {
        Self {
            gateway,
            threshold,
            auto_promote: false,
        }
    }

    pub fn from_config(gateway: ServiceGateway, cfg: &AppConfig) -> Self {
        Self {
            gateway,
            threshold: cfg.classifier.confidence_threshold,
            auto_promote: cfg.planner.auto_promote,
        }
    }

    /// simple_task 命中多步关键词时升级为 complex_task
    pub fn with_auto_promote(mut self, on: bool) -> Self {
        self.auto_promote = on;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn classify(
        &self,
        text: &str,
        snapshot: Arc<Snapshot>,
        context: Option<String>,
    ) -> Result<Classification> {
        let key = CacheKey::new("classify", text, &snapshot.fingerprint());
        let mut request = AiRequest::new(AiMode::Classify, text, snapshot);
        if let Some(ctx) = context {
            request = request.with_context(ctx);
        }
        let value = self
            .gateway
            .request_cached(&request, key, |v| Classification::from_response(v).is_ok())
            .await?;
        let mut classification = Classification::from_response(&value)?;

        if classification.confidence < self.threshold && classification.kind != TaskKind::Ambiguous {
            tracing::info!(
                kind = %classification.kind,
                confidence = classification.confidence,
                threshold = self.threshold,
                "low confidence, treating request as ambiguous"
            );
            classification.reasoning = format!(
                "{} (confidence {:.2} below threshold {:.2})",
                classification.reasoning, classification.confidence, self.threshold
            );
            classification.kind = TaskKind::Ambiguous;
        } else if self.auto_promote
            && classification.kind == TaskKind::SimpleTask
            && complexity_hint(text)
        {
            tracing::debug!("simple task promoted to multi-step");
            classification.kind = TaskKind::ComplexTask;
        }

        tracing::info!(
            kind = %classification.kind,
            confidence = classification.confidence,
            "request classified"
        );
        Ok(classification)
    }
}

const COMPLEX_WORDS: &[&str] = &[
    "room", "house", "building", "scene", "environment", "multiple", "several", "many", "all",
    "entire", "complete", "full", "detailed", "complex", "then", "after", "before", "with",
];
const ACTION_WORDS: &[&str] = &["create", "make", "add", "place", "set", "apply", "render"];

/// 关键词启发：请求是否像需要多步完成的任务
pub fn complexity_hint(text: &str) -> bool {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let complexity = COMPLEX_WORDS.iter().filter(|k| words.contains(k)).count();
    let actions = ACTION_WORDS.iter().filter(|k| words.contains(k)).count();
    complexity >= 2 || actions >= 2 || words.len() >= 15 || words.contains(&"and")
}
