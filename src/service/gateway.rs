//! 服务网关：AiService + 响应缓存 + 退避重试 + 单次调用超时
//!
//! 分类器、澄清器、规划器都经由网关访问 AI 服务。每次调用都带超时并输出一行 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::cache::{CacheKey, ResponseCache};
use crate::core::{CoreError, RecoveryEngine, Result};
use crate::service::{AiRequest, AiService};

pub type SharedCache = Arc<Mutex<ResponseCache<serde_json::Value>>>;

#[derive(Clone)]
pub struct ServiceGateway {
    service: Arc<dyn AiService>,
    cache: SharedCache,
    recovery: RecoveryEngine,
    timeout: Duration,
}

impl ServiceGateway {
    pub fn new(
        service: Arc<dyn AiService>,
        cache: SharedCache,
        recovery: RecoveryEngine,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            cache,
            recovery,
            timeout,
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// 不走缓存的请求（计划生成等每次都应重新生成的调用）
    pub async fn request(&self, request: &AiRequest) -> Result<serde_json::Value> {
        let mode = request.mode.as_str();
        self.recovery
            .run(mode, || self.request_once(request))
            .await
    }

    /// 先查缓存；未命中时请求服务，并由 accept 判断回复形状是否正确，正确才写入缓存
    pub async fn request_cached<F>(
        &self,
        request: &AiRequest,
        key: CacheKey,
        accept: F,
    ) -> Result<serde_json::Value>
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        if let Some(hit) = self.cache.lock().await.get(&key) {
            tracing::debug!(mode = %request.mode, "cache hit");
            return Ok(hit);
        }
        let value = self.request(request).await?;
        if accept(&value) {
            self.cache.lock().await.put(key, value.clone());
        }
        Ok(value)
    }

    async fn request_once(&self, request: &AiRequest) -> Result<serde_json::Value> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.service.request(request)).await;
        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(e)) if e.is_transient() => "unavailable",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "ai_audit",
            "mode": request.mode.as_str(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "instruction_preview": preview(&request.instruction),
        });
        tracing::info!(audit = %audit, "ai");

        match result {
            Ok(inner) => inner,
            // 超时按服务不可用处理，交给恢复引擎决定是否重试
            Err(_) => Err(CoreError::ServiceUnavailable(format!(
                "{} request timed out after {:?}",
                request.mode, self.timeout
            ))),
        }
    }
}

fn preview(text: &str) -> String {
    let s: String = text.chars().take(80).collect();
    if text.chars().count() > 80 {
        format!("{}...", s)
    } else {
        s
    }
}
