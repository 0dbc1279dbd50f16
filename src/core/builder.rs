//! 编排器构建器：统一的初始化逻辑
//!
//! 交互式驱动、测试与宿主插件共用同一套装配：共享资源、AI 服务、执行器、持久化。

use std::sync::Arc;

use anyhow::Context;

use crate::config::AppConfig;
use crate::core::orchestrator::{create_llm_from_config, Orchestrator};
use crate::core::services::{self, Services};
use crate::llm::LlmClient;
use crate::service::{ActionExecutor, AiService, DryRunExecutor, LlmAiService};

pub struct OrchestratorBuilder {
    config: AppConfig,
    service: Option<Arc<dyn AiService>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    services: Option<Arc<Services>>,
    persistence: bool,
    register_global: bool,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            service: None,
            executor: None,
            services: None,
            persistence: false,
            register_global: false,
        }
    }

    /// 指定 AI 服务；默认按配置选择 LLM 并包装为 LlmAiService
    pub fn with_service(mut self, service: Arc<dyn AiService>) -> Self {
        self.service = Some(service);
        self
    }

    /// 指定执行器；默认 DryRunExecutor
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 复用已有的共享资源（多个编排器共享同一注册表与缓存）
    pub fn with_services(mut self, services: Arc<Services>) -> Self {
        self.services = Some(services);
        self
    }

    /// 启用 state_dir 下的计划与对话持久化
    pub fn with_persistence(mut self, enable: bool) -> Self {
        self.persistence = enable;
        self
    }

    /// 同时把共享资源注册为进程级全局实例
    pub fn register_global(mut self, enable: bool) -> Self {
        self.register_global = enable;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        create_llm_from_config(&self.config)
    }

    pub async fn build(self) -> anyhow::Result<Orchestrator> {
        let services = match self.services {
            Some(s) => s,
            None if self.register_global => services::init(self.config.clone()),
            None => Arc::new(Services::new(self.config.clone())),
        };
        let service = match self.service {
            Some(s) => s,
            None => Arc::new(LlmAiService::new(create_llm_from_config(&self.config))),
        };
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(DryRunExecutor));

        let mut orchestrator = Orchestrator::new(services.clone(), service, executor);
        if self.persistence {
            let dir = services.state_dir();
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create state dir {}", dir.display()))?;
            orchestrator = orchestrator.with_plan_store(services.plan_store());
            let plans = orchestrator
                .planner()
                .load_persisted()
                .await
                .context("load persisted plans")?;
            match services.load_conversation().await {
                Ok(turns) => tracing::info!(plans, turns, "session state restored"),
                Err(e) => tracing::warn!("Failed to restore conversation: {:#}", e),
            }
        }
        Ok(orchestrator)
    }
}
