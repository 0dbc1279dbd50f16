//! Muse - 创意应用内嵌的 AI 任务编排核心
//!
//! 模块划分：
//! - **cache**: 带 TTL 的 LRU 响应缓存（键 = 规范化请求 + 快照指纹）
//! - **classifier**: 请求分类（question / simple_task / complex_task / ambiguous）
//! - **clarify**: 歧义检测与澄清问题生成
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、环境快照、后台工作槽、状态投影、共享资源、主控编排器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 会话记忆、实体表与指代消解、对话持久化
//! - **observability**: tracing 初始化
//! - **planner**: 多步计划的生成、审批、执行与持久化
//! - **service**: 外部 AI 服务与执行器的边界（网关、Mock、LLM 适配）
//! - **validation**: 用户输入校验与清洗

pub mod cache;
pub mod classifier;
pub mod clarify;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod service;
pub mod validation;

pub use crate::core::{Orchestrator, OrchestratorBuilder, Snapshot};
