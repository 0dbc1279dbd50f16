//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MUSE__*` 覆盖（双下划线表示嵌套，如 `MUSE__CACHE__TTL_SECS=60`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub classifier: ClassifierSection,
    pub clarification: ClarificationSection,
    pub planner: PlannerSection,
    pub cache: CacheSection,
    pub memory: MemorySection,
    pub orchestrator: OrchestratorSection,
    pub retry: RetrySection,
    pub validation: ValidationSection,
}

impl AppConfig {
    /// 一次网关调用用满重试的最长耗时
    pub fn gateway_budget(&self) -> Duration {
        RetryPolicy::from(&self.retry).budget(Duration::from_secs(self.llm.timeouts.request))
    }

    /// 把短于网关预算的阶段时限抬到预算之上，否则重试永远跑不完；返回是否有调整
    pub fn fit_stage_deadlines(&mut self) -> bool {
        let budget = self.gateway_budget();
        let needed = budget.as_secs() + u64::from(budget.subsec_nanos() > 0);
        let stages = [
            ("classify", &mut self.orchestrator.classify_timeout_secs),
            ("plan", &mut self.orchestrator.plan_timeout_secs),
            ("execute", &mut self.orchestrator.execute_timeout_secs),
        ];
        let mut raised = false;
        for (stage, secs) in stages {
            if *secs < needed {
                tracing::warn!(
                    stage,
                    configured_secs = *secs,
                    budget_secs = needed,
                    "stage deadline shorter than the gateway retry budget, raising it"
                );
                *secs = needed;
                raised = true;
            }
        }
        raised
    }
}

/// [app] 段：应用名、计划持久化目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 计划与对话的落盘目录，未设置时用 ./state
    pub state_dir: Option<PathBuf>,
}

impl AppSection {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("state"))
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    15
}

/// [classifier] 段：置信度阈值（低于阈值强制视为歧义）
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSection {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.6
}

/// [clarification] 段：最多澄清轮数，耗尽后走尽力直接执行
#[derive(Debug, Clone, Deserialize)]
pub struct ClarificationSection {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for ClarificationSection {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

fn default_max_rounds() -> u32 {
    2
}

/// [planner] 段：步骤上限、单步执行超时、是否按关键词把简单任务升级为多步
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub auto_promote: bool,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_secs: default_step_timeout_secs(),
            auto_promote: false,
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_step_timeout_secs() -> u64 {
    60
}

/// [cache] 段：容量（LRU）与 TTL
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    128
}

fn default_cache_ttl_secs() -> u64 {
    300
}

/// [memory] 段：对话轮数上限、实体表容量
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_entity_capacity")]
    pub entity_capacity: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            entity_capacity: default_entity_capacity(),
        }
    }
}

fn default_max_turns() -> usize {
    50
}

fn default_entity_capacity() -> usize {
    64
}

/// [orchestrator] 段：轮询间隔与各阶段后台调用的最长时间
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
    #[serde(default = "default_plan_timeout_secs")]
    pub plan_timeout_secs: u64,
    #[serde(default = "default_execute_timeout_secs")]
    pub execute_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            classify_timeout_secs: default_classify_timeout_secs(),
            plan_timeout_secs: default_plan_timeout_secs(),
            execute_timeout_secs: default_execute_timeout_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_classify_timeout_secs() -> u64 {
    50
}

fn default_plan_timeout_secs() -> u64 {
    60
}

fn default_execute_timeout_secs() -> u64 {
    90
}

/// [retry] 段：ServiceUnavailable 的退避重试
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    4000
}

/// [validation] 段：用户输入长度上限
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationSection {
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            max_input_length: default_max_input_length(),
        }
    }
}

fn default_max_input_length() -> usize {
    5000
}

/// 从 config 目录加载配置，环境变量 MUSE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MUSE__*（双下划线表示嵌套键）
/// 4. 阶段时限不足以跑完网关重试时自动抬高
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MUSE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    cfg.fit_stage_deadlines();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.classifier.confidence_threshold, 0.6);
        assert_eq!(cfg.clarification.max_rounds, 2);
        assert_eq!(cfg.cache.ttl_secs, 300);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.validation.max_input_length, 5000);
        assert!(!cfg.planner.auto_promote);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("muse.toml");
        std::fs::write(
            &path,
            "[cache]\ncapacity = 8\nttl_secs = 5\n\n[planner]\nmax_steps = 4\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.cache.capacity, 8);
        assert_eq!(cfg.cache.ttl_secs, 5);
        assert_eq!(cfg.planner.max_steps, 4);
        assert_eq!(cfg.planner.step_timeout_secs, 60);
    }

    #[test]
    fn test_default_stage_deadlines_cover_gateway_budget() {
        let mut defaults = AppConfig::default();
        assert!(!defaults.fit_stage_deadlines());

        let shipped = load_config(None).unwrap();
        let budget = shipped.gateway_budget();
        for secs in [
            shipped.orchestrator.classify_timeout_secs,
            shipped.orchestrator.plan_timeout_secs,
            shipped.orchestrator.execute_timeout_secs,
        ] {
            assert!(Duration::from_secs(secs) >= budget, "{}s < {:?}", secs, budget);
        }
    }

    #[test]
    fn test_short_stage_deadline_is_raised_to_budget() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("muse.toml");
        std::fs::write(
            &path,
            "[llm.timeouts]\nrequest = 20\n\n[orchestrator]\nclassify_timeout_secs = 5\nexecute_timeout_secs = 300\n\n[retry]\nmax_attempts = 2\nbase_delay_ms = 500\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.gateway_budget(), Duration::from_millis(40_500));
        assert_eq!(cfg.orchestrator.classify_timeout_secs, 41);
        assert_eq!(cfg.orchestrator.execute_timeout_secs, 300);
    }
}
