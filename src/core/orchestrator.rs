//! 交互编排器：主控状态机
//!
//! 每次用户输入经过：校验 → 指代消解（对话记忆）→ 分类（带缓存）→
//! 澄清 / 规划 / 直接执行。所有 AI 调用与执行都在后台工作槽中进行，
//! 前台通过 poll / wait 取回结果并推进阶段；同一会话同时最多一个在途任务。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clarify::{ClarificationRequest, ClarificationResolver};
use crate::classifier::{Classification, TaskClassifier, TaskKind};
use crate::config::{load_config, AppConfig, OrchestratorSection};
use crate::core::services::Services;
use crate::core::worker::{WorkerPoll, WorkerSlot};
use crate::core::{
    CoreError, Outcome, Phase, RecoveryEngine, Result, RetryPolicy, SessionView, Snapshot, Stage,
};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::ConversationTurn;
use crate::planner::{Plan, PlanReceipt, PlanStatus, PlanStore, Planner};
use crate::service::{
    ActionExecutor, ActionPayload, AiMode, AiRequest, AiService, ExecutionReport, ServiceGateway,
};
use crate::validation::InputValidator;

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub(crate) fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::new());
    }
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::deepseek(Some(&cfg.llm.model)))
    } else if use_openai {
        tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}

/// 后台任务的产出
#[derive(Debug)]
enum JobResult {
    Classified(Classification),
    Clarification(Option<ClarificationRequest>),
    Answer(String),
    Executed(ExecutionReport),
    PlanCreated(Plan),
    PlanRun(Plan),
}

/// 正在处理中的一条请求
#[derive(Debug, Clone)]
struct PendingRequest {
    /// 指代消解后的文本（送往分类/规划/执行）
    effective: String,
    snapshot: Arc<Snapshot>,
    /// 已经问过的澄清轮数
    round: u32,
    /// 没能消解的指代词
    unresolved: Vec<String>,
    context: Option<String>,
    classification: Option<Classification>,
}

pub struct Orchestrator {
    services: Arc<Services>,
    settings: OrchestratorSection,
    validator: InputValidator,
    classifier: TaskClassifier,
    clarifier: ClarificationResolver,
    planner: Planner,
    gateway: ServiceGateway,
    executor: Arc<dyn ActionExecutor>,
    recovery: RecoveryEngine,
    worker: WorkerSlot<JobResult>,
    phase: Phase,
    pending: Option<PendingRequest>,
    clarification: Option<ClarificationRequest>,
    active_plan: Option<String>,
}

impl Orchestrator {
    pub fn new(
        services: Arc<Services>,
        service: Arc<dyn AiService>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let cfg = services.config().clone();
        let recovery = RecoveryEngine::new(RetryPolicy::from(&cfg.retry));
        let gateway = ServiceGateway::new(
            service,
            services.cache.clone(),
            recovery.clone(),
            Duration::from_secs(cfg.llm.timeouts.request),
        );
        let planner = Planner::new(
            gateway.clone(),
            executor.clone(),
            services.registry.clone(),
            recovery.clone(),
            &cfg.planner,
        );
        Self {
            validator: InputValidator::from_config(&cfg.validation),
            classifier: TaskClassifier::from_config(gateway.clone(), &cfg),
            clarifier: ClarificationResolver::from_config(gateway.clone(), &cfg.clarification),
            settings: cfg.orchestrator,
            planner,
            gateway,
            executor,
            recovery,
            services,
            worker: WorkerSlot::new(),
            phase: Phase::Idle,
            pending: None,
            clarification: None,
            active_plan: None,
        }
    }

    /// 计划每次状态变化后写入 store
    pub fn with_plan_store(mut self, store: PlanStore) -> Self {
        self.planner = self.planner.with_store(store);
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn pending_clarification(&self) -> Option<&ClarificationRequest> {
        self.clarification.as_ref()
    }

    /// 最近一次生成或正在执行的计划
    pub fn active_plan(&self) -> Option<&str> {
        self.active_plan.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.worker.is_busy()
    }

    /// 提交一条用户输入；立即返回，阶段进入 polling
    pub async fn submit(&mut self, input: &str, snapshot: Snapshot) -> Result<()> {
        if self.worker.is_busy() {
            return Err(CoreError::Busy);
        }
        let validated = match self.validator.validate(input) {
            Ok(v) => v,
            Err(e) => {
                self.set_error(&e);
                return Err(e);
            }
        };
        let snapshot = Arc::new(snapshot);

        let (resolution, context) = {
            let mut memory = self.services.memory.lock().await;
            let resolution = memory.rewrite_references_in_scene(&validated.text, &snapshot);
            let context = memory.context_summary();
            memory.record_in_scene(ConversationTurn::user(validated.text.clone()), &snapshot);
            for (_, entity) in &resolution.resolved {
                memory.note_reference(entity);
            }
            (resolution, context)
        };
        if resolution.changed() {
            tracing::info!(
                original = %validated.text,
                rewritten = %resolution.text,
                "references resolved"
            );
        }

        self.clarification = None;
        self.pending = Some(PendingRequest {
            effective: resolution.text,
            snapshot,
            round: 0,
            unresolved: resolution.unresolved,
            context: (!context.is_empty()).then_some(context),
            classification: None,
        });
        self.dispatch_classify()
    }

    /// 回答待处理的澄清问题；原请求与回答合并后重新分类
    pub async fn answer_clarification(&mut self, answer: &str, snapshot: Snapshot) -> Result<()> {
        if self.worker.is_busy() {
            return Err(CoreError::Busy);
        }
        let Some(request) = self.clarification.clone() else {
            return Err(CoreError::InvalidInput("no clarification is pending".into()));
        };
        let validated = self.validator.validate(answer)?;
        let snapshot = Arc::new(snapshot);
        let text = ClarificationResolver::answer(&request, &validated.text);

        let context = {
            let mut memory = self.services.memory.lock().await;
            memory.record_in_scene(ConversationTurn::user(validated.text), &snapshot);
            memory.context_summary()
        };
        self.clarification = None;
        self.pending = Some(PendingRequest {
            effective: text,
            snapshot,
            round: request.round,
            unresolved: Vec::new(),
            context: (!context.is_empty()).then_some(context),
            classification: None,
        });
        self.dispatch_classify()
    }

    /// 在后台执行已批准的计划
    pub async fn execute_plan(&mut self, plan_id: &str, snapshot: Snapshot) -> Result<()> {
        if self.worker.is_busy() {
            return Err(CoreError::Busy);
        }
        let plan = self
            .planner
            .get(plan_id)
            .await
            .ok_or_else(|| CoreError::PlanNotFound(plan_id.to_string()))?;
        if !matches!(plan.status, PlanStatus::Approved | PlanStatus::Executing) {
            return Err(CoreError::invalid_transition(plan_id, plan.status, "execute"));
        }

        let steps = plan.steps.len().max(1) as u32;
        let deadline = Duration::from_secs(self.settings.execute_timeout_secs).saturating_mul(steps);
        let planner = self.planner.clone();
        let id = plan_id.to_string();
        let snapshot = Arc::new(snapshot);
        self.worker.dispatch("execute_plan", deadline, move |token| async move {
            planner
                .execute_all(&id, snapshot, token)
                .await
                .map(JobResult::PlanRun)
        })?;
        self.active_plan = Some(plan_id.to_string());
        self.enter(Stage::ExecutingPlan);
        Ok(())
    }

    pub async fn approve_plan(&mut self, plan_id: &str) -> Result<PlanReceipt> {
        let plan = self.planner.approve(plan_id).await?;
        Ok(PlanReceipt::new(plan))
    }

    pub async fn reject_plan(&mut self, plan_id: &str) -> Result<PlanReceipt> {
        let plan = self.planner.reject(plan_id).await?;
        if self.active_plan.as_deref() == Some(plan_id) {
            self.active_plan = None;
        }
        Ok(PlanReceipt::new(plan))
    }

    /// 取消计划；若它正在后台执行，同时分离工作槽
    pub async fn cancel_plan(&mut self, plan_id: &str) -> Result<PlanReceipt> {
        if self.active_plan.as_deref() == Some(plan_id)
            && self.phase == (Phase::Polling { stage: Stage::ExecutingPlan })
        {
            self.worker.cancel();
            self.settle(Outcome::Cancelled).await;
        }
        let plan = self.planner.cancel(plan_id).await?;
        if self.active_plan.as_deref() == Some(plan_id) {
            self.active_plan = None;
        }
        Ok(PlanReceipt::new(plan))
    }

    /// 取消在途任务；正在执行的计划被标记为 cancelled。没有在途任务时返回 false
    pub async fn cancel(&mut self) -> bool {
        if !self.worker.cancel() {
            return false;
        }
        if self.phase == (Phase::Polling { stage: Stage::ExecutingPlan }) {
            if let Some(id) = self.active_plan.take() {
                self.cancel_plan_quietly(&id).await;
            }
        }
        self.pending = None;
        self.settle(Outcome::Cancelled).await;
        true
    }

    /// 非阻塞地检查后台结果并推进阶段
    pub async fn poll(&mut self) -> &Phase {
        match self.worker.poll() {
            WorkerPoll::Idle | WorkerPoll::Pending => {}
            WorkerPoll::TimedOut { label, after } => {
                if self.phase == (Phase::Polling { stage: Stage::ExecutingPlan }) {
                    if let Some(id) = self.active_plan.take() {
                        self.cancel_plan_quietly(&id).await;
                    }
                }
                self.pending = None;
                self.set_error(&CoreError::timeout(label, after));
            }
            WorkerPoll::Ready(Ok(result)) => {
                if let Err(e) = self.on_result(result).await {
                    self.pending = None;
                    self.set_error(&e);
                }
            }
            WorkerPoll::Ready(Err(e)) => {
                if self.phase == (Phase::Polling { stage: Stage::ExecutingPlan }) {
                    self.active_plan = None;
                }
                self.pending = None;
                self.set_error(&e);
            }
        }
        &self.phase
    }

    /// 按 poll_interval_ms 轮询直到离开 polling
    pub async fn wait(&mut self) -> &Phase {
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        loop {
            self.poll().await;
            if self.phase.is_settled() {
                return &self.phase;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// 丢弃在途任务与未完成的交互，回到 idle；对话记忆保留
    pub fn reset(&mut self) {
        self.worker.cancel();
        self.phase = Phase::Idle;
        self.pending = None;
        self.clarification = None;
        self.active_plan = None;
    }

    pub async fn view(&self) -> SessionView {
        let history = self.services.memory.lock().await.turns().cloned().collect();
        let error_message = match &self.phase {
            Phase::Errored { message, .. } => Some(message.clone()),
            _ => None,
        };
        SessionView {
            phase: self.phase.clone(),
            history,
            input_locked: self.worker.is_busy(),
            error_message,
            pending_clarification: self.clarification.as_ref().map(|c| c.prompt()),
            active_plan: self.active_plan.clone(),
        }
    }

    async fn on_result(&mut self, result: JobResult) -> Result<()> {
        match result {
            JobResult::Classified(classification) => self.route(classification),
            JobResult::Clarification(Some(request)) => {
                self.clarification = Some(request.clone());
                self.settle(Outcome::ClarificationNeeded { request }).await;
                Ok(())
            }
            JobResult::Clarification(None) => {
                let kind = self
                    .pending
                    .as_ref()
                    .and_then(|p| p.classification.as_ref())
                    .map(|c| c.kind)
                    .unwrap_or(TaskKind::SimpleTask);
                self.dispatch_task(kind)
            }
            JobResult::Answer(text) => {
                self.pending = None;
                self.settle(Outcome::Answered { text }).await;
                Ok(())
            }
            JobResult::Executed(report) => {
                self.pending = None;
                self.settle(Outcome::Executed { report }).await;
                Ok(())
            }
            JobResult::PlanCreated(plan) => {
                self.pending = None;
                self.active_plan = Some(plan.id.clone());
                self.settle(Outcome::PlanProposed { plan }).await;
                Ok(())
            }
            JobResult::PlanRun(plan) => {
                self.active_plan = None;
                self.settle(Outcome::PlanFinished { plan }).await;
                Ok(())
            }
        }
    }

    /// 分类之后的分流
    fn route(&mut self, classification: Classification) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| CoreError::Cancelled("request was discarded".into()))?;
        let kind = classification.kind;
        let reasoning = classification.reasoning.clone();
        pending.classification = Some(classification);
        let round = pending.round;
        let unresolved = pending.unresolved.clone();

        if !unresolved.is_empty() && self.clarifier.can_ask(round) {
            return self.dispatch_clarify(Some(format!(
                "unresolved reference: {}",
                unresolved.join(", ")
            )));
        }
        if kind == TaskKind::Ambiguous {
            if self.clarifier.can_ask(round) {
                return self.dispatch_clarify(Some(reasoning));
            }
            tracing::warn!(
                rounds = round,
                "clarification rounds exhausted, executing best effort"
            );
        }
        self.dispatch_task(kind)
    }

    fn dispatch_classify(&mut self) -> Result<()> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| CoreError::InvalidInput("nothing to classify".into()))?;
        let classifier = self.classifier.clone();
        let text = pending.effective.clone();
        let snapshot = pending.snapshot.clone();
        let context = pending.context.clone();
        let timeout = Duration::from_secs(self.settings.classify_timeout_secs);
        self.worker.dispatch("classify", timeout, move |_| async move {
            classifier
                .classify(&text, snapshot, context)
                .await
                .map(JobResult::Classified)
        })?;
        self.enter(Stage::Classifying);
        Ok(())
    }

    fn dispatch_clarify(&mut self, reported: Option<String>) -> Result<()> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| CoreError::InvalidInput("nothing to clarify".into()))?;
        let clarifier = self.clarifier.clone();
        let text = pending.effective.clone();
        let snapshot = pending.snapshot.clone();
        let round = pending.round + 1;
        let timeout = Duration::from_secs(self.settings.classify_timeout_secs);
        self.worker.dispatch("clarify", timeout, move |_| async move {
            clarifier
                .resolve(&text, snapshot, round, reported)
                .await
                .map(JobResult::Clarification)
        })?;
        self.enter(Stage::Clarifying);
        Ok(())
    }

    /// question → 直接回答；simple/ambiguous → 交给执行器；complex → 生成计划
    fn dispatch_task(&mut self, kind: TaskKind) -> Result<()> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| CoreError::InvalidInput("nothing to execute".into()))?;
        let text = pending.effective.clone();
        let snapshot = pending.snapshot.clone();
        let context = pending.context.clone();

        match kind {
            TaskKind::Question => {
                let gateway = self.gateway.clone();
                let timeout = Duration::from_secs(self.settings.execute_timeout_secs);
                self.worker.dispatch("respond", timeout, move |_| async move {
                    let mut request = AiRequest::new(AiMode::Respond, text, snapshot);
                    if let Some(ctx) = context {
                        request = request.with_context(ctx);
                    }
                    let value = gateway.request(&request).await?;
                    value
                        .get("answer")
                        .and_then(|a| a.as_str())
                        .map(|a| JobResult::Answer(a.to_string()))
                        .ok_or_else(|| {
                            CoreError::MalformedResponse("respond: missing 'answer'".into())
                        })
                })?;
                self.enter(Stage::DirectExecuting);
            }
            TaskKind::SimpleTask | TaskKind::Ambiguous => {
                let executor = self.executor.clone();
                let recovery = self.recovery.clone();
                let timeout = Duration::from_secs(self.settings.execute_timeout_secs);
                self.worker.dispatch("execute", timeout, move |_| async move {
                    let payload = ActionPayload::task(text);
                    let report = recovery
                        .run("execute", || executor.execute(&payload, &snapshot))
                        .await?;
                    tracing::info!(
                        success = report.success,
                        action = %payload.preview(),
                        "direct execution finished"
                    );
                    Ok(JobResult::Executed(report))
                })?;
                self.enter(Stage::DirectExecuting);
            }
            TaskKind::ComplexTask => {
                let planner = self.planner.clone();
                let timeout = Duration::from_secs(self.settings.plan_timeout_secs);
                self.worker.dispatch("plan", timeout, move |_| async move {
                    planner
                        .create_plan(&text, snapshot, context)
                        .await
                        .map(JobResult::PlanCreated)
                })?;
                self.enter(Stage::Planning);
            }
        }
        Ok(())
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(stage = stage.as_str(), "orchestrator polling");
        self.phase = Phase::Polling { stage };
    }

    /// 进入 done，并把结果作为助手回复写入对话记忆
    async fn settle(&mut self, outcome: Outcome) {
        let reply = outcome.summary();
        self.services
            .memory
            .lock()
            .await
            .record(ConversationTurn::assistant(reply));
        self.phase = Phase::Done { outcome };
    }

    fn set_error(&mut self, e: &CoreError) {
        tracing::warn!(kind = ?e.kind(), error = %e, "interaction failed");
        self.phase = Phase::Errored {
            kind: e.kind(),
            message: e.to_string(),
        };
    }

    async fn cancel_plan_quietly(&self, plan_id: &str) {
        if let Err(e) = self.planner.cancel(plan_id).await {
            tracing::debug!(plan_id, error = %e, "plan not cancelled");
        }
    }
}

/// 从配置文件创建编排器（AI 服务基于配置选出的 LLM，执行器为 dry run）
pub async fn create_orchestrator(config_path: Option<PathBuf>) -> anyhow::Result<Orchestrator> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    crate::core::OrchestratorBuilder::new(cfg)
        .with_persistence(true)
        .build()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::core::SceneObject;
    use crate::service::{MockAiService, MockExecutor};

    fn fast_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.orchestrator.poll_interval_ms = 5;
        cfg.retry.max_attempts = 1;
        cfg
    }

    fn orchestrator(
        service: Arc<MockAiService>,
        executor: Arc<MockExecutor>,
        cfg: AppConfig,
    ) -> Orchestrator {
        Orchestrator::new(Arc::new(Services::new(cfg)), service, executor)
    }

    fn scene() -> Snapshot {
        Snapshot::empty()
            .with_object(SceneObject::new("cube", "mesh"))
            .with_object(SceneObject::new("sphere", "mesh"))
    }

    #[tokio::test]
    async fn test_question_is_answered() {
        let service = Arc::new(MockAiService::new());
        let mut orch = orchestrator(service.clone(), Arc::new(MockExecutor::new()), fast_config());
        orch.submit("what is a material?", scene()).await.unwrap();
        assert!(orch.phase().is_polling());
        match orch.wait().await {
            Phase::Done {
                outcome: Outcome::Answered { text },
            } => assert!(text.contains("what is a material?")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(service.calls(AiMode::Respond).await, 1);
        let view = orch.view().await;
        assert_eq!(view.history.len(), 2);
        assert!(!view.input_locked);
    }

    #[tokio::test]
    async fn test_simple_task_goes_to_executor() {
        let executor = Arc::new(MockExecutor::new());
        let mut orch = orchestrator(Arc::new(MockAiService::new()), executor.clone(), fast_config());
        orch.submit("make the cube red", scene()).await.unwrap();
        match orch.wait().await {
            Phase::Done {
                outcome: Outcome::Executed { report },
            } => assert!(report.success),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(executor.executed_texts().await, vec!["make the cube red"]);
    }

    #[tokio::test]
    async fn test_complex_task_proposes_plan() {
        let mut orch = orchestrator(
            Arc::new(MockAiService::new()),
            Arc::new(MockExecutor::new()),
            fast_config(),
        );
        orch.submit("create a room with a table and two chairs", scene())
            .await
            .unwrap();
        let plan_id = match orch.wait().await {
            Phase::Done {
                outcome: Outcome::PlanProposed { plan },
            } => {
                assert_eq!(plan.status, PlanStatus::AwaitingApproval);
                plan.id.clone()
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(orch.active_plan(), Some(plan_id.as_str()));

        let receipt = orch.approve_plan(&plan_id).await.unwrap();
        assert!(receipt.confirms(&plan_id));
        orch.execute_plan(&plan_id, scene()).await.unwrap();
        match orch.wait().await {
            Phase::Done {
                outcome: Outcome::PlanFinished { plan },
            } => assert_eq!(plan.status, PlanStatus::Completed),
            other => panic!("unexpected {:?}", other),
        }
        assert!(orch.active_plan().is_none());
    }

    #[tokio::test]
    async fn test_execute_unapproved_plan_is_rejected() {
        let mut orch = orchestrator(
            Arc::new(MockAiService::new()),
            Arc::new(MockExecutor::new()),
            fast_config(),
        );
        orch.submit("create a room with a table and a lamp", scene())
            .await
            .unwrap();
        orch.wait().await;
        let plan_id = orch.active_plan().unwrap().to_string();
        let err = orch.execute_plan(&plan_id, scene()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        let err = orch.execute_plan("plan_missing", scene()).await.unwrap_err();
        assert!(matches!(err, CoreError::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn test_low_confidence_asks_then_answer_reclassifies() {
        let service = Arc::new(
            MockAiService::new().with_response(
                AiMode::Clarify,
                json!({"interpretations": ["scale up"], "questions": ["How much bigger?"]}),
            ),
        );
        service
            .push_response(
                AiMode::Classify,
                json!({"kind": "simple_task", "confidence": 0.4, "reasoning": "unsure"}),
            )
            .await;
        let executor = Arc::new(MockExecutor::new());
        let mut orch = orchestrator(service.clone(), executor.clone(), fast_config());

        orch.submit("make the cube bigger", scene()).await.unwrap();
        match orch.wait().await {
            Phase::Done {
                outcome: Outcome::ClarificationNeeded { request },
            } => {
                assert_eq!(request.round, 1);
                assert_eq!(request.questions, vec!["How much bigger?"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(orch.pending_clarification().is_some());

        orch.answer_clarification("twice as big", scene()).await.unwrap();
        orch.wait().await;
        assert_eq!(
            executor.executed_texts().await,
            vec!["make the cube bigger\n\nClarification: twice as big"]
        );
        assert!(orch.pending_clarification().is_none());
    }

    #[tokio::test]
    async fn test_answer_without_pending_clarification() {
        let mut orch = orchestrator(
            Arc::new(MockAiService::new()),
            Arc::new(MockExecutor::new()),
            fast_config(),
        );
        let err = orch.answer_clarification("red", scene()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_exhausted_rounds_fall_back_to_execution() {
        let mut cfg = fast_config();
        cfg.clarification.max_rounds = 0;
        let service = Arc::new(MockAiService::new().with_response(
            AiMode::Classify,
            json!({"kind": "ambiguous", "confidence": 0.9, "reasoning": "which one"}),
        ));
        let executor = Arc::new(MockExecutor::new());
        let mut orch = orchestrator(service.clone(), executor.clone(), cfg);
        orch.submit("paint the thing", scene()).await.unwrap();
        match orch.wait().await {
            Phase::Done {
                outcome: Outcome::Executed { .. },
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(service.calls(AiMode::Clarify).await, 0);
    }

    #[tokio::test]
    async fn test_invalid_input_sets_errored() {
        let mut orch = orchestrator(
            Arc::new(MockAiService::new()),
            Arc::new(MockExecutor::new()),
            fast_config(),
        );
        let err = orch.submit("   ", scene()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert!(matches!(
            orch.phase(),
            Phase::Errored {
                kind: crate::core::ErrorKind::InvalidInput,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_service_error_is_surfaced() {
        let service = Arc::new(MockAiService::new());
        service
            .push_error(
                AiMode::Classify,
                CoreError::ServiceUnavailable("offline".into()),
            )
            .await;
        let mut orch = orchestrator(service, Arc::new(MockExecutor::new()), fast_config());
        orch.submit("make the cube red", scene()).await.unwrap();
        match orch.wait().await {
            Phase::Errored { kind, .. } => {
                assert_eq!(*kind, crate::core::ErrorKind::ServiceUnavailable)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!orch.is_busy());
    }

    #[tokio::test]
    async fn test_classify_deadline_is_timeout() {
        let mut cfg = fast_config();
        cfg.orchestrator.classify_timeout_secs = 0;
        let service = Arc::new(MockAiService::new().with_delay(Duration::from_millis(200)));
        let mut orch = orchestrator(service, Arc::new(MockExecutor::new()), cfg);
        orch.submit("make the cube red", scene()).await.unwrap();
        match orch.wait().await {
            Phase::Errored { kind, .. } => assert_eq!(*kind, crate::core::ErrorKind::Timeout),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let service = Arc::new(MockAiService::new().with_delay(Duration::from_millis(200)));
        let mut orch = orchestrator(service, Arc::new(MockExecutor::new()), fast_config());
        orch.submit("make the cube red", scene()).await.unwrap();
        orch.reset();
        assert_eq!(*orch.phase(), Phase::Idle);
        assert!(!orch.is_busy());
        assert!(matches!(orch.poll().await, Phase::Idle));
    }
}
