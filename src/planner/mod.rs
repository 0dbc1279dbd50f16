//! 多步规划器：生成计划、审批、逐步执行
//!
//! 状态机：draft → awaiting_approval → approved → executing → completed / failed；
//! awaiting_approval 可被 reject；任何非终态都可被 cancel。
//! advance 每次执行一个步骤：注册表锁只在读写计划时持有，执行器调用期间不持锁；
//! 执行结束后按 id 重新查找计划，若计划已进入终态（如被取消）则丢弃该结果。
//! 不做回滚：失败只向后传播（依赖失败的步骤被跳过，必需步骤失败则计划失败）。

pub mod plan;
pub mod registry;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::PlannerSection;
use crate::core::{CoreError, RecoveryEngine, Result, Snapshot};
use crate::service::{ActionExecutor, ActionPayload, AiMode, AiRequest, ExecutionReport, ServiceGateway};

pub use plan::{new_plan_id, Plan, PlanStatus, Risk, Step, StepStatus};
pub use registry::PlanRegistry;
pub use store::PlanStore;

/// advance 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 执行了一个步骤
    Executed {
        step_index: usize,
        status: StepStatus,
        plan_status: PlanStatus,
    },
    /// 没有可执行的步骤了
    Finished(PlanStatus),
    /// 步骤执行期间计划进入终态，结果被丢弃
    Discarded { step_index: usize },
}

/// 审批操作的回执：回显被操作的计划 id
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReceipt {
    pub plan_id: String,
    pub plan: Plan,
}

impl PlanReceipt {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            plan,
        }
    }

    pub fn confirms(&self, plan_id: &str) -> bool {
        self.plan_id == plan_id && self.plan.id == plan_id
    }

    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlannerStats {
    pub plans: usize,
    pub by_status: BTreeMap<String, usize>,
    pub steps: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
}

enum NextStep {
    Run(usize, ActionPayload),
    Done(PlanStatus),
}

#[derive(Clone)]
pub struct Planner {
    gateway: ServiceGateway,
    executor: Arc<dyn ActionExecutor>,
    registry: Arc<PlanRegistry>,
    recovery: RecoveryEngine,
    max_steps: usize,
    step_timeout: Duration,
    store: Option<PlanStore>,
}

impl Planner {
    pub fn new(
        gateway: ServiceGateway,
        executor: Arc<dyn ActionExecutor>,
        registry: Arc<PlanRegistry>,
        recovery: RecoveryEngine,
        cfg: &PlannerSection,
    ) -> Self {
        Self {
            gateway,
            executor,
            registry,
            recovery,
            max_steps: cfg.max_steps.max(1),
            step_timeout: Duration::from_secs(cfg.step_timeout_secs),
            store: None,
        }
    }

    /// 每次状态变化后把全部计划写入 store
    pub fn with_store(mut self, store: PlanStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<PlanRegistry> {
        &self.registry
    }

    /// 把 store 中的计划装入注册表（非终态已被视为 cancelled）
    pub async fn load_persisted(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let plans = store.load()?;
        let n = plans.len();
        for plan in plans {
            self.registry.insert(plan).await;
        }
        tracing::info!(plans = n, "persisted plans loaded");
        Ok(n)
    }

    /// 请 AI 生成计划草稿，校验后进入 awaiting_approval
    pub async fn create_plan(
        &self,
        text: &str,
        snapshot: Arc<Snapshot>,
        context: Option<String>,
    ) -> Result<Plan> {
        let mut request = AiRequest::new(AiMode::Plan, text, snapshot);
        if let Some(ctx) = context {
            request = request.with_context(ctx);
        }
        let value = self.gateway.request(&request).await?;
        let mut plan = Plan::from_draft(&value, text, self.max_steps)?;
        plan.status = PlanStatus::AwaitingApproval;
        plan.touch();

        tracing::info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            title = %plan.title,
            "plan created, awaiting approval"
        );
        self.registry.insert(plan.clone()).await;
        self.persist().await;
        Ok(plan)
    }

    /// awaiting_approval → approved；已 approved 时原样返回
    pub async fn approve(&self, plan_id: &str) -> Result<Plan> {
        let plan = self
            .registry
            .update(plan_id, |plan| {
                match plan.status {
                    PlanStatus::Approved => {}
                    PlanStatus::AwaitingApproval => {
                        plan.status = PlanStatus::Approved;
                        plan.touch();
                    }
                    other => return Err(CoreError::invalid_transition(&plan.id, other, "approve")),
                }
                Ok(plan.clone())
            })
            .await?;
        tracing::info!(plan_id, "plan approved");
        self.persist().await;
        Ok(plan)
    }

    /// awaiting_approval → rejected；已 rejected 时原样返回
    pub async fn reject(&self, plan_id: &str) -> Result<Plan> {
        let plan = self
            .registry
            .update(plan_id, |plan| {
                match plan.status {
                    PlanStatus::Rejected => {}
                    PlanStatus::AwaitingApproval => {
                        plan.status = PlanStatus::Rejected;
                        plan.touch();
                    }
                    other => return Err(CoreError::invalid_transition(&plan.id, other, "reject")),
                }
                Ok(plan.clone())
            })
            .await?;
        tracing::info!(plan_id, "plan rejected");
        self.persist().await;
        Ok(plan)
    }

    /// 任意非终态 → cancelled，未结束的步骤标为 skipped；已 cancelled 时原样返回
    pub async fn cancel(&self, plan_id: &str) -> Result<Plan> {
        let plan = self
            .registry
            .update(plan_id, |plan| {
                match plan.status {
                    PlanStatus::Cancelled => {}
                    other if other.is_terminal() => {
                        return Err(CoreError::invalid_transition(&plan.id, other, "cancel"))
                    }
                    _ => {
                        plan.status = PlanStatus::Cancelled;
                        plan.skip_unfinished("cancelled");
                        plan.touch();
                    }
                }
                Ok(plan.clone())
            })
            .await?;
        tracing::info!(plan_id, "plan cancelled");
        self.persist().await;
        Ok(plan)
    }

    /// 执行下一个可执行步骤
    pub async fn advance(&self, plan_id: &str, snapshot: Arc<Snapshot>) -> Result<StepOutcome> {
        let next = self
            .registry
            .update(plan_id, |plan| {
                match plan.status {
                    PlanStatus::Completed | PlanStatus::Failed => {
                        return Ok(NextStep::Done(plan.status))
                    }
                    PlanStatus::Approved | PlanStatus::Executing => {}
                    other => return Err(CoreError::invalid_transition(&plan.id, other, "advance")),
                }
                let skipped = plan.skip_blocked();
                if !skipped.is_empty() {
                    tracing::info!(plan_id = %plan.id, ?skipped, "steps skipped, dependency did not succeed");
                }
                match plan.next_runnable() {
                    Some(index) => {
                        plan.status = PlanStatus::Executing;
                        let step = &mut plan.steps[index];
                        step.status = StepStatus::Running;
                        step.error = None;
                        let action = step.action.clone();
                        plan.touch();
                        Ok(NextStep::Run(index, action))
                    }
                    None => {
                        let status = plan.derive_status();
                        plan.touch();
                        Ok(NextStep::Done(status))
                    }
                }
            })
            .await?;

        let (index, action) = match next {
            NextStep::Done(status) => {
                tracing::info!(plan_id, status = %status, "plan finished");
                self.persist().await;
                return Ok(StepOutcome::Finished(status));
            }
            NextStep::Run(index, action) => (index, action),
        };
        self.persist().await;

        let start = Instant::now();
        let result = self.execute_step(index, &action, &snapshot).await;
        let (ok, outcome) = match &result {
            Ok(report) if report.success => (true, "ok"),
            Ok(_) => (false, "failed"),
            Err(CoreError::Timeout { .. }) => (false, "timeout"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "step_audit",
            "plan_id": plan_id,
            "step": index,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "action_preview": action.preview(),
        });
        tracing::info!(audit = %audit, "step");

        let written = self
            .registry
            .update(plan_id, |plan| {
                if plan.status.is_terminal()
                    || plan.steps.get(index).map(|s| s.status) != Some(StepStatus::Running)
                {
                    return Ok(None);
                }
                let step = &mut plan.steps[index];
                let failure = match &result {
                    Ok(report) if report.success => {
                        step.status = StepStatus::Succeeded;
                        step.output = report.output.clone();
                        None
                    }
                    Ok(report) => Some(
                        report
                            .error
                            .clone()
                            .unwrap_or_else(|| "step reported failure".to_string()),
                    ),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(detail) = failure {
                    step.status = if step.required {
                        StepStatus::Failed
                    } else {
                        StepStatus::Skipped
                    };
                    step.error = Some(detail);
                }
                let step_status = step.status;
                plan.skip_blocked();
                let plan_status = plan.derive_status();
                if plan_status == PlanStatus::Failed {
                    plan.skip_unfinished("plan failed");
                }
                plan.touch();
                Ok(Some((step_status, plan_status)))
            })
            .await?;

        let Some((status, plan_status)) = written else {
            tracing::info!(plan_id, step = index, "plan ended while step was running, result discarded");
            return Ok(StepOutcome::Discarded { step_index: index });
        };
        self.persist().await;

        tracing::info!(plan_id, step = index, status = %status, plan_status = %plan_status, "step finished");
        match result {
            Err(e) if plan_status == PlanStatus::Failed => Err(e),
            _ => Ok(StepOutcome::Executed {
                step_index: index,
                status,
                plan_status,
            }),
        }
    }

    /// 连续 advance 直到计划结束或 token 被取消；返回最终计划
    pub async fn execute_all(
        &self,
        plan_id: &str,
        snapshot: Arc<Snapshot>,
        token: CancellationToken,
    ) -> Result<Plan> {
        loop {
            if token.is_cancelled() {
                return Err(CoreError::Cancelled(format!("execution of {}", plan_id)));
            }
            match self.advance(plan_id, snapshot.clone()).await? {
                StepOutcome::Executed { plan_status, .. } if !plan_status.is_terminal() => continue,
                StepOutcome::Discarded { .. } if token.is_cancelled() => {
                    return Err(CoreError::Cancelled(format!("execution of {}", plan_id)))
                }
                _ => break,
            }
        }
        self.registry
            .get(plan_id)
            .await
            .ok_or_else(|| CoreError::PlanNotFound(plan_id.to_string()))
    }

    async fn execute_step(
        &self,
        index: usize,
        action: &ActionPayload,
        snapshot: &Snapshot,
    ) -> Result<ExecutionReport> {
        let timeout = self.step_timeout;
        self.recovery
            .run("execute_step", || {
                let fut = self.executor.execute(action, snapshot);
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(CoreError::timeout(format!("step {}", index), timeout)),
                    }
                }
            })
            .await
    }

    pub async fn get(&self, plan_id: &str) -> Option<Plan> {
        self.registry.get(plan_id).await
    }

    pub async fn list(&self) -> Vec<Plan> {
        self.registry.list().await
    }

    pub async fn preview(&self, plan_id: &str) -> Result<String> {
        self.registry
            .get(plan_id)
            .await
            .map(|p| p.preview())
            .ok_or_else(|| CoreError::PlanNotFound(plan_id.to_string()))
    }

    pub async fn stats(&self) -> PlannerStats {
        let plans = self.registry.list().await;
        let mut stats = PlannerStats {
            plans: plans.len(),
            ..Default::default()
        };
        for plan in &plans {
            *stats.by_status.entry(plan.status.to_string()).or_insert(0) += 1;
            for step in &plan.steps {
                stats.steps += 1;
                match step.status {
                    StepStatus::Succeeded => stats.steps_succeeded += 1,
                    StepStatus::Failed => stats.steps_failed += 1,
                    StepStatus::Skipped => stats.steps_skipped += 1,
                    _ => {}
                }
            }
        }
        stats
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_latest(self.registry.list()).await {
            tracing::warn!("Failed to persist plans: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::cache::ResponseCache;
    use crate::config::PlannerSection;
    use crate::core::RetryPolicy;
    use crate::service::{MockAiService, MockExecutor};

    fn planner_with(service: Arc<MockAiService>, executor: Arc<MockExecutor>) -> Planner {
        let recovery = RecoveryEngine::new(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        });
        let gateway = ServiceGateway::new(
            service,
            Arc::new(Mutex::new(ResponseCache::new(4, Duration::from_secs(60)))),
            recovery.clone(),
            Duration::from_secs(1),
        );
        Planner::new(
            gateway,
            executor,
            Arc::new(PlanRegistry::new()),
            recovery,
            &PlannerSection::default(),
        )
    }

    fn three_steps() -> serde_json::Value {
        json!({"title": "Room", "steps": [
            {"description": "walls", "action": {"type": "task", "text": "walls"}},
            {"description": "floor", "action": {"type": "task", "text": "floor"}, "depends_on": [0]},
            {"description": "lamp", "action": {"type": "task", "text": "lamp"}, "depends_on": [1]},
        ]})
    }

    fn snap() -> Arc<Snapshot> {
        Arc::new(Snapshot::empty())
    }

    #[tokio::test]
    async fn test_create_plan_awaits_approval() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let planner = planner_with(service, Arc::new(MockExecutor::new()));
        let plan = planner.create_plan("build a room", snap(), None).await.unwrap();
        assert_eq!(plan.status, PlanStatus::AwaitingApproval);
        assert_eq!(planner.get(&plan.id).await.unwrap().steps.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_plan_is_not_stored() {
        let service = Arc::new(MockAiService::new().with_response(
            AiMode::Plan,
            json!({"steps": [{"description": "a"}, {"description": "b", "depends_on": [2]}, {"description": "c"}]}),
        ));
        let planner = planner_with(service, Arc::new(MockExecutor::new()));
        let err = planner.create_plan("x", snap(), None).await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedPlan(_)));
        assert!(planner.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_approve_is_idempotent_and_reject_after_approve_fails() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let planner = planner_with(service, Arc::new(MockExecutor::new()));
        let plan = planner.create_plan("room", snap(), None).await.unwrap();

        let first = planner.approve(&plan.id).await.unwrap();
        let second = planner.approve(&plan.id).await.unwrap();
        assert_eq!(first.status, PlanStatus::Approved);
        assert_eq!(second.status, PlanStatus::Approved);

        let err = planner.reject(&plan.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_reject_then_approve_is_invalid() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let planner = planner_with(service, Arc::new(MockExecutor::new()));
        let plan = planner.create_plan("room", snap(), None).await.unwrap();
        planner.reject(&plan.id).await.unwrap();
        assert_eq!(planner.reject(&plan.id).await.unwrap().status, PlanStatus::Rejected);
        assert!(planner.approve(&plan.id).await.is_err());
        assert!(planner.advance(&plan.id, snap()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_plan_is_not_found() {
        let planner = planner_with(Arc::new(MockAiService::new()), Arc::new(MockExecutor::new()));
        assert!(matches!(
            planner.approve("plan_nope").await,
            Err(CoreError::PlanNotFound(_))
        ));
        assert!(matches!(
            planner.advance("plan_nope", snap()).await,
            Err(CoreError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_advance_runs_steps_in_order_to_completion() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let executor = Arc::new(MockExecutor::new());
        let planner = planner_with(service, executor.clone());
        let plan = planner.create_plan("room", snap(), None).await.unwrap();

        assert!(planner.advance(&plan.id, snap()).await.is_err());
        planner.approve(&plan.id).await.unwrap();

        let done = planner
            .execute_all(&plan.id, snap(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, PlanStatus::Completed);
        assert_eq!(executor.executed_texts().await, vec!["walls", "floor", "lamp"]);
        assert_eq!(
            planner.advance(&plan.id, snap()).await.unwrap(),
            StepOutcome::Finished(PlanStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_required_failure_fails_plan_without_rollback() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let executor = Arc::new(MockExecutor::new().fail_on("floor"));
        let planner = planner_with(service, executor.clone());
        let plan = planner.create_plan("room", snap(), None).await.unwrap();
        planner.approve(&plan.id).await.unwrap();

        planner.advance(&plan.id, snap()).await.unwrap();
        let outcome = planner.advance(&plan.id, snap()).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Executed {
                step_index: 1,
                status: StepStatus::Failed,
                plan_status: PlanStatus::Failed
            }
        );
        let plan = planner.get(&plan.id).await.unwrap();
        assert_eq!(plan.steps[0].status, StepStatus::Succeeded);
        assert_eq!(plan.steps[2].status, StepStatus::Skipped);
        assert_eq!(executor.executed_texts().await, vec!["walls", "floor"]);
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped_and_dependents_skip() {
        let service = Arc::new(MockAiService::new().with_response(
            AiMode::Plan,
            json!({"steps": [
                {"description": "walls"},
                {"description": "fancy trim", "required": false},
                {"description": "paint trim", "depends_on": [1], "required": false},
                {"description": "lamp"},
            ]}),
        ));
        let executor = Arc::new(MockExecutor::new().fail_on("fancy"));
        let planner = planner_with(service, executor.clone());
        let plan = planner.create_plan("room", snap(), None).await.unwrap();
        planner.approve(&plan.id).await.unwrap();

        let done = planner
            .execute_all(&plan.id, snap(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, PlanStatus::Completed);
        assert_eq!(done.steps[1].status, StepStatus::Skipped);
        assert!(done.steps[1].error.as_deref().unwrap().contains("mock failure"));
        assert_eq!(done.steps[2].status, StepStatus::Skipped);
        assert_eq!(executor.executed_texts().await, vec!["walls", "fancy trim", "lamp"]);
    }

    #[tokio::test]
    async fn test_executor_timeout_fails_plan() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(200)));
        let planner =
            planner_with(service, executor).with_step_timeout(Duration::from_millis(20));
        let plan = planner.create_plan("room", snap(), None).await.unwrap();
        planner.approve(&plan.id).await.unwrap();

        let err = planner.advance(&plan.id, snap()).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        let plan = planner.get(&plan.id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_during_step_discards_result() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(50)));
        let planner = planner_with(service, executor);
        let plan = planner.create_plan("room", snap(), None).await.unwrap();
        planner.approve(&plan.id).await.unwrap();

        let runner = planner.clone();
        let id = plan.id.clone();
        let handle = tokio::spawn(async move { runner.advance(&id, snap()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled = planner.cancel(&plan.id).await.unwrap();
        assert_eq!(cancelled.status, PlanStatus::Cancelled);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, StepOutcome::Discarded { step_index: 0 });
        let plan = planner.get(&plan.id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Cancelled);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(planner.cancel(&plan.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_written_on_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let planner = planner_with(service, Arc::new(MockExecutor::new()))
            .with_store(PlanStore::in_dir(dir.path()));
        let plan = planner.create_plan("room", snap(), None).await.unwrap();
        planner.approve(&plan.id).await.unwrap();

        let reloaded = PlanStore::in_dir(dir.path()).load().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].id, plan.id);
        assert_eq!(reloaded[0].status, PlanStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stats_count_statuses() {
        let service = Arc::new(MockAiService::new().with_response(AiMode::Plan, three_steps()));
        let planner = planner_with(service, Arc::new(MockExecutor::new()));
        let a = planner.create_plan("a", snap(), None).await.unwrap();
        planner.create_plan("b", snap(), None).await.unwrap();
        planner.reject(&a.id).await.unwrap();

        let stats = planner.stats().await;
        assert_eq!(stats.plans, 2);
        assert_eq!(stats.by_status.get("rejected"), Some(&1));
        assert_eq!(stats.by_status.get("awaiting_approval"), Some(&1));
        assert_eq!(stats.steps, 6);
    }
}
