//! 计划生命周期集成测试：唯一 id、审批幂等、持久化往返、依赖校验

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use muse::cache::ResponseCache;
    use muse::config::PlannerSection;
    use muse::core::{CoreError, RecoveryEngine, RetryPolicy, SceneObject, Snapshot};
    use muse::planner::{new_plan_id, PlanRegistry, PlanStatus, PlanStore, Planner, StepOutcome};
    use muse::service::{AiMode, MockAiService, MockExecutor, ServiceGateway};
    use serde_json::json;
    use tokio::sync::Mutex;

    fn planner(service: Arc<MockAiService>, executor: Arc<MockExecutor>) -> Planner {
        let recovery = RecoveryEngine::new(RetryPolicy::none());
        let gateway = ServiceGateway::new(
            service,
            Arc::new(Mutex::new(ResponseCache::new(16, Duration::from_secs(60)))),
            recovery.clone(),
            Duration::from_secs(5),
        );
        Planner::new(
            gateway,
            executor,
            Arc::new(PlanRegistry::new()),
            recovery,
            &PlannerSection::default(),
        )
    }

    fn scene() -> Arc<Snapshot> {
        Arc::new(Snapshot::empty().with_object(SceneObject::new("cube", "mesh")))
    }

    #[test]
    fn test_ten_thousand_plan_ids_are_unique() {
        let ids: HashSet<String> = (0..10_000).map(|_| new_plan_id()).collect();
        assert_eq!(ids.len(), 10_000);
        assert!(ids.iter().all(|id| id.starts_with("plan_")));
    }

    #[tokio::test]
    async fn test_approve_twice_keeps_status() {
        let p = planner(Arc::new(MockAiService::new()), Arc::new(MockExecutor::new()));
        let plan = p.create_plan("add a cube", scene(), None).await.unwrap();
        assert_eq!(plan.status, PlanStatus::AwaitingApproval);

        let first = p.approve(&plan.id).await.unwrap();
        let second = p.approve(&plan.id).await.unwrap();
        assert_eq!(first.status, PlanStatus::Approved);
        assert_eq!(second.status, PlanStatus::Approved);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_rejected_plan_accepts_no_more_transitions() {
        let p = planner(Arc::new(MockAiService::new()), Arc::new(MockExecutor::new()));
        let plan = p.create_plan("add a cube", scene(), None).await.unwrap();
        p.reject(&plan.id).await.unwrap();

        assert!(matches!(
            p.approve(&plan.id).await,
            Err(CoreError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            p.advance(&plan.id, scene()).await,
            Err(CoreError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            p.cancel("plan_unknown").await,
            Err(CoreError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_dependency_rejected_at_creation() {
        let service = Arc::new(MockAiService::new());
        service
            .push_response(
                AiMode::Plan,
                json!({
                    "title": "forward",
                    "steps": [
                        {"description": "a"},
                        {"description": "b", "depends_on": [2]},
                        {"description": "c"},
                    ],
                }),
            )
            .await;
        let p = planner(service, Arc::new(MockExecutor::new()));
        let err = p.create_plan("three things", scene(), None).await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedPlan(_)));
        assert!(p.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_step_by_step_advance() {
        let executor = Arc::new(MockExecutor::new());
        let p = planner(Arc::new(MockAiService::new()), executor.clone());
        let plan = p.create_plan("add a cube", scene(), None).await.unwrap();
        p.approve(&plan.id).await.unwrap();

        let first = p.advance(&plan.id, scene()).await.unwrap();
        assert!(matches!(
            first,
            StepOutcome::Executed {
                step_index: 0,
                plan_status: PlanStatus::Executing,
                ..
            }
        ));
        let second = p.advance(&plan.id, scene()).await.unwrap();
        assert!(matches!(
            second,
            StepOutcome::Executed {
                step_index: 1,
                plan_status: PlanStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            p.advance(&plan.id, scene()).await.unwrap(),
            StepOutcome::Finished(PlanStatus::Completed)
        ));
        assert_eq!(executor.executed_texts().await, vec!["inspect", "add a cube"]);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PlanStore::in_dir(dir.path());
        let p = planner(Arc::new(MockAiService::new()), Arc::new(MockExecutor::new()))
            .with_store(store.clone());

        let waiting = p.create_plan("add a cube", scene(), None).await.unwrap();
        let done = p.create_plan("add a sphere", scene(), None).await.unwrap();
        p.approve(&done.id).await.unwrap();
        p.advance(&done.id, scene()).await.unwrap();
        p.advance(&done.id, scene()).await.unwrap();
        let rejected = p.create_plan("add a cone", scene(), None).await.unwrap();
        p.reject(&rejected.id).await.unwrap();

        let restored = planner(Arc::new(MockAiService::new()), Arc::new(MockExecutor::new()))
            .with_store(store);
        assert_eq!(restored.load_persisted().await.unwrap(), 3);

        let w = restored.get(&waiting.id).await.unwrap();
        assert_eq!(w.status, PlanStatus::Cancelled);
        assert_eq!(w.title, waiting.title);
        assert_eq!(w.created_at, waiting.created_at);
        assert_eq!(w.steps.len(), waiting.steps.len());

        let d = restored.get(&done.id).await.unwrap();
        assert_eq!(d.status, PlanStatus::Completed);
        let r = restored.get(&rejected.id).await.unwrap();
        assert_eq!(r.status, PlanStatus::Rejected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_all_reach_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PlanStore::in_dir(dir.path());
        let p = planner(Arc::new(MockAiService::new()), Arc::new(MockExecutor::new()))
            .with_store(store.clone());

        let run = p.create_plan("add a cube", scene(), None).await.unwrap();
        let first = p.create_plan("add a sphere", scene(), None).await.unwrap();
        let second = p.create_plan("add a cone", scene(), None).await.unwrap();
        let third = p.create_plan("add a torus", scene(), None).await.unwrap();
        p.approve(&run.id).await.unwrap();

        let (ran, r1, r2, r3) = tokio::join!(
            async {
                p.advance(&run.id, scene()).await?;
                p.advance(&run.id, scene()).await
            },
            p.reject(&first.id),
            p.cancel(&second.id),
            p.reject(&third.id),
        );
        assert!(ran.is_ok() && r1.is_ok() && r2.is_ok() && r3.is_ok());

        let on_disk = store.load().unwrap();
        let status_of = |id: &str| on_disk.iter().find(|pl| pl.id == id).map(|pl| pl.status);
        assert_eq!(on_disk.len(), 4);
        assert_eq!(status_of(&run.id), Some(PlanStatus::Completed));
        assert_eq!(status_of(&first.id), Some(PlanStatus::Rejected));
        assert_eq!(status_of(&second.id), Some(PlanStatus::Cancelled));
        assert_eq!(status_of(&third.id), Some(PlanStatus::Rejected));
        assert!(!store.path().with_extension("json.tmp").exists());
    }
}
