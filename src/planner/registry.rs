//! 计划注册表：按 id 持有所有计划
//!
//! 单写者：所有修改经由 update 在写锁内完成；调用方拿到的都是克隆，锁从不跨越执行器调用。

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::core::{CoreError, Result};
use crate::planner::{Plan, PlanStatus};

#[derive(Debug, Default)]
pub struct PlanRegistry {
    plans: RwLock<HashMap<String, Plan>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, plan: Plan) {
        self.plans.write().await.insert(plan.id.clone(), plan);
    }

    pub async fn get(&self, plan_id: &str) -> Option<Plan> {
        self.plans.read().await.get(plan_id).cloned()
    }

    /// 在写锁内修改计划；id 不存在时返回 PlanNotFound
    pub async fn update<T, F>(&self, plan_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Plan) -> Result<T>,
    {
        let mut plans = self.plans.write().await;
        let plan = plans
            .get_mut(plan_id)
            .ok_or_else(|| CoreError::PlanNotFound(plan_id.to_string()))?;
        f(plan)
    }

    /// 按创建时间从旧到新
    pub async fn list(&self) -> Vec<Plan> {
        let mut all: Vec<Plan> = self.plans.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub async fn with_status(&self, status: PlanStatus) -> Vec<Plan> {
        self.list()
            .await
            .into_iter()
            .filter(|p| p.status == status)
            .collect()
    }

    pub async fn remove(&self, plan_id: &str) -> Option<Plan> {
        self.plans.write().await.remove(plan_id)
    }

    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plans.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.plans.write().await.clear();
    }
}
