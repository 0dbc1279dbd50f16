//! 计划落盘：单个 JSON 文件 `{plan_id: Plan}`
//!
//! 重新加载时，非终态计划（draft / awaiting_approval / approved / executing）一律视为 cancelled，
//! 标题、步骤、时间戳原样保留。
//! 写入先落到 plans.json.tmp 再 rename；异步路径在写锁内取快照，阻塞 IO 交给 spawn_blocking。

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::{CoreError, Result};
use crate::planner::{Plan, PlanStatus};

#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
    /// 克隆共享同一把锁，同一时刻只有一个写入者碰 tmp 文件
    write_lock: Arc<Mutex<()>>,
}

impl PlanStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// state_dir 下的 plans.json
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("plans.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save<'a>(&self, plans: impl IntoIterator<Item = &'a Plan>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let map: BTreeMap<&str, &Plan> = plans.into_iter().map(|p| (p.id.as_str(), p)).collect();
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), plans = map.len(), "plans saved");
        Ok(())
    }

    /// 拿到写锁后再取快照并写盘，锁在写入结束时才释放，因此后取的快照一定后落盘。
    /// 返回写入的计划数。
    pub async fn save_latest<Fut>(&self, snapshot: Fut) -> Result<usize>
    where
        Fut: Future<Output = Vec<Plan>>,
    {
        let guard = self.write_lock.clone().lock_owned().await;
        let plans = snapshot.await;
        let count = plans.len();
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            store.save(plans.iter())
        })
        .await
        .map_err(|e| CoreError::Io(std::io::Error::other(e)))??;
        Ok(count)
    }

    /// 文件不存在时返回空
    pub fn load(&self) -> Result<Vec<Plan>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let map: BTreeMap<String, Plan> = serde_json::from_str(&data)?;
        let mut plans = Vec::with_capacity(map.len());
        for (id, mut plan) in map {
            if plan.id != id {
                tracing::warn!(key = %id, plan_id = %plan.id, "plan key does not match id, using key");
                plan.id = id;
            }
            if !plan.status.is_terminal() {
                tracing::info!(plan_id = %plan.id, from = %plan.status, "interrupted plan marked cancelled");
                plan.status = PlanStatus::Cancelled;
            }
            plans.push(plan);
        }
        Ok(plans)
    }
}
