//! 进程级共享资源：计划注册表、响应缓存、对话记忆
//!
//! 宿主环境通常只有一个会话，这些资源以显式对象的形式存在，通过 init / global / teardown 管理生命周期；
//! 测试可以直接构造独立的 Services 而不触碰全局实例。

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::cache::{CacheStats, ResponseCache};
use crate::config::AppConfig;
use crate::memory::{ConversationMemory, ConversationPersistence};
use crate::planner::{PlanRegistry, PlanStore};
use crate::service::gateway::SharedCache;

pub struct Services {
    config: AppConfig,
    pub registry: Arc<PlanRegistry>,
    pub cache: SharedCache,
    pub memory: Arc<Mutex<ConversationMemory>>,
}

impl Services {
    pub fn new(config: AppConfig) -> Self {
        Self {
            registry: Arc::new(PlanRegistry::new()),
            cache: Arc::new(Mutex::new(ResponseCache::from_config(&config.cache))),
            memory: Arc::new(Mutex::new(ConversationMemory::from_config(&config.memory))),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.app.state_dir()
    }

    pub fn plan_store(&self) -> PlanStore {
        PlanStore::in_dir(self.state_dir())
    }

    pub fn conversation_store(&self) -> ConversationPersistence {
        ConversationPersistence::new(self.state_dir().join("conversation.json"))
    }

    /// 把对话写入 state_dir/conversation.json
    pub async fn save_conversation(&self) -> anyhow::Result<()> {
        let memory = self.memory.lock().await;
        self.conversation_store().save(memory.turns())
    }

    /// 从 state_dir/conversation.json 恢复对话（重新抽取实体）；返回恢复的轮数
    pub async fn load_conversation(&self) -> anyhow::Result<usize> {
        let turns = self.conversation_store().load()?;
        let n = turns.len();
        self.memory.lock().await.restore(turns);
        Ok(n)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }
}

static GLOBAL: RwLock<Option<Arc<Services>>> = RwLock::new(None);

/// 初始化全局实例；已存在时替换并返回新的
pub fn init(config: AppConfig) -> Arc<Services> {
    let services = Arc::new(Services::new(config));
    match GLOBAL.write() {
        Ok(mut slot) => {
            if slot.is_some() {
                tracing::warn!("shared services re-initialized");
            }
            *slot = Some(services.clone());
        }
        Err(_) => tracing::error!("shared services lock poisoned, instance not registered"),
    }
    services
}

pub fn global() -> Option<Arc<Services>> {
    GLOBAL.read().ok().and_then(|slot| slot.clone())
}

/// 释放全局实例；返回之前是否存在
pub fn teardown() -> bool {
    GLOBAL
        .write()
        .map(|mut slot| slot.take().is_some())
        .unwrap_or(false)
}
