//! 对话持久化
//!
//! 将对话轮次写入/从 JSON 文件加载，用于跨进程恢复会话（可选使用）。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::memory::ConversationTurn;

/// 单文件 JSON 持久化，每条记录含 role / content / timestamp
#[derive(Debug, Clone)]
pub struct ConversationPersistence {
    path: PathBuf,
}

impl ConversationPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 从 JSON 文件加载对话轮次；文件不存在时返回空 Vec
    pub fn load(&self) -> anyhow::Result<Vec<ConversationTurn>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let turns: Vec<ConversationTurn> = serde_json::from_str(&data)
            .with_context(|| format!("Invalid conversation file {}", self.path.display()))?;
        Ok(turns)
    }

    /// 写入 JSON 文件；父目录不存在时自动创建
    pub fn save<'a>(&self, turns: impl IntoIterator<Item = &'a ConversationTurn>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let turns: Vec<&ConversationTurn> = turns.into_iter().collect();
        std::fs::write(&self.path, serde_json::to_string_pretty(&turns)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConversationMemory, Speaker};

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConversationPersistence::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_restore_rebuilds_entities() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConversationPersistence::new(dir.path().join("nested/conversation.json"));

        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("make the cube red"));
        mem.record(ConversationTurn::assistant("Done"));
        store.save(mem.turns()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].role, Speaker::Assistant);

        let mut restored = ConversationMemory::new(10, 16);
        restored.restore(loaded);
        assert_eq!(restored.resolve_reference("rotate it").unwrap().name, "cube");
    }
}
