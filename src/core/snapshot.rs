//! 环境快照：跨越并发边界前捕获的宿主状态
//!
//! 后台 worker 只能看到 Snapshot，绝不触碰宿主的活动对象；宿主对象的有效期可能在后台执行期间失效。
//! 指纹（fingerprint）不含捕获时间，只覆盖会影响 AI 回复的字段，用作缓存键的一部分。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 场景中的一个对象（只保留名字、类型与选中状态）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneObject {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub selected: bool,
}

impl SceneObject {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            selected: false,
        }
    }

    pub fn selected(mut self) -> Self {
        self.selected = true;
        self
    }
}

/// 不可变的环境快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub objects: Vec<SceneObject>,
    #[serde(default)]
    pub materials: Vec<String>,
    pub active_object: Option<String>,
    /// 宿主的编辑模式等
    pub mode: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    pub captured_at: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            objects: Vec::new(),
            materials: Vec::new(),
            active_object: None,
            mode: None,
            flags: BTreeMap::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn with_object(mut self, object: SceneObject) -> Self {
        self.objects.push(object);
        self
    }

    pub fn with_material(mut self, name: impl Into<String>) -> Self {
        self.materials.push(name.into());
        self
    }

    pub fn with_active(mut self, name: impl Into<String>) -> Self {
        self.active_object = Some(name.into());
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: bool) -> Self {
        self.flags.insert(key.into(), value);
        self
    }

    pub fn selected_objects(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.iter().filter(|o| o.selected)
    }

    /// 文本中出现的场景对象名（大小写不敏感）
    pub fn objects_mentioned_in<'a>(&'a self, text: &str) -> Vec<&'a SceneObject> {
        let lower = text.to_lowercase();
        self.objects
            .iter()
            .filter(|o| !o.name.is_empty() && lower.contains(&o.name.to_lowercase()))
            .collect()
    }

    /// 内容指纹（十六进制 SHA-256）；对象按名字排序后参与计算，顺序无关
    pub fn fingerprint(&self) -> String {
        let mut objects: Vec<&SceneObject> = self.objects.iter().collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        let mut materials: Vec<&String> = self.materials.iter().collect();
        materials.sort();

        let mut hasher = Sha256::new();
        for o in objects {
            hasher.update(o.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(o.kind.as_bytes());
            hasher.update([o.selected as u8, 0xff]);
        }
        hasher.update(b"|materials|");
        for m in materials {
            hasher.update(m.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"|active|");
        hasher.update(self.active_object.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|mode|");
        hasher.update(self.mode.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|flags|");
        for (k, v) in &self.flags {
            hasher.update(k.as_bytes());
            hasher.update([*v as u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// 供提示词使用的简短场景描述（最多列 10 个对象）
    pub fn summary(&self) -> String {
        if self.objects.is_empty() {
            return "Empty scene".to_string();
        }
        let mut parts = vec![format!("Scene contains {} objects:", self.objects.len())];
        for o in self.objects.iter().take(10) {
            let status = if o.selected { " (selected)" } else { "" };
            parts.push(format!("- {} ({}){}", o.name, o.kind, status));
        }
        if self.objects.len() > 10 {
            parts.push(format!("... and {} more objects", self.objects.len() - 10));
        }
        if let Some(active) = &self.active_object {
            parts.push(format!("Active object: {}", active));
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_capture_time_and_order() {
        let a = Snapshot::empty()
            .with_object(SceneObject::new("Cube", "MESH"))
            .with_object(SceneObject::new("Light", "LIGHT"));
        let mut b = Snapshot::empty()
            .with_object(SceneObject::new("Light", "LIGHT"))
            .with_object(SceneObject::new("Cube", "MESH"));
        b.captured_at = a.captured_at + chrono::Duration::seconds(30);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_selection() {
        let a = Snapshot::empty().with_object(SceneObject::new("Cube", "MESH"));
        let b = Snapshot::empty().with_object(SceneObject::new("Cube", "MESH").selected());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_objects_mentioned_in() {
        let snap = Snapshot::empty()
            .with_object(SceneObject::new("Cube", "MESH"))
            .with_object(SceneObject::new("Sphere", "MESH"));
        let found = snap.objects_mentioned_in("make the cube red");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Cube");
    }
}
