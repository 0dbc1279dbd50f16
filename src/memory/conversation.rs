//! 短期记忆：对话历史 + 实体表
//!
//! 保留最近 max_turns 轮对话，超出时丢弃最旧的；每次 record 自动抽取被提到的实体，
//! 供后续 "it / they / there" 指代消解使用。轮次序号是绝对的（不随剪枝重置）。
//! 实体表查不到时退回快照里的选中对象。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MemorySection;
use crate::core::Snapshot;
use crate::memory::entity::{self, Entity, EntityCategory, EntityTable, ReferenceMarker};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 发给 LLM 的单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 对话一方；System 只出现在发给 LLM 的消息里，不进对话日志
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// 一轮对话（只追加）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Speaker::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Speaker::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// rewrite_references 的结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceResolution {
    /// 指代词替换为实体名后的文本
    pub text: String,
    /// (指代词, 实体)；复数指代会对应多条
    pub resolved: Vec<(String, Entity)>,
    /// 没有兼容实体的指代词
    pub unresolved: Vec<String>,
}

impl ReferenceResolution {
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn changed(&self) -> bool {
        !self.resolved.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub turns: usize,
    pub total_recorded: usize,
    pub user_turns: usize,
    pub assistant_turns: usize,
    pub entities: usize,
}

/// 对话记忆：有界轮次日志 + 实体表
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
    /// 下一轮的绝对序号
    next_turn: usize,
    entities: EntityTable,
    /// 最近一次被指代消解命中的实体（小写键），"this" 优先解析到它
    focus: Option<String>,
}

impl ConversationMemory {
    pub fn new(max_turns: usize, entity_capacity: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
            next_turn: 0,
            entities: EntityTable::new(entity_capacity),
            focus: None,
        }
    }

    pub fn from_config(cfg: &MemorySection) -> Self {
        Self::new(cfg.max_turns, cfg.entity_capacity)
    }

    /// 追加一轮对话并抽取实体；返回该轮的绝对序号
    pub fn record(&mut self, turn: ConversationTurn) -> usize {
        self.record_with(turn, None)
    }

    /// 同 record，但用快照中的对象名与材质名辅助实体抽取
    pub fn record_in_scene(&mut self, turn: ConversationTurn, snapshot: &Snapshot) -> usize {
        self.record_with(turn, Some(snapshot))
    }

    fn record_with(&mut self, turn: ConversationTurn, snapshot: Option<&Snapshot>) -> usize {
        let index = self.next_turn;
        self.next_turn += 1;
        self.extract_entities(index, &turn.content, snapshot);
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
        index
    }

    /// 把 text 中出现的实体记到第 turn 轮
    pub fn extract_entities(&mut self, turn: usize, text: &str, snapshot: Option<&Snapshot>) -> usize {
        let candidates = entity::extract_candidates(text, snapshot);
        for (name, category) in &candidates {
            self.entities.mention(name, *category, turn);
        }
        candidates.len()
    }

    /// 被指代消解命中的实体也算一次提及（记到最新一轮），并成为当前焦点
    pub fn note_reference(&mut self, entity: &Entity) {
        let turn = self.next_turn.saturating_sub(1);
        self.entities.mention(&entity.name, entity.category, turn);
        self.focus = Some(entity.key());
    }

    /// 解析文本中第一个指代词；没有指代词或没有兼容实体时返回 None
    pub fn resolve_reference(&self, text: &str) -> Option<Entity> {
        self.resolve_first(text, None)
    }

    /// 同 resolve_reference，实体表落空时参考快照的选中对象
    pub fn resolve_reference_in_scene(&self, text: &str, snapshot: &Snapshot) -> Option<Entity> {
        self.resolve_first(text, Some(snapshot))
    }

    fn resolve_first(&self, text: &str, snapshot: Option<&Snapshot>) -> Option<Entity> {
        let marker = entity::find_markers(text).into_iter().next()?;
        self.resolve_marker(&marker, snapshot).into_iter().next()
    }

    fn resolve_marker(&self, marker: &ReferenceMarker, snapshot: Option<&Snapshot>) -> Vec<Entity> {
        let accepts_objects = marker.target.accepts(EntityCategory::Object);
        let selection: Vec<Entity> = match snapshot {
            Some(snap) if accepts_objects => snap
                .selected_objects()
                .map(|o| Entity::new(o.name.clone(), EntityCategory::Object))
                .collect(),
            _ => Vec::new(),
        };

        if marker.plural {
            // "these / those" 先看选区
            let demonstrative = marker.marker == "these" || marker.marker == "those";
            if demonstrative && selection.len() > 1 {
                return selection;
            }
            let group: Vec<Entity> = self
                .entities
                .latest_group(marker.target)
                .into_iter()
                .cloned()
                .collect();
            if group.len() > 1 || selection.len() <= 1 {
                return group;
            }
            return selection;
        }

        if marker.marker == "this" {
            let focused = self
                .focus
                .as_deref()
                .and_then(|key| self.entities.get(key))
                .filter(|e| marker.target.accepts(e.category));
            if let Some(entity) = focused {
                return vec![entity.clone()];
            }
        }
        if let Some(entity) = self.entities.most_recent(marker.target) {
            return vec![entity.clone()];
        }
        if selection.len() == 1 {
            return selection;
        }
        Vec::new()
    }

    /// 把所有可解析的指代词替换为实体名
    pub fn rewrite_references(&self, text: &str) -> ReferenceResolution {
        self.rewrite_with(text, None)
    }

    /// 同 rewrite_references，实体表落空时参考快照的选中对象
    pub fn rewrite_references_in_scene(&self, text: &str, snapshot: &Snapshot) -> ReferenceResolution {
        self.rewrite_with(text, Some(snapshot))
    }

    fn rewrite_with(&self, text: &str, snapshot: Option<&Snapshot>) -> ReferenceResolution {
        let markers = entity::find_markers(text);
        let mut out = ReferenceResolution {
            text: String::with_capacity(text.len()),
            ..Default::default()
        };
        let mut cursor = 0;
        for marker in markers {
            out.text.push_str(&text[cursor..marker.start]);
            let entities = self.resolve_marker(&marker, snapshot);
            if entities.is_empty() {
                out.text.push_str(&marker.span);
                out.unresolved.push(marker.marker.clone());
            } else {
                let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
                let joined = join_names(&names);
                if marker.is_location() {
                    out.text.push_str(&location_phrase(&out.text, &joined));
                } else {
                    out.text.push_str(&joined);
                }
                for entity in entities {
                    out.resolved.push((marker.marker.clone(), entity));
                }
            }
            cursor = marker.end;
        }
        out.text.push_str(&text[cursor..]);
        out
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// 最近 n 轮（从旧到新）
    pub fn recent_turns(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn recent_entities(&self, n: usize) -> Vec<Entity> {
        self.entities.recent(n).into_iter().cloned().collect()
    }

    /// 供提示词使用的上下文摘要
    pub fn context_summary(&self) -> String {
        if self.turns.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Recent conversation:".to_string()];
        for turn in self.recent_turns(6) {
            let who = match turn.role {
                Speaker::User => "user",
                Speaker::Assistant => "assistant",
            };
            lines.push(format!("{}: {}", who, truncate(&turn.content, 200)));
        }
        let recent = self.entities.recent(5);
        if !recent.is_empty() {
            let names: Vec<String> = recent
                .iter()
                .map(|e| format!("{} ({})", e.name, e.category))
                .collect();
            lines.push(format!("Recently referenced: {}", names.join(", ")));
        }
        lines.join("\n")
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            turns: self.turns.len(),
            total_recorded: self.next_turn,
            user_turns: self.turns.iter().filter(|t| t.role == Speaker::User).count(),
            assistant_turns: self
                .turns
                .iter()
                .filter(|t| t.role == Speaker::Assistant)
                .count(),
            entities: self.entities.len(),
        }
    }

    /// 用持久化的轮次重建记忆（会重新抽取实体）
    pub fn restore(&mut self, turns: Vec<ConversationTurn>) {
        self.clear();
        for turn in turns {
            self.record(turn);
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.entities.clear();
        self.focus = None;
        self.next_turn = 0;
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

const PREPOSITIONS: &[&str] = &[
    "to", "from", "at", "in", "on", "into", "onto", "near", "over", "under", "by", "toward",
    "towards", "across", "behind",
];

/// "a"、"a and b"、"a, b and c"
fn join_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => one.to_string(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

/// 地点指代替换成介词短语；前面已有介词时只补冠词
fn location_phrase(preceding: &str, name: &str) -> String {
    let lower = name.to_lowercase();
    let noun = if lower.starts_with("the ") {
        name.to_string()
    } else {
        format!("the {}", name)
    };
    let prev = preceding
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .next_back()
        .map(str::to_lowercase);
    match prev {
        Some(p) if PREPOSITIONS.contains(&p.as_str()) => noun,
        _ => format!("at {}", noun),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SceneObject;
    use crate::memory::EntityCategory;

    #[test]
    fn test_pronoun_resolves_to_previous_object() {
        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("make the cube red"));
        let entity = mem.resolve_reference("make it red").unwrap();
        assert_eq!(entity.name, "cube");
        assert_eq!(entity.category, EntityCategory::Object);
    }

    #[test]
    fn test_location_marker_prefers_location_entity() {
        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("move the sphere to the corner"));
        mem.record(ConversationTurn::user("add a lamp"));
        assert_eq!(mem.resolve_reference("put a cone there").unwrap().name, "corner");
        assert_eq!(mem.resolve_reference("scale it up").unwrap().name, "lamp");
        assert_eq!(
            mem.rewrite_references("put a cone at that spot").text,
            "put a cone at the corner"
        );
    }

    #[test]
    fn test_category_noun_narrows_resolution() {
        let snap = Snapshot::empty()
            .with_object(SceneObject::new("Cube", "MESH"))
            .with_material("Gold");
        let mut mem = ConversationMemory::new(10, 16);
        mem.record_in_scene(ConversationTurn::user("give Cube the Gold material"), &snap);
        let entity = mem.resolve_reference("make that material shinier").unwrap();
        assert_eq!(entity.name, "Gold");
    }

    #[test]
    fn test_unresolved_reference_returns_none() {
        let mem = ConversationMemory::new(10, 16);
        assert!(mem.resolve_reference("make it red").is_none());
        let rewrite = mem.rewrite_references("make it red");
        assert!(!rewrite.is_fully_resolved());
        assert_eq!(rewrite.text, "make it red");
    }

    #[test]
    fn test_rewrite_substitutes_names() {
        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("add a sphere on the floor"));
        let rewrite = mem.rewrite_references("put it there");
        assert_eq!(rewrite.text, "put sphere at the floor");
        assert_eq!(rewrite.resolved.len(), 2);
        assert!(rewrite.is_fully_resolved());

        assert_eq!(
            mem.rewrite_references("move the lamp to there").text,
            "move the lamp to the floor"
        );
    }

    #[test]
    fn test_pronoun_followed_by_verb_resolves() {
        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("add the cube"));
        let rewrite = mem.rewrite_references("check if it is red");
        assert_eq!(rewrite.text, "check if cube is red");
        assert_eq!(rewrite.resolved[0].1.name, "cube");
        assert_eq!(
            mem.resolve_reference("make sure it has a material").unwrap().name,
            "cube"
        );

        let empty = ConversationMemory::new(10, 16);
        let rewrite = empty.rewrite_references("they are too big");
        assert_eq!(rewrite.unresolved, vec!["they".to_string()]);
    }

    #[test]
    fn test_plural_reference_names_the_whole_group() {
        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("add a cube and a sphere"));
        let rewrite = mem.rewrite_references("make them red");
        assert_eq!(rewrite.text, "make cube and sphere red");
        let names: Vec<&str> = rewrite.resolved.iter().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(names, vec!["cube", "sphere"]);
    }

    #[test]
    fn test_selection_fills_in_when_memory_is_empty() {
        let mem = ConversationMemory::new(10, 16);
        let one = Snapshot::empty()
            .with_object(SceneObject::new("Cube", "MESH").selected())
            .with_object(SceneObject::new("Lamp", "LIGHT"));
        assert_eq!(mem.rewrite_references_in_scene("make it red", &one).text, "make Cube red");

        let two = Snapshot::empty()
            .with_object(SceneObject::new("Cube", "MESH").selected())
            .with_object(SceneObject::new("Cone", "MESH").selected());
        assert_eq!(
            mem.rewrite_references_in_scene("scale these up", &two).text,
            "scale Cube and Cone up"
        );
        assert!(!mem.rewrite_references_in_scene("make it red", &two).is_fully_resolved());
    }

    #[test]
    fn test_this_prefers_the_focused_entity() {
        let mut mem = ConversationMemory::new(10, 16);
        mem.record(ConversationTurn::user("add a cube"));
        let cube = mem.resolve_reference("make it red").unwrap();
        mem.note_reference(&cube);
        mem.record(ConversationTurn::user("add a lamp"));
        assert_eq!(mem.resolve_reference("rotate this").unwrap().name, "cube");
        assert_eq!(mem.resolve_reference("rotate it").unwrap().name, "lamp");
    }

    #[test]
    fn test_turn_log_is_bounded() {
        let mut mem = ConversationMemory::new(3, 16);
        for i in 0..5 {
            mem.record(ConversationTurn::user(format!("message {}", i)));
        }
        let stats = mem.stats();
        assert_eq!(stats.turns, 3);
        assert_eq!(stats.total_recorded, 5);
        assert_eq!(mem.recent_turns(1)[0].content, "message 4");
    }

    #[test]
    fn test_context_summary_mentions_entities() {
        let mut mem = ConversationMemory::new(10, 16);
        assert!(mem.context_summary().is_empty());
        mem.record(ConversationTurn::user("add a camera"));
        mem.record(ConversationTurn::assistant("Added a camera at the origin"));
        let summary = mem.context_summary();
        assert!(summary.contains("user: add a camera"));
        assert!(summary.contains("camera (object)"));
    }
}
