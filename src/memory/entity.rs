//! 实体表与指代消解
//!
//! 从每轮对话中抽取被提到的实体（场景对象名、材质名、"the cube" 这类名词短语），
//! 记录最后一次被提到的轮次；"it / that / there" 等指代词按类别兼容性与最近性解析到实体，
//! "they / them / these / those" 解析到最近一轮提到的一组实体。
//! 表容量有界，满时淘汰最久未被提到的实体。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Object,
    Material,
    Location,
    Other,
}

impl std::fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityCategory::Object => "object",
            EntityCategory::Material => "material",
            EntityCategory::Location => "location",
            EntityCategory::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub category: EntityCategory,
    /// 最后一次被提到的轮次（绝对序号，从 0 开始）
    pub last_turn: usize,
    pub mentions: u32,
    /// 同一轮内的先后（越大越晚）
    #[serde(skip)]
    seq: u64,
}

impl Entity {
    /// 不经实体表构造（例如从快照的选中对象退回时）
    pub fn new(name: impl Into<String>, category: EntityCategory) -> Self {
        Self {
            name: name.into(),
            category,
            last_turn: 0,
            mentions: 0,
            seq: 0,
        }
    }

    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

/// 指代词期望的实体类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTarget {
    /// it / this / that / they ...：对象、材质或其他
    ObjectLike,
    /// there / here
    Location,
    /// 指代词后跟了类别名词，如 "that material"
    Exactly(EntityCategory),
}

impl ReferenceTarget {
    pub fn accepts(&self, category: EntityCategory) -> bool {
        match self {
            ReferenceTarget::ObjectLike => category != EntityCategory::Location,
            ReferenceTarget::Location => category == EntityCategory::Location,
            ReferenceTarget::Exactly(c) => *c == category,
        }
    }
}

/// 文本中出现的一个指代
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMarker {
    /// 指代词本身（小写）
    pub marker: String,
    /// 被替换的原文片段（含类别名词时为 "that material"）
    pub span: String,
    pub start: usize,
    pub end: usize,
    pub target: ReferenceTarget,
    /// they / them / these / those
    pub plural: bool,
}

impl ReferenceMarker {
    pub fn is_location(&self) -> bool {
        matches!(
            self.target,
            ReferenceTarget::Location | ReferenceTarget::Exactly(EntityCategory::Location)
        )
    }
}

const OBJECT_NOUNS: &[&str] = &[
    "cube", "sphere", "cylinder", "cone", "torus", "plane", "monkey", "suzanne", "camera",
    "light", "lamp", "sun", "mesh", "curve", "text", "empty", "armature", "icosphere",
];
const MATERIAL_NOUNS: &[&str] = &["material", "texture", "shader"];
const LOCATION_NOUNS: &[&str] = &[
    "floor", "ground", "origin", "center", "corner", "wall", "ceiling", "spot", "place",
    "location", "position", "area",
];
const DEMONSTRATIVES: &[&str] = &["this", "that", "these", "those"];
const PLURAL_MARKERS: &[&str] = &["they", "them", "these", "those"];
/// 指示词后出现这些词时更像连词或限定词，不作指代
const NON_REFERENT_FOLLOWERS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "has", "have", "will", "can", "should",
    "would", "could", "i", "you", "we", "it", "they", "looks", "s",
];
/// "there is a lamp" 是存在句，不指代地点
const EXISTENTIAL_FOLLOWERS: &[&str] = &["is", "are", "was", "were", "s"];

/// 名词所属类别（单复数都认）
pub fn category_for_noun(word: &str) -> Option<EntityCategory> {
    let w = word.to_lowercase();
    let singular = w.strip_suffix('s').unwrap_or(&w);
    for candidate in [w.as_str(), singular] {
        if OBJECT_NOUNS.contains(&candidate) {
            return Some(EntityCategory::Object);
        }
        if MATERIAL_NOUNS.contains(&candidate) {
            return Some(EntityCategory::Material);
        }
        if LOCATION_NOUNS.contains(&candidate) {
            return Some(EntityCategory::Location);
        }
    }
    None
}

static MARKER_RE: OnceLock<Option<Regex>> = OnceLock::new();
static NOUN_PHRASE_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn marker_re() -> Option<&'static Regex> {
    MARKER_RE
        .get_or_init(|| {
            Regex::new(r"(?i)\b(it|this|that|these|those|they|them|there|here)\b").ok()
        })
        .as_ref()
}

fn noun_phrase_re() -> Option<&'static Regex> {
    NOUN_PHRASE_RE
        .get_or_init(|| Regex::new(r"(?i)\b(?:the|a|an|my|this|that)\s+([a-z]+)\b").ok())
        .as_ref()
}

/// 找出文本中的所有指代词
pub fn find_markers(text: &str) -> Vec<ReferenceMarker> {
    let Some(re) = marker_re() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for word in re.find_iter(text) {
        let marker = word.as_str().to_lowercase();
        let follower = next_word(text, word.end());
        let follower_lower = follower.map(|(w, _)| w.to_lowercase());
        let is_demonstrative = DEMONSTRATIVES.contains(&marker.as_str());
        let is_location = marker == "there" || marker == "here";

        if is_demonstrative {
            if let Some(f) = follower_lower.as_deref() {
                if NON_REFERENT_FOLLOWERS.contains(&f) {
                    continue;
                }
            }
        }
        if is_location && is_existential(text, word.end(), follower_lower.as_deref()) {
            continue;
        }

        // 只有指示词能带类别名词："that material"
        let noun_category = if is_demonstrative {
            follower_lower.as_deref().and_then(category_for_noun)
        } else {
            None
        };
        // "that cube" 直接点名了实体，不算指代
        if matches!(noun_category, Some(EntityCategory::Object)) {
            continue;
        }

        let (target, end) = match (noun_category, follower) {
            (Some(category), Some((_, follower_end))) => {
                (ReferenceTarget::Exactly(category), follower_end)
            }
            _ if is_location => (ReferenceTarget::Location, word.end()),
            _ => (ReferenceTarget::ObjectLike, word.end()),
        };
        out.push(ReferenceMarker {
            plural: PLURAL_MARKERS.contains(&marker.as_str()),
            marker,
            span: text[word.start()..end].to_string(),
            start: word.start(),
            end,
            target,
        });
    }
    out
}

fn is_existential(text: &str, marker_end: usize, follower: Option<&str>) -> bool {
    let rest = &text[marker_end..];
    if rest.starts_with("'s") || rest.starts_with("\u{2019}s") {
        return true;
    }
    follower.is_some_and(|f| EXISTENTIAL_FOLLOWERS.contains(&f))
}

/// pos 之后紧跟的单词（只允许中间隔空白）及其结束位置
fn next_word(text: &str, pos: usize) -> Option<(&str, usize)> {
    let rest = &text[pos..];
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() {
        return None;
    }
    let start = pos + (rest.len() - trimmed.len());
    let len = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    if len == 0 {
        return None;
    }
    Some((&text[start..start + len], start + len))
}

/// 从一段文本中抽取实体候选（名字 + 类别），按出现顺序
pub fn extract_candidates(text: &str, snapshot: Option<&Snapshot>) -> Vec<(String, EntityCategory)> {
    let lower = text.to_lowercase();
    let mut found: Vec<(usize, String, EntityCategory)> = Vec::new();

    if let Some(snap) = snapshot {
        for object in &snap.objects {
            if let Some(pos) = find_word(&lower, &object.name.to_lowercase()) {
                found.push((pos, object.name.clone(), EntityCategory::Object));
            }
        }
        for material in &snap.materials {
            if let Some(pos) = find_word(&lower, &material.to_lowercase()) {
                found.push((pos, material.clone(), EntityCategory::Material));
            }
        }
    }

    if let Some(re) = noun_phrase_re() {
        for caps in re.captures_iter(text) {
            let Some(noun) = caps.get(1) else { continue };
            let Some(category) = category_for_noun(noun.as_str()) else {
                continue;
            };
            let name = noun.as_str().to_lowercase();
            let already = found.iter().any(|(_, n, _)| n.to_lowercase() == name);
            if !already {
                found.push((noun.start(), name, category));
            }
        }
    }

    found.sort_by_key(|(pos, _, _)| *pos);
    found.into_iter().map(|(_, n, c)| (n, c)).collect()
}

fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(needle) {
        let start = from + rel;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(start);
        }
        from = end;
    }
    None
}

/// 有界实体表（键为小写名字）
#[derive(Debug, Clone)]
pub struct EntityTable {
    entities: HashMap<String, Entity>,
    capacity: usize,
    next_seq: u64,
}

impl EntityTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entities: HashMap::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// 记录一次提及；已存在则刷新轮次与计数
    pub fn mention(&mut self, name: &str, category: EntityCategory, turn: usize) {
        let key = name.to_lowercase();
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(entity) = self.entities.get_mut(&key) {
            entity.last_turn = entity.last_turn.max(turn);
            entity.mentions += 1;
            entity.seq = seq;
            return;
        }

        if self.entities.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entities.insert(
            key,
            Entity {
                name: name.to_string(),
                category,
                last_turn: turn,
                mentions: 1,
                seq,
            },
        );
    }

    /// 与目标类别兼容、最近被提到的实体
    pub fn most_recent(&self, target: ReferenceTarget) -> Option<&Entity> {
        self.entities
            .values()
            .filter(|e| target.accepts(e.category))
            .max_by_key(|e| (e.last_turn, e.seq))
    }

    /// 复数指代的候选组：最近一轮里所有兼容实体；该轮不足两个时取最近的三个。
    /// 按提及先后排列。
    pub fn latest_group(&self, target: ReferenceTarget) -> Vec<&Entity> {
        let mut compatible: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| target.accepts(e.category))
            .collect();
        compatible.sort_by_key(|e| std::cmp::Reverse((e.last_turn, e.seq)));
        let Some(latest) = compatible.first().map(|e| e.last_turn) else {
            return Vec::new();
        };
        let same_turn = compatible.iter().take_while(|e| e.last_turn == latest).count();
        let take = if same_turn >= 2 { same_turn } else { 3 };
        let mut group: Vec<&Entity> = compatible.into_iter().take(take).collect();
        group.reverse();
        group
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(&name.to_lowercase())
    }

    /// 按最近性从新到旧
    pub fn recent(&self, n: usize) -> Vec<&Entity> {
        let mut all: Vec<&Entity> = self.entities.values().collect();
        all.sort_by_key(|e| std::cmp::Reverse((e.last_turn, e.seq)));
        all.truncate(n);
        all
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entities
            .iter()
            .min_by_key(|(_, e)| (e.last_turn, e.seq))
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            tracing::debug!(entity = %key, "entity table full, evicting least recently referenced");
            self.entities.remove(&key);
        }
    }
}
