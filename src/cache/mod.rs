//! 响应缓存：容量有界（LRU）+ 条目限时（TTL）
//!
//! 键由「命名空间 + 归一化请求文本 + 快照指纹」哈希而成，同一请求在场景变化后不会命中旧结果。
//! 过期在 get 时检查（过期即视为未命中并删除），put 时从 LRU 尾部顺带清扫过期条目。

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::CacheSection;

/// 缓存键（十六进制 SHA-256）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(namespace: &str, text: &str, fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize(text).as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 小写、折叠空白；"Make  the Cube red " 与 "make the cube red" 视为同一请求
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// 在 recency 索引中的位置
    tick: u64,
}

/// 命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 有界 LRU + TTL 缓存
#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    /// tick 越小越久未使用
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    capacity: usize,
    ttl: Duration,
    stats: CacheStats,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            next_tick: 0,
            capacity,
            ttl,
            stats: CacheStats {
                capacity,
                ..CacheStats::default()
            },
        }
    }

    pub fn from_config(cfg: &CacheSection) -> Self {
        Self::new(cfg.capacity, Duration::from_secs(cfg.ttl_secs))
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&mut self, key: CacheKey, value: V) {
        self.put_at(key, value, Instant::now())
    }

    pub(crate) fn get_at(&mut self, key: &CacheKey, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => now.saturating_duration_since(entry.inserted_at) >= self.ttl,
        };
        if expired {
            self.remove_entry(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            tracing::debug!(key = %key.as_str(), "cache entry expired");
            return None;
        }

        let tick = self.bump_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());
        self.stats.hits += 1;
        Some(entry.value.clone())
    }

    pub(crate) fn put_at(&mut self, key: CacheKey, value: V, now: Instant) {
        self.sweep_expired(now);
        if self.entries.contains_key(&key) {
            self.remove_entry(&key);
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
            tracing::debug!(key = %oldest.as_str(), "cache evicted least recently used entry");
        }

        let tick = self.bump_tick();
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                tick,
            },
        );
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        self.remove_entry(key).map(|e| e.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    fn remove_entry(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    /// 从 LRU 尾部开始删掉已过期的条目，遇到第一个未过期的就停
    fn sweep_expired(&mut self, now: Instant) {
        loop {
            let Some((_, key)) = self.recency.first_key_value() else {
                break;
            };
            let expired = self
                .entries
                .get(key)
                .map(|e| now.saturating_duration_since(e.inserted_at) >= self.ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let key = key.clone();
            self.remove_entry(&key);
            self.stats.expirations += 1;
        }
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }
}
