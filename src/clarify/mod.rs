//! 澄清：检测歧义、生成候选解释与追问
//!
//! 本地规则先找出常见歧义（指代不明、缩放没给幅度、上色没给对象、移动没给目的地），
//! 再请 AI 服务给出候选解释与问题；服务没给问题时用本地规则对应的模板问题。
//! 用户的回答与原请求拼接后作为新输入重新进入编排器。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ClarificationSection;
use crate::core::{CoreError, Result, Snapshot};
use crate::memory::entity::{self, EntityCategory};
use crate::service::{AiMode, AiRequest, ServiceGateway};

/// 歧义原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum Ambiguity {
    VagueReference,
    MissingAmount,
    ColorWithoutTarget,
    MovementWithoutDestination,
    /// 分类器或编排器给出的原因（低置信度、指代无法解析等）
    Reported(String),
}

impl std::fmt::Display for Ambiguity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ambiguity::VagueReference => f.write_str("Vague object reference"),
            Ambiguity::MissingAmount => f.write_str("Missing size specification"),
            Ambiguity::ColorWithoutTarget => f.write_str("Color specified without target object"),
            Ambiguity::MovementWithoutDestination => f.write_str("Movement without destination"),
            Ambiguity::Reported(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: String,
    /// 有歧义的原始请求
    pub text: String,
    pub interpretations: Vec<String>,
    pub questions: Vec<String>,
    pub reasons: Vec<Ambiguity>,
    /// 第几轮澄清（从 1 开始）
    pub round: u32,
    pub created_at: DateTime<Utc>,
}

impl ClarificationRequest {
    /// 展示给用户的提示
    pub fn prompt(&self) -> String {
        let mut lines = Vec::new();
        if !self.interpretations.is_empty() {
            lines.push("Did you mean:".to_string());
            for (i, interp) in self.interpretations.iter().enumerate() {
                lines.push(format!("  {}. {}", i + 1, interp));
            }
        }
        lines.extend(self.questions.iter().cloned());
        lines.join("\n")
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClarifyReply {
    #[serde(default)]
    interpretations: Vec<String>,
    #[serde(default)]
    questions: Vec<String>,
}

const SIZE_WORDS: &[&str] = &["bigger", "smaller", "larger", "more", "less", "scale", "resize"];
const COLOR_WORDS: &[&str] = &[
    "red", "blue", "green", "yellow", "orange", "purple", "white", "black", "color", "colour",
];
const MOVE_PREPOSITIONS: &[&str] = &[
    "to", "by", "up", "down", "left", "right", "onto", "into", "toward", "towards", "next",
];

/// 本地歧义检测
pub fn detect_ambiguities(text: &str, snapshot: &Snapshot) -> Vec<Ambiguity> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_any = |list: &[&str]| list.iter().any(|w| words.contains(w));
    let mut out = Vec::new();

    let vague = !entity::find_markers(text).is_empty();
    if vague {
        out.push(Ambiguity::VagueReference);
    }
    if has_any(SIZE_WORDS) && !text.chars().any(|c| c.is_ascii_digit()) {
        out.push(Ambiguity::MissingAmount);
    }
    if has_any(COLOR_WORDS) && !vague && !names_an_object(text, snapshot) {
        out.push(Ambiguity::ColorWithoutTarget);
    }
    if words.contains(&"move") && !has_any(MOVE_PREPOSITIONS) {
        out.push(Ambiguity::MovementWithoutDestination);
    }
    out
}

/// 文本是否点名了一个对象（快照中的对象名或已知的对象名词）
fn names_an_object(text: &str, snapshot: &Snapshot) -> bool {
    if !snapshot.objects_mentioned_in(text).is_empty() {
        return true;
    }
    entity::extract_candidates(text, None)
        .iter()
        .any(|(_, c)| *c == EntityCategory::Object)
}

/// 每种歧义对应的模板问题
pub fn template_questions(reasons: &[Ambiguity], text: &str, snapshot: &Snapshot) -> Vec<String> {
    let mut out = Vec::new();
    for reason in reasons {
        let q = match reason {
            Ambiguity::VagueReference => {
                let selected = snapshot.selected_objects().count();
                if selected > 0 {
                    format!(
                        "I see {} selected object(s). Are you referring to the selection, or to a different object?",
                        selected
                    )
                } else {
                    "Which object are you referring to?".to_string()
                }
            }
            Ambiguity::MissingAmount => {
                "How much bigger or smaller? (e.g. '2x larger', 'scale by 0.5')".to_string()
            }
            Ambiguity::ColorWithoutTarget => {
                "Which object should be colored, and should I create a new material or modify an existing one?".to_string()
            }
            Ambiguity::MovementWithoutDestination => {
                "Where should it be moved to? (e.g. 'up by 2 units', 'next to the cube')".to_string()
            }
            Ambiguity::Reported(_) => continue,
        };
        if !out.contains(&q) {
            out.push(q);
        }
    }
    if out.is_empty() {
        out.push(format!(
            "I need more information to help with '{}'. Could you give more specific details?",
            text
        ));
    }
    out
}

#[derive(Clone)]
pub struct ClarificationResolver {
    gateway: ServiceGateway,
    max_rounds: u32,
}

impl ClarificationResolver {
    pub fn new(gateway: ServiceGateway, max_rounds: u32) -> Self {
        Self {
            gateway,
            max_rounds,
        }
    }

    pub fn from_config(gateway: ServiceGateway, cfg: &ClarificationSection) -> Self {
        Self::new(gateway, cfg.max_rounds)
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// 已经问过 rounds 轮后是否还能再问
    pub fn can_ask(&self, rounds_so_far: u32) -> bool {
        rounds_so_far < self.max_rounds
    }

    /// 生成澄清请求；本地没发现歧义且调用方也没报告歧义时返回 None
    ///
    /// round 从 1 开始。
    pub async fn resolve(
        &self,
        text: &str,
        snapshot: Arc<Snapshot>,
        round: u32,
        reported: Option<String>,
    ) -> Result<Option<ClarificationRequest>> {
        let mut reasons = detect_ambiguities(text, &snapshot);
        if let Some(reason) = reported {
            reasons.insert(0, Ambiguity::Reported(reason));
        }
        if reasons.is_empty() {
            return Ok(None);
        }

        let hint = reasons
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let request = AiRequest::new(AiMode::Clarify, text, snapshot.clone())
            .with_context(format!("Ambiguity: {}", hint));
        let value = self.gateway.request(&request).await?;
        let reply: ClarifyReply = serde_json::from_value(value)
            .map_err(|e| CoreError::MalformedResponse(format!("clarification: {}", e)))?;

        let questions = if reply.questions.is_empty() {
            template_questions(&reasons, text, &snapshot)
        } else {
            reply.questions
        };

        let req = ClarificationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            interpretations: reply.interpretations,
            questions,
            reasons,
            round,
            created_at: Utc::now(),
        };
        tracing::info!(
            clarification_id = %req.id,
            round,
            reasons = %hint,
            "clarification requested"
        );
        Ok(Some(req))
    }

    /// 原请求 + 用户回答，作为新的输入
    pub fn answer(request: &ClarificationRequest, answer: &str) -> String {
        format!("{}\n\nClarification: {}", request.text, answer.trim())
    }
}
