//! 计划与步骤
//!
//! 计划由 AI 草稿解析而来，解析时校验步骤形状、序号连续、依赖只指向更早的步骤。
//! 计划状态是步骤状态的单调函数：全部成功/跳过 → completed；必需步骤失败 → failed。
//! rejected / cancelled 之后不再接受任何步骤变化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, Result};
use crate::service::ActionPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    AwaitingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Rejected | PlanStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::AwaitingApproval => "awaiting_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Rejected => "rejected",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub description: String,
    pub action: ActionPayload,
    pub status: StepStatus,
    pub depends_on: Vec<usize>,
    pub error: Option<String>,
    #[serde(default)]
    pub risk: Risk,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

fn default_required() -> bool {
    true
}

/// AI 草稿中的单个步骤
#[derive(Debug, Deserialize)]
struct StepDraft {
    index: Option<usize>,
    description: String,
    action: Option<serde_json::Value>,
    #[serde(default, alias = "dependencies")]
    depends_on: Vec<usize>,
    #[serde(default)]
    risk: Risk,
    #[serde(default = "default_required")]
    required: bool,
    expected_outcome: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanDraft {
    title: Option<String>,
    steps: Vec<StepDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    /// 产生该计划的原始请求
    pub request: String,
    pub steps: Vec<Step>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新计划 id：plan_ + 随机 UUID v4
pub fn new_plan_id() -> String {
    format!("plan_{}", uuid::Uuid::new_v4().simple())
}

impl Plan {
    /// 从 AI 草稿构造（状态 draft）；形状不对、序号不连续、依赖指向后面的步骤都是 MalformedPlan
    pub fn from_draft(value: &serde_json::Value, request: &str, max_steps: usize) -> Result<Self> {
        let draft: PlanDraft = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::MalformedPlan(format!("plan draft: {}", e)))?;
        if draft.steps.is_empty() {
            return Err(CoreError::MalformedPlan("plan has no steps".into()));
        }
        if draft.steps.len() > max_steps {
            return Err(CoreError::MalformedPlan(format!(
                "plan has {} steps, limit is {}",
                draft.steps.len(),
                max_steps
            )));
        }

        let mut steps = Vec::with_capacity(draft.steps.len());
        for (position, d) in draft.steps.into_iter().enumerate() {
            if let Some(index) = d.index {
                if index != position {
                    return Err(CoreError::MalformedPlan(format!(
                        "step at position {} has index {}; indices must be contiguous from 0",
                        position, index
                    )));
                }
            }
            if d.description.trim().is_empty() {
                return Err(CoreError::MalformedPlan(format!(
                    "step {} has an empty description",
                    position
                )));
            }
            if let Some(dep) = d.depends_on.iter().find(|dep| **dep >= position) {
                return Err(CoreError::MalformedPlan(format!(
                    "step {} depends on step {}, dependencies must refer to earlier steps",
                    position, dep
                )));
            }
            let action = match d.action {
                Some(v) if !v.is_null() => ActionPayload(v),
                _ => ActionPayload::task(d.description.clone()),
            };
            let mut depends_on = d.depends_on;
            depends_on.sort_unstable();
            depends_on.dedup();
            steps.push(Step {
                index: position,
                description: d.description,
                action,
                status: StepStatus::Pending,
                depends_on,
                error: None,
                risk: d.risk,
                required: d.required,
                expected_outcome: d.expected_outcome,
                output: None,
            });
        }

        let now = Utc::now();
        Ok(Plan {
            id: new_plan_id(),
            title: draft
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| request.chars().take(60).collect()),
            request: request.to_string(),
            steps,
            status: PlanStatus::Draft,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// 依赖已失败或被跳过的待执行步骤标为 skipped；返回被跳过的序号
    pub fn skip_blocked(&mut self) -> Vec<usize> {
        let mut skipped = Vec::new();
        for i in 0..self.steps.len() {
            if self.steps[i].status != StepStatus::Pending {
                continue;
            }
            let blocker = self.steps[i].depends_on.iter().copied().find(|dep| {
                matches!(
                    self.steps.get(*dep).map(|s| s.status),
                    Some(StepStatus::Failed) | Some(StepStatus::Skipped)
                )
            });
            if let Some(dep) = blocker {
                let step = &mut self.steps[i];
                step.status = StepStatus::Skipped;
                step.error = Some(format!("dependency step {} did not succeed", dep));
                skipped.push(i);
            }
        }
        skipped
    }

    /// 序号最小、依赖全部 succeeded 的待执行步骤
    pub fn next_runnable(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| {
                s.status == StepStatus::Pending
                    && s.depends_on.iter().all(|dep| {
                        self.steps.get(*dep).map(|d| d.status) == Some(StepStatus::Succeeded)
                    })
            })
            .map(|s| s.index)
    }

    /// 按步骤状态重新推导计划状态（只在 approved / executing 时生效）
    pub fn derive_status(&mut self) -> PlanStatus {
        if matches!(self.status, PlanStatus::Approved | PlanStatus::Executing) {
            if self
                .steps
                .iter()
                .any(|s| s.required && s.status == StepStatus::Failed)
            {
                self.status = PlanStatus::Failed;
            } else if self
                .steps
                .iter()
                .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped))
            {
                self.status = PlanStatus::Completed;
            }
        }
        self.status
    }

    /// 未结束的步骤全部跳过（取消时使用）
    pub fn skip_unfinished(&mut self, reason: &str) {
        for step in &mut self.steps {
            if !step.status.is_done() {
                step.status = StepStatus::Skipped;
                step.error = Some(reason.to_string());
            }
        }
    }

    /// (已结束步骤数, 总步骤数)
    pub fn progress(&self) -> (usize, usize) {
        let done = self.steps.iter().filter(|s| s.status.is_done()).count();
        (done, self.steps.len())
    }

    /// 给用户审批用的计划预览
    pub fn preview(&self) -> String {
        let mut lines = vec![
            format!("Plan: {}", self.title),
            format!("ID: {}  Status: {}", self.id, self.status),
            format!("Steps ({}):", self.steps.len()),
        ];
        for step in &self.steps {
            let mut line = format!("  {}. [{}] {}", step.index + 1, step.status, step.description);
            if !step.depends_on.is_empty() {
                let deps: Vec<String> = step.depends_on.iter().map(|d| (d + 1).to_string()).collect();
                line.push_str(&format!(" (after {})", deps.join(", ")));
            }
            if step.risk != Risk::Low {
                line.push_str(&format!(" [risk: {:?}]", step.risk).to_lowercase());
            }
            if !step.required {
                line.push_str(" [optional]");
            }
            lines.push(line);
            if let Some(outcome) = &step.expected_outcome {
                lines.push(format!("     expected: {}", outcome));
            }
            if let Some(err) = &step.error {
                lines.push(format!("     error: {}", err));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(steps: serde_json::Value) -> serde_json::Value {
        json!({"title": "Test", "steps": steps})
    }

    #[test]
    fn test_indices_are_contiguous_from_zero() {
        let plan = Plan::from_draft(
            &draft(json!([
                {"description": "a"},
                {"description": "b", "depends_on": [0]},
                {"description": "c", "depends_on": [0, 1]},
            ])),
            "req",
            20,
        )
        .unwrap();
        let indices: Vec<usize> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(plan.status, PlanStatus::Draft);
        assert!(plan.id.starts_with("plan_"));
    }

    #[test]
    fn test_index_gap_rejected() {
        let err = Plan::from_draft(
            &draft(json!([
                {"index": 0, "description": "a"},
                {"index": 2, "description": "b"},
            ])),
            "req",
            20,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedPlan(_)));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let err = Plan::from_draft(
            &draft(json!([
                {"description": "a"},
                {"description": "b", "depends_on": [2]},
                {"description": "c"},
            ])),
            "req",
            20,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedPlan(msg) if msg.contains("step 1")));
    }

    #[test]
    fn test_step_limits() {
        assert!(Plan::from_draft(&draft(json!([])), "req", 20).is_err());
        let many: Vec<_> = (0..5).map(|i| json!({"description": format!("s{}", i)})).collect();
        assert!(Plan::from_draft(&draft(json!(many)), "req", 4).is_err());
        assert!(Plan::from_draft(&json!({"steps": "nope"}), "req", 4).is_err());
    }

    #[test]
    fn test_missing_action_defaults_to_task() {
        let plan = Plan::from_draft(&draft(json!([{"description": "add a cube"}])), "req", 20).unwrap();
        assert_eq!(plan.steps[0].action.text(), Some("add a cube"));
        assert!(plan.steps[0].required);
    }

    #[test]
    fn test_status_derivation() {
        let mut plan = Plan::from_draft(
            &draft(json!([
                {"description": "a"},
                {"description": "b", "depends_on": [0]},
                {"description": "c", "required": false},
            ])),
            "req",
            20,
        )
        .unwrap();
        plan.status = PlanStatus::Executing;
        assert_eq!(plan.next_runnable(), Some(0));

        plan.steps[0].status = StepStatus::Failed;
        assert_eq!(plan.skip_blocked(), vec![1]);
        assert_eq!(plan.next_runnable(), Some(2));
        assert_eq!(plan.derive_status(), PlanStatus::Failed);
    }

    #[test]
    fn test_completed_when_all_succeeded_or_skipped() {
        let mut plan = Plan::from_draft(
            &draft(json!([{"description": "a"}, {"description": "b", "required": false}])),
            "req",
            20,
        )
        .unwrap();
        plan.status = PlanStatus::Executing;
        plan.steps[0].status = StepStatus::Succeeded;
        assert_eq!(plan.derive_status(), PlanStatus::Executing);
        plan.steps[1].status = StepStatus::Skipped;
        assert_eq!(plan.derive_status(), PlanStatus::Completed);
    }

    #[test]
    fn test_preview_lists_steps() {
        let plan = Plan::from_draft(
            &draft(json!([
                {"description": "model the walls", "risk": "medium"},
                {"description": "add lights", "depends_on": [0], "required": false},
            ])),
            "build a room",
            20,
        )
        .unwrap();
        let preview = plan.preview();
        assert!(preview.contains("Plan: Test"));
        assert!(preview.contains("1. [pending] model the walls [risk: medium]"));
        assert!(preview.contains("2. [pending] add lights (after 1) [optional]"));
    }
}
