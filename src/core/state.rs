//! 状态定义：编排阶段、交互结果与会话视图投影
//!
//! 宿主 UI 只持有轻量的 SessionView（阶段、历史、输入锁、错误、待处理的澄清/计划）；
//! 完整状态由 Orchestrator 维护并投影到 SessionView。

use serde::Serialize;

use crate::clarify::ClarificationRequest;
use crate::core::ErrorKind;
use crate::memory::ConversationTurn;
use crate::planner::Plan;
use crate::service::ExecutionReport;

/// 后台任务所处的业务阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classifying,
    Clarifying,
    Planning,
    DirectExecuting,
    ExecutingPlan,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classifying => "classifying",
            Stage::Clarifying => "clarifying",
            Stage::Planning => "planning",
            Stage::DirectExecuting => "direct_executing",
            Stage::ExecutingPlan => "executing_plan",
        }
    }
}

/// 一次交互的最终结果
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// 问题的回答
    Answered { text: String },
    /// 简单任务已交给执行器
    Executed { report: ExecutionReport },
    ClarificationNeeded { request: ClarificationRequest },
    /// 计划已生成，等待审批
    PlanProposed { plan: Plan },
    /// 计划执行结束（completed / failed）
    PlanFinished { plan: Plan },
    Cancelled,
}

impl Outcome {
    /// 写入对话记忆的助手回复
    pub fn summary(&self) -> String {
        match self {
            Outcome::Answered { text } => text.clone(),
            Outcome::Executed { report } if report.success => "Done.".to_string(),
            Outcome::Executed { report } => format!(
                "The action failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ),
            Outcome::ClarificationNeeded { request } => request.prompt(),
            Outcome::PlanProposed { plan } => plan.preview(),
            Outcome::PlanFinished { plan } => {
                let (done, total) = plan.progress();
                format!("Plan '{}' {} ({}/{} steps).", plan.title, plan.status, done, total)
            }
            Outcome::Cancelled => "Cancelled.".to_string(),
        }
    }
}

/// 编排阶段：idle → classifying → {clarifying | planning | direct_executing | executing_plan} → polling → {done | errored}
///
/// 派发后台任务后立即进入 Polling，只有完成、出错、取消、超时才离开。
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Polling { stage: Stage },
    Done { outcome: Outcome },
    Errored { kind: ErrorKind, message: String },
}

impl Phase {
    pub fn is_polling(&self) -> bool {
        matches!(self, Phase::Polling { .. })
    }

    pub fn is_settled(&self) -> bool {
        !self.is_polling()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Phase::Done { outcome } => Some(outcome),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Polling { stage } => stage.as_str(),
            Phase::Done { .. } => "done",
            Phase::Errored { .. } => "errored",
        }
    }
}

/// UI 看到的「投影」状态，轻量且易于渲染
#[derive(Clone, Debug, Serialize)]
pub struct SessionView {
    pub phase: Phase,
    pub history: Vec<ConversationTurn>,
    pub input_locked: bool,
    pub error_message: Option<String>,
    pub pending_clarification: Option<String>,
    pub active_plan: Option<String>,
}
