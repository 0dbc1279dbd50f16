//! 核心错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 CoreError 决定退避重试 / 直接上报 / 终止。
//! 每个公开操作都返回显式的 Result，分类器、澄清器、规划器的错误不会让编排器崩溃。

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 错误分类（供上层渲染用户可读的提示、决定是否重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ServiceUnavailable,
    MalformedPlan,
    MalformedResponse,
    InvalidStateTransition,
    PlanNotFound,
    Busy,
    Timeout,
    Cancelled,
    InvalidInput,
    Io,
}

/// 编排核心运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum CoreError {
    /// 外部 AI 服务 / 网络失败（可退避重试，次数有限）
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// 调用方误用计划状态机（编程错误，始终上报）
    #[error("Invalid state transition on plan {plan_id}: cannot {action} while {from}")]
    InvalidStateTransition {
        plan_id: String,
        from: String,
        action: String,
    },

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Busy: a request is already in flight for this session")]
    Busy,

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            CoreError::MalformedPlan(_) => ErrorKind::MalformedPlan,
            CoreError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            CoreError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            CoreError::PlanNotFound(_) => ErrorKind::PlanNotFound,
            CoreError::Busy => ErrorKind::Busy,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            CoreError::Io(_) | CoreError::Json(_) => ErrorKind::Io,
        }
    }

    /// 仅 ServiceUnavailable 属于瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::ServiceUnavailable(_))
    }

    pub(crate) fn invalid_transition(
        plan_id: &str,
        from: impl std::fmt::Display,
        action: &str,
    ) -> Self {
        CoreError::InvalidStateTransition {
            plan_id: plan_id.to_string(),
            from: from.to_string(),
            action: action.to_string(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        CoreError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待后用同样的输入重试
    RetryAfter(Duration),
    /// 上报给用户（附带可读提示）
    Surface(String),
    /// 终止当前操作，不再提示
    Abort,
}
