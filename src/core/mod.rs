//! 核心编排层：错误与恢复、环境快照、后台工作槽、状态投影、共享资源、主控状态机

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod services;
pub mod snapshot;
pub mod state;
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use error::{CoreError, ErrorKind, RecoveryAction, Result};
pub use orchestrator::{create_orchestrator, Orchestrator};
pub use recovery::{RecoveryEngine, RetryPolicy};
pub use services::Services;
pub use snapshot::{SceneObject, Snapshot};
pub use state::{Outcome, Phase, SessionView, Stage};
pub use worker::{WorkerId, WorkerPoll, WorkerSlot};
