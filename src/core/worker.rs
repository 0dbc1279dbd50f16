//! 后台工作槽：每个会话最多一个在途任务
//!
//! dispatch 把任务 spawn 到 tokio 上，结果经 oneshot 送回；前台用 poll 非阻塞地检查结果。
//! 每个任务带 CancellationToken 与截止时间：取消或超时后任务被分离，迟到的结果直接丢弃。
//! 无论哪条退出路径，槽都会被释放（poll 取到结果、cancel、超时、Drop）。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::core::{CoreError, Result};

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WorkerId(u64);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

impl WorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// poll 的结果
#[derive(Debug)]
pub enum WorkerPoll<T> {
    /// 槽空闲
    Idle,
    Pending,
    Ready(Result<T>),
    TimedOut { label: String, after: Duration },
}

struct ActiveJob<T> {
    id: WorkerId,
    label: String,
    rx: oneshot::Receiver<Result<T>>,
    token: CancellationToken,
    started: Instant,
    deadline: Instant,
}

pub struct WorkerSlot<T> {
    active: Option<ActiveJob<T>>,
}

impl<T> Default for WorkerSlot<T> {
    fn default() -> Self {
        Self { active: None }
    }
}

impl<T: Send + 'static> WorkerSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派发后台任务；已有在途任务时返回 Busy
    ///
    /// make 拿到本任务的取消令牌，可在长任务内部自行检查。
    pub fn dispatch<F, Fut>(&mut self, label: &str, timeout: Duration, make: F) -> Result<WorkerId>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.active.is_some() {
            return Err(CoreError::Busy);
        }
        let id = WorkerId::next();
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let job = make(token.clone());
        let job_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = job_token.cancelled() => {}
                result = job => {
                    // 接收端已被丢弃时结果作废
                    let _ = tx.send(result);
                }
            }
        });

        let now = Instant::now();
        tracing::debug!(worker = %id, label, timeout_ms = timeout.as_millis() as u64, "worker dispatched");
        self.active = Some(ActiveJob {
            id,
            label: label.to_string(),
            rx,
            token,
            started: now,
            deadline: now + timeout,
        });
        Ok(id)
    }

    /// 非阻塞地检查在途任务
    pub fn poll(&mut self) -> WorkerPoll<T> {
        let Some(job) = self.active.as_mut() else {
            return WorkerPoll::Idle;
        };
        match job.rx.try_recv() {
            Ok(result) => {
                tracing::debug!(
                    worker = %job.id,
                    label = %job.label,
                    elapsed_ms = job.started.elapsed().as_millis() as u64,
                    "worker finished"
                );
                self.release();
                WorkerPoll::Ready(result)
            }
            Err(TryRecvError::Empty) if Instant::now() >= job.deadline => {
                let label = job.label.clone();
                let after = job.deadline.duration_since(job.started);
                tracing::warn!(worker = %job.id, label = %label, "worker deadline exceeded");
                job.token.cancel();
                self.release();
                WorkerPoll::TimedOut { label, after }
            }
            Err(TryRecvError::Empty) => WorkerPoll::Pending,
            Err(TryRecvError::Closed) => {
                let label = job.label.clone();
                self.release();
                WorkerPoll::Ready(Err(CoreError::Cancelled(format!(
                    "{} worker stopped without a result",
                    label
                ))))
            }
        }
    }

    /// 取消并分离在途任务；没有任务时返回 false
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(job) => {
                tracing::info!(worker = %job.id, label = %job.label, "worker cancelled");
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    fn release(&mut self) {
        self.active = None;
    }
}

impl<T> Drop for WorkerSlot<T> {
    fn drop(&mut self) {
        if let Some(job) = self.active.take() {
            job.token.cancel();
        }
    }
}
