//! 任务注册表
//!
//! 进程内所有在途任务的唯一去处。全部修改都走注册表的写锁，
//! 保证活动追加与令牌替换整体有序（单写者纪律）。
//!
//! 核心操作：
//! - spawn：创建 Running 任务并启动执行函数
//! - record_activity / inject：仅 Running 期间生效，终态冻结
//! - escalate_abort：阶段 2，取消旧令牌并换新（旧令牌永久保持已取消）
//! - kill：阶段 3，对无视取消的僵尸任务强制终止

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::error::CoordError;

use super::task::{RunOutcome, SpawnSpec, Task, TaskId, TaskSnapshot, TaskStatus};

/// 执行函数返回的装箱 Future
pub type RunFuture = BoxFuture<'static, Result<RunOutcome, CoordError>>;

/// 执行函数：拿到 RunContext 后产出执行 Future
pub type RunFn = Box<dyn FnOnce(RunContext) -> RunFuture + Send>;

/// 任务终态通知
#[derive(Debug, Clone)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub device_id: String,
    pub user_id: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// 交给执行函数的上下文：只认任务 id，令牌每次用时重新取
#[derive(Clone)]
pub struct RunContext {
    pub task_id: TaskId,
    registry: Arc<TaskRegistry>,
}

impl RunContext {
    /// 当前取消令牌（阶段 2 换新后取到的就是新令牌）
    pub async fn current_token(&self) -> Option<CancellationToken> {
        self.registry.current_token(&self.task_id).await
    }

    /// 当前令牌是否已取消；任务不存在视为已取消
    pub async fn is_cancelled(&self) -> bool {
        match self.current_token().await {
            Some(token) => token.is_cancelled(),
            None => true,
        }
    }

    /// 用「当前」令牌保护一次异步操作（安全点的标准写法）
    pub async fn run_guarded<T, F>(&self, operation: F) -> Result<T, CoordError>
    where
        F: std::future::Future<Output = Result<T, CoordError>>,
    {
        let token = self
            .current_token()
            .await
            .ok_or_else(|| CoordError::TaskNotFound(self.task_id.clone()))?;
        crate::core::cancellable::run_cancellable(&token, operation).await
    }

    pub async fn record_activity(&self, label: impl Into<String>) {
        self.registry.record_activity(&self.task_id, label).await;
    }

    pub async fn record_tool_activity(&self) {
        self.registry.record_tool_activity(&self.task_id).await;
    }

    pub async fn mark_tool_loop_started(&self) {
        self.registry.mark_tool_loop_started(&self.task_id).await;
    }

    /// 取走全部待注入消息（FIFO）
    pub async fn drain_injections(&self) -> Vec<String> {
        self.registry.drain_injections(&self.task_id).await
    }
}

/// 任务注册表
pub struct TaskRegistry {
    /// 所有任务
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// 设备任务索引
    device_tasks: RwLock<HashMap<String, Vec<TaskId>>>,
    /// 终态通知发送器
    notification_tx: mpsc::UnboundedSender<TaskNotification>,
}

impl TaskRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskNotification>) {
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tasks: RwLock::new(HashMap::new()),
                device_tasks: RwLock::new(HashMap::new()),
                notification_tx,
            }),
            notification_rx,
        )
    }

    /// 创建任务并立即开始执行
    ///
    /// 返回时任务已是 Running：注入队列为空、看门狗阶段 0、令牌未取消。
    /// 执行函数正常返回则 Completed，出错则 Failed 并记下错误信息。
    pub async fn spawn(self: &Arc<Self>, spec: SpawnSpec, run_fn: RunFn) -> TaskSnapshot {
        let mut task = Task::new(spec);
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now().timestamp_millis());

        let task_id = task.id.clone();
        let device_id = task.device_id.clone();
        let snapshot = task.snapshot();

        self.tasks.write().await.insert(task_id.clone(), task);
        self.device_tasks
            .write()
            .await
            .entry(device_id)
            .or_default()
            .push(task_id.clone());

        let ctx = RunContext {
            task_id: task_id.clone(),
            registry: Arc::clone(self),
        };
        let registry = Arc::clone(self);
        let run_id = task_id.clone();
        let handle = tokio::spawn(async move {
            match run_fn(ctx).await {
                Ok(outcome) => registry.complete(&run_id, outcome).await,
                Err(e) => registry.fail(&run_id, &e).await,
            }
        });

        {
            let mut tasks = self.tasks.write().await;
            if let Some(t) = tasks.get_mut(&task_id) {
                t.abort = Some(handle.abort_handle());
                t.join = Some(handle);
            } else {
                // 任务在 spawn 间隙被清理，直接放弃执行
                handle.abort();
            }
        }

        tracing::info!(task_id = %task_id, "Task spawned");
        snapshot
    }

    /// 记录一条活动（仅 Running 生效）
    pub async fn record_activity(&self, task_id: &str, label: impl Into<String>) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.recent_activity.push(label);
                task.last_activity_at = chrono::Utc::now().timestamp_millis();
            }
        }
    }

    /// 记录一次工具调用（仅 Running 生效）
    pub async fn record_tool_activity(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                let now = chrono::Utc::now().timestamp_millis();
                task.tool_call_count += 1;
                task.last_tool_activity_at = Some(now);
                task.last_activity_at = now;
            }
        }
    }

    /// 标记已进入工具循环（快速中止路径据此区分「从未启动」）
    pub async fn mark_tool_loop_started(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.tool_loop_started = true;
                task.last_activity_at = chrono::Utc::now().timestamp_millis();
            }
        }
    }

    /// 向任务注入一条消息；仅 Running 时入队，返回是否入队
    pub async fn inject(&self, task_id: &str, message: impl Into<String>) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.injection_queue.push(message.into());
                true
            }
            _ => false,
        }
    }

    /// 取走全部待注入消息（FIFO；非 Running 返回空）
    pub async fn drain_injections(&self, task_id: &str) -> Vec<String> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Running => {
                std::mem::take(&mut task.injection_queue)
            }
            _ => Vec::new(),
        }
    }

    /// 当前取消令牌（每次用时调用，不要缓存）
    pub async fn current_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|t| t.cancel_token.clone())
    }

    /// 阶段 1：记下已提醒
    pub async fn mark_nudged(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running && task.watchdog_phase < 1 {
                task.watchdog_phase = 1;
            }
        }
    }

    /// 阶段 2：取消当前令牌并换上新令牌，返回新令牌
    ///
    /// 旧令牌保持永久已取消；此后按 id 取到的是未取消的新令牌。
    /// 仅对 Running 任务生效。
    pub async fn escalate_abort(&self, task_id: &str) -> Option<CancellationToken> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.cancel_token.cancel();
                let fresh = CancellationToken::new();
                task.cancel_token = fresh.clone();
                task.watchdog_phase = 2;
                tracing::warn!(task_id = %task_id, "Watchdog abort: token cancelled and replaced");
                Some(fresh)
            }
            _ => None,
        }
    }

    /// 阶段 3：强杀无视取消的任务
    ///
    /// 取消当前令牌、abort 底层执行、直接置 Failed。返回是否生效。
    pub async fn kill(&self, task_id: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let notification = {
            let mut tasks = self.tasks.write().await;
            let task = match tasks.get_mut(task_id) {
                Some(t) if !t.is_finished() => t,
                _ => return false,
            };

            task.cancel_token.cancel();
            if let Some(abort) = task.abort.take() {
                abort.abort();
            }
            task.status = TaskStatus::Failed;
            task.watchdog_phase = 3;
            task.was_cancelled = true;
            task.error = Some(reason.clone());
            task.completed_at = Some(chrono::Utc::now().timestamp_millis());

            TaskNotification {
                task_id: task.id.clone(),
                device_id: task.device_id.clone(),
                user_id: task.user_id.clone(),
                status: TaskStatus::Failed,
                result: None,
                error: task.error.clone(),
            }
        };

        tracing::warn!(task_id = %task_id, reason = %reason, "Task killed");
        let _ = self.notification_tx.send(notification);
        true
    }

    /// 正常完成（执行包装器调用）
    async fn complete(&self, task_id: &str, outcome: RunOutcome) {
        let notification = {
            let mut tasks = self.tasks.write().await;
            let task = match tasks.get_mut(task_id) {
                Some(t) if !t.is_finished() => t,
                _ => return,
            };

            task.status = TaskStatus::Completed;
            task.result = Some(outcome.response.clone());
            task.outcome = Some(outcome);
            task.completed_at = Some(chrono::Utc::now().timestamp_millis());

            TaskNotification {
                task_id: task.id.clone(),
                device_id: task.device_id.clone(),
                user_id: task.user_id.clone(),
                status: TaskStatus::Completed,
                result: task.result.clone(),
                error: None,
            }
        };

        tracing::info!(task_id = %task_id, "Task completed");
        let _ = self.notification_tx.send(notification);
    }

    /// 执行失败（执行包装器调用；kill 已置终态时保持 kill 的记录）
    async fn fail(&self, task_id: &str, error: &CoordError) {
        let notification = {
            let mut tasks = self.tasks.write().await;
            let task = match tasks.get_mut(task_id) {
                Some(t) if !t.is_finished() => t,
                _ => return,
            };

            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.was_cancelled = error.is_cancellation();
            task.completed_at = Some(chrono::Utc::now().timestamp_millis());

            TaskNotification {
                task_id: task.id.clone(),
                device_id: task.device_id.clone(),
                user_id: task.user_id.clone(),
                status: TaskStatus::Failed,
                result: None,
                error: task.error.clone(),
            }
        };

        tracing::warn!(task_id = %task_id, error = %error, "Task failed");
        let _ = self.notification_tx.send(notification);
    }

    /// 获取任务快照
    pub async fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.read().await.get(task_id).map(|t| t.snapshot())
    }

    /// 设备上 Running 任务数
    pub async fn active_count(&self, device_id: &str) -> usize {
        let tasks = self.tasks.read().await;
        let device_tasks = self.device_tasks.read().await;

        device_tasks
            .get(device_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        tasks
                            .get(*id)
                            .map(|t| t.status == TaskStatus::Running)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn has_active(&self, device_id: &str) -> bool {
        self.active_count(device_id).await > 0
    }

    /// 设备上最近活跃的 Running 任务（多任务路由策略的依据）
    pub async fn most_recent_active(&self, device_id: &str) -> Option<TaskSnapshot> {
        let tasks = self.tasks.read().await;
        let device_tasks = self.device_tasks.read().await;

        device_tasks
            .get(device_id)?
            .iter()
            .filter_map(|id| tasks.get(id))
            .filter(|t| t.status == TaskStatus::Running)
            .max_by_key(|t| t.last_activity_at)
            .map(|t| t.snapshot())
    }

    /// 等待任务结束并取回执行结果
    ///
    /// Completed → Ok(RunOutcome)；取消类失败 → Err(Cancelled)；
    /// 其他失败 → Err(ExecutionFailed)。
    pub async fn wait(&self, task_id: &str) -> Result<RunOutcome, CoordError> {
        let join = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                Some(task) => task.join.take(),
                None => return Err(CoordError::TaskNotFound(task_id.to_string())),
            }
        };

        if let Some(handle) = join {
            if let Err(e) = handle.await {
                // kill 走 abort，join 以 cancelled 结束；panic 则落到 fail 路径
                if !e.is_cancelled() {
                    self.fail(task_id, &CoordError::ExecutionFailed("task panicked".to_string()))
                        .await;
                }
            }
        }

        let tasks = self.tasks.read().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| CoordError::TaskNotFound(task_id.to_string()))?;

        if task.was_cancelled {
            return Err(CoordError::Cancelled);
        }
        match task.status {
            TaskStatus::Completed => task
                .outcome
                .clone()
                .ok_or_else(|| CoordError::ExecutionFailed("result unavailable".to_string())),
            TaskStatus::Failed => Err(CoordError::ExecutionFailed(
                task.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )),
            _ => Err(CoordError::ExecutionFailed(
                "task finished without result".to_string(),
            )),
        }
    }

    /// 清理已结束的旧任务，返回清理数量
    pub async fn cleanup_finished(&self, max_age_hours: u64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - (max_age_hours as i64 * 3600 * 1000);

        let mut tasks = self.tasks.write().await;
        let mut device_tasks = self.device_tasks.write().await;

        let old_ids: Vec<_> = tasks
            .iter()
            .filter(|(_, t)| t.is_finished() && t.completed_at.map(|c| c < cutoff).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &old_ids {
            if let Some(task) = tasks.remove(id) {
                if let Some(ids) = device_tasks.get_mut(&task.device_id) {
                    ids.retain(|tid| tid != id);
                }
            }
        }

        old_ids.len()
    }
}
