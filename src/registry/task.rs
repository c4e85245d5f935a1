//! 任务数据模型
//!
//! 一个 Task 对应一份被监管的长任务执行：携带注入队列、环形活动日志、
//! 看门狗阶段与「当前」取消令牌。令牌在阶段 2 会被整体替换，
//! 任何持有方都必须通过注册表按 id 重新获取，不得缓存。

use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// 任务 ID
pub type TaskId = String;

/// 环形活动日志容量：只保留最近这么多条
pub const RECENT_ACTIVITY_CAP: usize = 15;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 刚创建、尚未开始执行
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败（含被取消 / 被强杀）
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 看门狗阶段：0 正常，1 已提醒，2 已中止（换新令牌、待诊断），3 已强杀
pub type WatchdogPhase = u8;

/// 一条活动记录（短标签 + 毫秒时间戳）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: i64,
    pub label: String,
}

/// 环形活动日志：超出容量时静默丢弃最旧条目
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityLog {
    entries: Vec<ActivityEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>) {
        self.entries.push(ActivityEntry {
            at: chrono::Utc::now().timestamp_millis(),
            label: label.into(),
        });
        if self.entries.len() > RECENT_ACTIVITY_CAP {
            let excess = self.entries.len() - RECENT_ACTIVITY_CAP;
            self.entries.drain(..excess);
        }
    }

    pub fn entries(&self) -> &[ActivityEntry] {
        &self.entries
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 执行函数的正常返回：最终回复、工作日志与可选的升级信号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// 用户可见的最终回复
    pub response: String,
    /// 执行过程的完整工作日志（环形日志之外的全量记录）
    #[serde(default)]
    pub work_log: Vec<String>,
    /// 执行方自报的升级原因；Some 时编排层咨询升级协作方
    #[serde(default)]
    pub escalation: Option<String>,
}

impl RunOutcome {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            work_log: Vec::new(),
            escalation: None,
        }
    }

    pub fn with_work_log(mut self, log: Vec<String>) -> Self {
        self.work_log = log;
        self
    }

    pub fn with_escalation(mut self, reason: impl Into<String>) -> Self {
        self.escalation = Some(reason.into());
        self
    }
}

/// 创建任务的参数
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// 设备 ID（路由维度）
    pub device_id: String,
    pub user_id: String,
    /// 人格/角色 ID（可选，透传给执行函数）
    pub persona_id: Option<String>,
    /// 短名称
    pub name: String,
    /// 任务描述
    pub description: String,
}

impl SpawnSpec {
    pub fn new(
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            persona_id: None,
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn with_persona(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = Some(persona_id.into());
        self
    }
}

/// 注册表内的任务记录
pub struct Task {
    pub id: TaskId,
    pub device_id: String,
    pub user_id: String,
    pub persona_id: Option<String>,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    /// 待注入消息（FIFO，仅 Running 期间可变）
    pub injection_queue: Vec<String>,
    /// 当前取消令牌（阶段 2 整体替换）
    pub(super) cancel_token: CancellationToken,
    /// 最近活动时间（毫秒时间戳）
    pub last_activity_at: i64,
    /// 环形活动日志
    pub recent_activity: ActivityLog,
    pub watchdog_phase: WatchdogPhase,
    /// 工具调用计数（比对话长度更细的进展信号）
    pub tool_call_count: u64,
    pub last_tool_activity_at: Option<i64>,
    /// 是否进入过工具循环（区分「从未启动」与「执行中卡住」）
    pub tool_loop_started: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// 最终回复
    pub result: Option<String>,
    /// 失败信息
    pub error: Option<String>,
    /// 失败是否由取消引起（看门狗中止 / 强杀）
    pub was_cancelled: bool,
    pub(super) outcome: Option<RunOutcome>,
    pub(super) join: Option<JoinHandle<()>>,
    pub(super) abort: Option<AbortHandle>,
}

impl Task {
    pub fn new(spec: SpawnSpec) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            device_id: spec.device_id,
            user_id: spec.user_id,
            persona_id: spec.persona_id,
            name: spec.name,
            description: spec.description,
            status: TaskStatus::Pending,
            injection_queue: Vec::new(),
            cancel_token: CancellationToken::new(),
            last_activity_at: now,
            recent_activity: ActivityLog::new(),
            watchdog_phase: 0,
            tool_call_count: 0,
            last_tool_activity_at: None,
            tool_loop_started: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            was_cancelled: false,
            outcome: None,
            join: None,
            abort: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 只读快照（可序列化，供状态查询与回调使用）
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            persona_id: self.persona_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            status: self.status,
            pending_injections: self.injection_queue.len(),
            last_activity_at: self.last_activity_at,
            recent_activity: self.recent_activity.clone(),
            watchdog_phase: self.watchdog_phase,
            tool_call_count: self.tool_call_count,
            last_tool_activity_at: self.last_tool_activity_at,
            tool_loop_started: self.tool_loop_started,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
            was_cancelled: self.was_cancelled,
        }
    }
}

/// 任务只读快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub device_id: String,
    pub user_id: String,
    pub persona_id: Option<String>,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub pending_injections: usize,
    pub last_activity_at: i64,
    pub recent_activity: ActivityLog,
    pub watchdog_phase: WatchdogPhase,
    pub tool_call_count: u64,
    pub last_tool_activity_at: Option<i64>,
    pub tool_loop_started: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub was_cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_log_keeps_most_recent() {
        let mut log = ActivityLog::new();
        for i in 0..20 {
            log.push(format!("activity {}", i));
        }

        assert_eq!(log.len(), RECENT_ACTIVITY_CAP);
        let labels = log.labels();
        assert_eq!(labels.first().unwrap(), "activity 5");
        assert_eq!(labels.last().unwrap(), "activity 19");
        // 中间顺序不乱
        assert_eq!(labels[7], "activity 12");
    }

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new(SpawnSpec::new("device_1", "user_1", "demo", "do a thing"));
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.watchdog_phase, 0);
        assert!(task.injection_queue.is_empty());
        assert!(!task.cancel_token.is_cancelled());
        assert!(!task.tool_loop_started);
    }
}
