//! 任务注册表层：任务数据模型、可替换取消令牌与单写者存储

pub mod store;
pub mod task;

pub use store::{RunContext, RunFn, RunFuture, TaskNotification, TaskRegistry};
pub use task::{
    ActivityEntry, ActivityLog, RunOutcome, SpawnSpec, Task, TaskId, TaskSnapshot, TaskStatus,
    WatchdogPhase, RECENT_ACTIVITY_CAP,
};
