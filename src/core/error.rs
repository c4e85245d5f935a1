//! 协调核心错误类型
//!
//! 取消（Cancelled）与普通执行失败（ExecutionFailed）严格区分：
//! 看门狗中止走 Cancelled，编排层据此决定是否进入诊断流程。

use thiserror::Error;

/// 任务协调过程中可能出现的错误（启动、执行、取消、阻塞等待、协作方）
#[derive(Error, Debug)]
pub enum CoordError {
    /// 当前取消令牌已触发（看门狗中止或上层主动取消）
    #[error("Task cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// 工作区 / 对话播种等启动阶段失败，仅影响该 Agent
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// 阻塞等待用户回复超时
    #[error("Blocked wait timed out after {0}s")]
    WaitTimeout(u64),

    /// 质量门/升级/反思协作方调用失败；编排层按直通（pass-through）处理
    #[error("Collaborator error: {0}")]
    CollaboratorError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordError {
    /// 是否为取消类错误（与执行失败区分，用于看门狗诊断路径）
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
