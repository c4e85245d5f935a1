//! 监管状态报告与对外回调
//!
//! 监管器对外只有这三个出口：注入提醒、上报中止、状态报告。
//! 它从不自己调用生成接口。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 报告档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// 本轮有进展
    Progressing,
    /// 本轮无进展但未到阈值
    Slow,
    /// 已卡住（本轮发出提醒）
    Stuck,
    /// 已中止 / 已强杀
    Aborted,
}

/// 一份状态报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub agent_id: String,
    pub topic: String,
    pub status: ReportStatus,
    pub message: String,
    /// 从开始监管起的耗时（毫秒）
    pub elapsed_ms: u64,
}

/// 监管器对宿主的回调
#[async_trait]
pub trait SupervisorHooks: Send + Sync {
    /// 请宿主把一条消息投递进该 Agent 的对话
    async fn on_inject_message(&self, agent_id: &str, message: &str);

    /// 某个 Agent 被看门狗中止 / 强杀
    async fn on_abort_agent(&self, agent_id: &str, reason: &str);

    /// 周期状态报告
    async fn on_status_report(&self, report: StatusReport);
}

/// 空回调实现（宿主不关心回调时使用）
pub struct NoopHooks;

#[async_trait]
impl SupervisorHooks for NoopHooks {
    async fn on_inject_message(&self, _agent_id: &str, _message: &str) {}
    async fn on_abort_agent(&self, _agent_id: &str, _reason: &str) {}
    async fn on_status_report(&self, _report: StatusReport) {}
}
