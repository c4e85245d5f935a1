//! 工作区管理
//!
//! 每个 Agent 一个独立目录：<root>/<user_id>/<agent_id>/。
//! 续接任务复用上一个 Agent 的目录，并用进展摘要开场，不从零开始。
//! 运行日志 run_log.md 写入失败只记日志，不影响主流程。

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::core::error::CoordError;

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Agent 工作区路径（不创建目录）
    pub fn agent_dir(&self, user_id: &str, agent_id: &str) -> PathBuf {
        self.root.join(user_id).join(agent_id)
    }

    /// 创建 Agent 工作区并返回路径
    pub async fn prepare(&self, user_id: &str, agent_id: &str) -> Result<PathBuf, CoordError> {
        let dir = self.agent_dir(user_id, agent_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoordError::SetupFailed(format!("workspace {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    /// 把一次运行的始末写成 run_log.md
    pub async fn write_run_log(
        &self,
        dir: &Path,
        topic: &str,
        task: &str,
        response: &str,
        work_log: &[String],
    ) -> std::io::Result<()> {
        let mut content = format!(
            "# {}\n\n{}\n\n## Task\n\n{}\n\n## Response\n\n{}\n",
            topic,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            task,
            response
        );
        if !work_log.is_empty() {
            content.push_str("\n## Work log\n\n");
            for line in work_log {
                content.push_str(&format!("- {}\n", line));
            }
        }

        fs::write(dir.join("run_log.md"), content).await
    }
}

/// 给续接 Agent 的开场上下文：上一步做了什么、做到哪了
pub fn continuation_summary(prev_topic: &str, prev_response: &str, prev_log: &[String]) -> String {
    let mut summary = format!(
        "You are continuing earlier work on \"{}\". Its result so far:\n\n{}\n",
        prev_topic, prev_response
    );
    if !prev_log.is_empty() {
        summary.push_str("\nSteps already taken:\n");
        for line in prev_log {
            summary.push_str(&format!("- {}\n", line));
        }
    }
    summary.push_str("\nPick up from there; do not redo finished steps.");
    summary
}
