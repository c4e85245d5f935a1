//! 消息路由：共享消息流的按 Agent 切片
//!
//! 把共享历史里的消息下标分配给具体 Agent，每个 Agent 只看到
//! 分给自己的那部分，顺序保持原样；兄弟 Agent 的消息互不可见。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agent::Message;

/// 一条分配记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: String,
    pub topic: String,
}

/// 消息路由器：下标 → (agent, topic)
pub struct MessageRouter {
    assignments: RwLock<HashMap<usize, Assignment>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// 把共享流中的一个下标分配给 Agent（重复分配以后者为准）
    pub async fn assign_message(&self, index: usize, agent_id: &str, topic: &str) {
        self.assignments.write().await.insert(
            index,
            Assignment {
                agent_id: agent_id.to_string(),
                topic: topic.to_string(),
            },
        );
    }

    /// 查询某个下标的归属
    pub async fn assignment(&self, index: usize) -> Option<Assignment> {
        self.assignments.read().await.get(&index).cloned()
    }

    /// 过滤出分配给该 Agent 的消息，保持原始顺序
    pub async fn messages_for_agent(&self, agent_id: &str, history: &[Message]) -> Vec<Message> {
        let assignments = self.assignments.read().await;
        history
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                assignments
                    .get(index)
                    .map(|a| a.agent_id == agent_id)
                    .unwrap_or(false)
            })
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub async fn assigned_count(&self) -> usize {
        self.assignments.read().await.len()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<Message> {
        vec![
            Message::user("build the backend"),     // 0
            Message::user("make the ui pretty"),    // 1
            Message::user("backend should use db"), // 2
            Message::user("unassigned note"),       // 3
            Message::user("ui needs dark mode"),    // 4
        ]
    }

    #[tokio::test]
    async fn test_filter_preserves_order() {
        let router = MessageRouter::new();
        router.assign_message(0, "agent_be", "backend").await;
        router.assign_message(1, "agent_ui", "ui").await;
        router.assign_message(2, "agent_be", "backend").await;
        router.assign_message(4, "agent_ui", "ui").await;

        let h = history();
        let be = router.messages_for_agent("agent_be", &h).await;
        assert_eq!(be.len(), 2);
        assert_eq!(be[0].content, "build the backend");
        assert_eq!(be[1].content, "backend should use db");

        let ui = router.messages_for_agent("agent_ui", &h).await;
        assert_eq!(ui.len(), 2);
        assert_eq!(ui[0].content, "make the ui pretty");
        assert_eq!(ui[1].content, "ui needs dark mode");
    }

    #[tokio::test]
    async fn test_unassigned_messages_invisible() {
        let router = MessageRouter::new();
        router.assign_message(0, "agent_a", "a").await;

        let h = history();
        let a = router.messages_for_agent("agent_a", &h).await;
        assert_eq!(a.len(), 1);

        let b = router.messages_for_agent("agent_b", &h).await;
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_reassignment_moves_message() {
        let router = MessageRouter::new();
        router.assign_message(0, "agent_a", "a").await;
        router.assign_message(0, "agent_b", "b").await;

        let h = history();
        assert!(router.messages_for_agent("agent_a", &h).await.is_empty());
        assert_eq!(router.messages_for_agent("agent_b", &h).await.len(), 1);

        let assignment = router.assignment(0).await.unwrap();
        assert_eq!(assignment.topic, "b");
    }
}
