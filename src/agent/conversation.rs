//! Agent 私有对话缓冲
//!
//! 每个 SpawnedAgent 持有一份独立的消息列表：由消息路由播种、执行循环追加，
//! 兄弟 Agent 之间互不可见。长度增长是监管器的进展信号之一。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Agent 私有对话：播种后只增不删，完整保留供运行日志与反思使用
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用路由筛选出的历史切片播种
    pub fn seeded(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最后一条 Assistant 消息（续接摘要用）
    pub fn last_assistant(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_preserves_order() {
        let conv = Conversation::seeded(vec![
            Message::user("first"),
            Message::assistant("second"),
            Message::user("third"),
        ]);
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.messages()[0].content, "first");
        assert_eq!(conv.messages()[2].content, "third");
    }

    #[test]
    fn test_last_assistant() {
        let mut conv = Conversation::new();
        assert!(conv.last_assistant().is_none());

        conv.push(Message::assistant("draft"));
        conv.push(Message::user("feedback"));
        conv.push(Message::assistant("final"));
        assert_eq!(conv.last_assistant(), Some("final"));
    }
}
