//! SpawnedAgent：单个受监管 Agent 的状态与描述
//!
//! 状态机：Pending → Running → {Blocked ⇄ Running} → {Completed | Failed}。
//! Blocked 表示等待用户输入，定义上不算卡死，监管器会跳过。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::conversation::Conversation;

/// Agent 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// 等待执行（顺序管线中排队）
    Pending,
    /// 正在执行
    Running,
    /// 等待用户输入（不参与卡死检测）
    Blocked,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 模型角色：决定看门狗的宽限档位（慢而强的模型给更长宽限）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// 深度推理模型（慢、强）
    Reasoner,
    /// 常规对话模型
    Chat,
    /// 轻量快速模型
    Lite,
}

impl Default for ModelRole {
    fn default() -> Self {
        Self::Chat
    }
}

/// Agent 任务描述：编排器据此创建 SpawnedAgent；
/// 升级协作方的 Rewrite / Decompose 也返回这个类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// 要完成的工作描述
    pub task: String,
    /// 简短主题标签（合并响应时作为小节标题）
    pub topic: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub selected_tool_ids: Vec<String>,
    /// 共享消息流中分配给该 Agent 的下标
    #[serde(default)]
    pub relevant_message_indices: Vec<usize>,
    #[serde(default)]
    pub model_role: ModelRole,
    /// 续接上一个 Agent 的工作：复用其工作区并注入进展摘要
    #[serde(default)]
    pub continues_previous: bool,
}

impl AgentDescriptor {
    pub fn new(task: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            topic: topic.into(),
            system_prompt: String::new(),
            selected_tool_ids: Vec::new(),
            relevant_message_indices: Vec::new(),
            model_role: ModelRole::default(),
            continues_previous: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tool_ids: Vec<String>) -> Self {
        self.selected_tool_ids = tool_ids;
        self
    }

    pub fn with_message_indices(mut self, indices: Vec<usize>) -> Self {
        self.relevant_message_indices = indices;
        self
    }

    pub fn with_model_role(mut self, role: ModelRole) -> Self {
        self.model_role = role;
        self
    }

    pub fn with_continuation(mut self) -> Self {
        self.continues_previous = true;
        self
    }
}

/// 单个受监管 Agent
pub struct SpawnedAgent {
    /// Agent ID
    pub id: String,
    /// 工作描述
    pub task: String,
    /// 主题标签
    pub topic: String,
    pub system_prompt: String,
    /// 可用工具列表（运行期可增长）
    pub selected_tool_ids: Vec<String>,
    pub relevant_message_indices: Vec<usize>,
    pub model_role: ModelRole,
    pub status: AgentStatus,
    /// 私有对话缓冲
    pub conversation: Conversation,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    /// 最终回复
    pub result: Option<String>,
    /// 失败信息
    pub error: Option<String>,
}

impl SpawnedAgent {
    pub fn from_descriptor(descriptor: &AgentDescriptor) -> Self {
        Self {
            id: format!("agent_{}", uuid::Uuid::new_v4()),
            task: descriptor.task.clone(),
            topic: descriptor.topic.clone(),
            system_prompt: descriptor.system_prompt.clone(),
            selected_tool_ids: descriptor.selected_tool_ids.clone(),
            relevant_message_indices: descriptor.relevant_message_indices.clone(),
            model_role: descriptor.model_role,
            status: AgentStatus::Pending,
            conversation: Conversation::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            result: None,
            error: None,
        }
    }

    /// 动态追加工具权限（去重）
    pub fn grant_tool(&mut self, tool_id: impl Into<String>) {
        let tool_id = tool_id.into();
        if !self.selected_tool_ids.contains(&tool_id) {
            self.selected_tool_ids.push(tool_id);
        }
    }
}

/// Agent 管理器：所有 SpawnedAgent 的单一去处，闭包式可变访问
pub struct AgentManager {
    agents: RwLock<HashMap<String, SpawnedAgent>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, agent: SpawnedAgent) -> String {
        let id = agent.id.clone();
        self.agents.write().await.insert(id.clone(), agent);
        id
    }

    /// 闭包式可变访问（锁内完成，避免外泄引用）
    pub async fn with_agent<F, R>(&self, agent_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut SpawnedAgent) -> R,
    {
        let mut agents = self.agents.write().await;
        agents.get_mut(agent_id).map(f)
    }

    pub async fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.read().await.get(agent_id).map(|a| a.status)
    }

    /// 状态迁移；终态后不再变更，返回是否生效
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) if !agent.status.is_terminal() => {
                agent.status = status;
                true
            }
            _ => false,
        }
    }

    /// Blocked → Running（用户回复送达时调用）
    pub async fn resume(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) if agent.status == AgentStatus::Blocked => {
                agent.status = AgentStatus::Running;
                true
            }
            _ => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}
