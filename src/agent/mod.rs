//! Agent 层：SpawnedAgent 状态机、私有对话与阻塞等待

pub mod conversation;
pub mod spawned;
pub mod wait;

pub use conversation::{Conversation, Message, Role};
pub use spawned::{AgentDescriptor, AgentManager, AgentStatus, ModelRole, SpawnedAgent};
pub use wait::WaitRegistry;
