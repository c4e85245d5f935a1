//! Hive - 多 Agent 任务协调核心
//!
//! 模块划分：
//! - **agent**: 派生 Agent 档案、状态机与阻塞等待
//! - **collaborators**: 外接顾问（质量门 / 升级诊断 / 复盘，OpenAI 兼容或 Mock）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与可取消调用
//! - **observability**: tracing 初始化
//! - **orchestrator**: 顺序编排、工作区、响应合并与系统装配
//! - **registry**: 任务注册表、可替换取消令牌、活动日志
//! - **routing**: 插入消息分类与共享消息流切片
//! - **supervisor**: 看门狗巡检与三段式升级

pub mod agent;
pub mod collaborators;
pub mod config;
pub mod core;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod routing;
pub mod supervisor;

pub use crate::core::error::CoordError;
pub use orchestrator::{AgentExecutor, Coordinator, CoordinatorBuilder, Orchestrator};
pub use registry::TaskRegistry;
