//! 协作方：编排器外聘的三类 LLM 顾问
//!
//! - QualityGate：终稿质检（pass / cleaned / rerun / abort）
//! - Escalator：失败升级诊断（rewrite / decompose / abort）
//! - Reflector：运行后复盘，纯旁路，失败不影响主流程
//!
//! 编排器只面向 trait，生产环境由 OpenAI 兼容后端实现，无 Key 时落到 Mock。

pub mod mock;
pub mod openai;

pub use mock::{MockEscalator, MockQualityGate, MockReflector};
pub use openai::OpenAiCollaborator;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentDescriptor, ModelRole};
use crate::config::AppConfig;
use crate::core::error::CoordError;

/// 质量门结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    /// 原样放行
    Pass,
    /// 放行精修稿
    Cleaned,
    /// 打回重跑（硬上限一次）
    Rerun,
    /// 放弃，用 abort_message 作为最终回复
    Abort,
}

/// 质量门的评审请求
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub agent_id: String,
    /// 原始任务描述
    pub task: String,
    /// 待评审的最终回复
    pub response: String,
    /// 是否已是重跑产物（重跑只允许一次）
    pub is_retry: bool,
}

/// 质量门的评审结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReview {
    pub verdict: GateVerdict,
    /// verdict 为 cleaned 时的精修稿
    #[serde(default)]
    pub cleaned: Option<String>,
    /// verdict 为 abort 时给用户的最终话术
    #[serde(default)]
    pub abort_message: Option<String>,
}

impl GateReview {
    pub fn pass() -> Self {
        Self {
            verdict: GateVerdict::Pass,
            cleaned: None,
            abort_message: None,
        }
    }
}

/// 升级诊断请求：带上失败 Agent 的完整上下文
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub agent_id: String,
    pub topic: String,
    /// 原始任务描述
    pub task: String,
    /// 升级原因（看门狗中止 / 执行方自报）
    pub reason: String,
    /// 失败前的工作日志
    pub work_log: Vec<String>,
    pub system_prompt: String,
    pub tool_ids: Vec<String>,
    pub model_role: ModelRole,
}

/// 升级诊断结论
#[derive(Debug, Clone)]
pub enum EscalationAction {
    /// 换一种问法重试
    Rewrite(AgentDescriptor),
    /// 拆成多个子任务顺序执行
    Decompose(Vec<AgentDescriptor>),
    /// 放弃，附用户可见的说明
    Abort(String),
}

/// 运行后复盘的素材
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub agent_id: String,
    pub topic: String,
    pub task: String,
    pub response: String,
    pub work_log: Vec<String>,
    pub elapsed_ms: u64,
    pub verdict: GateVerdict,
}

/// 质量门：评审 Agent 的最终回复
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn review(&self, request: &GateRequest) -> Result<GateReview, CoordError>;
}

/// 升级顾问：为失败的 Agent 给出下一步
#[async_trait]
pub trait Escalator: Send + Sync {
    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationAction, CoordError>;
}

/// 复盘器：纯旁路，调用方 fire-and-forget
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, record: &ReflectionRecord) -> Result<(), CoordError>;
}

/// 一套协作方：编排器的外接顾问组
#[derive(Clone)]
pub struct CollaboratorSet {
    pub gate: Arc<dyn QualityGate>,
    pub escalator: Arc<dyn Escalator>,
    pub reflector: Arc<dyn Reflector>,
}

impl CollaboratorSet {
    /// 全 Mock 的协作方组（测试与无 Key 环境）
    pub fn mock() -> Self {
        Self {
            gate: Arc::new(MockQualityGate::default()),
            escalator: Arc::new(MockEscalator::default()),
            reflector: Arc::new(MockReflector::default()),
        }
    }
}

/// 根据配置与环境变量选择协作方后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn collaborators_from_config(cfg: &AppConfig) -> CollaboratorSet {
    let provider = cfg.llm.provider.to_lowercase();
    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        tracing::info!("Using DeepSeek collaborators ({})", cfg.llm.model);
        let backend = Arc::new(OpenAiCollaborator::new(
            Some(openai::DEEPSEEK_BASE_URL),
            &cfg.llm.model,
            api_key.as_deref(),
        ));
        CollaboratorSet {
            gate: backend.clone(),
            escalator: backend.clone(),
            reflector: backend,
        }
    } else if use_openai {
        tracing::info!("Using OpenAI collaborators ({})", cfg.llm.model);
        let backend = Arc::new(OpenAiCollaborator::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ));
        CollaboratorSet {
            gate: backend.clone(),
            escalator: backend.clone(),
            reflector: backend,
        }
    } else {
        tracing::warn!("No API key set or provider unknown, using mock collaborators");
        CollaboratorSet::mock()
    }
}
