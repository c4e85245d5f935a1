//! OpenAI 兼容协作方后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 同一个客户端实现质量门、升级顾问与复盘器三个角色，仅 prompt 不同。
//! 回复按「JSON 优先、大写前缀兜底」解析，解析不动时质量门放行、升级顾问放弃。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::AgentDescriptor;
use crate::core::error::CoordError;

use super::{
    EscalationAction, EscalationRequest, GateRequest, GateReview, GateVerdict, QualityGate,
    ReflectionRecord, Reflector, Escalator,
};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

const GATE_PROMPT: &str = r#"You are a strict quality reviewer for AI agent output.
Given a task and the agent's proposed final response, reply with JSON only:
{"verdict": "pass" | "cleaned" | "rerun" | "abort", "cleaned": "...", "abort_message": "..."}
- pass: the response answers the task and reads well
- cleaned: minor issues; put your improved full text in "cleaned"
- rerun: the response misses the task; the agent should try once more
- abort: the task is hopeless; put a short honest message for the user in "abort_message""#;

const ESCALATION_PROMPT: &str = r#"You are a recovery advisor for a failed AI agent task.
Given the task, the failure reason and the work log, reply with JSON only:
{"action": "rewrite" | "decompose" | "abort",
 "task": "...", "topic": "...",
 "subtasks": [{"task": "...", "topic": "..."}],
 "message": "..."}
- rewrite: restate the task so a fresh agent is likely to succeed (fill "task", optionally "topic")
- decompose: split into 2-4 smaller sequential subtasks (fill "subtasks")
- abort: not worth retrying; put a short honest message for the user in "message""#;

const REFLECTION_PROMPT: &str = r#"You are a post-run reviewer for an AI agent system.
Summarize in 2-3 sentences what this run did well and what should change next time.
This is advisory only; plain text, no JSON."#;

/// OpenAI 兼容协作方：持有 Client 与 model 名，三个角色共用一次补全入口
pub struct OpenAiCollaborator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCollaborator {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, CoordError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .map_err(|e| CoordError::CollaboratorError(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user.to_string())
                    .build()
                    .map_err(|e| CoordError::CollaboratorError(e.to_string()))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| CoordError::CollaboratorError(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| CoordError::CollaboratorError(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}

/// 提取 JSON 块（```json ... ``` 或首个 { 到末个 }）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(
            rest.find("```")
                .map(|end| rest[..end].trim())
                .unwrap_or(rest.trim()),
        );
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            return Some(&trimmed[start..=end]);
        }
    }
    None
}

/// 解析质量门回复：JSON 优先，大写前缀兜底，都不行则放行
pub(crate) fn parse_gate_review(raw: &str) -> GateReview {
    if let Some(json) = extract_json(raw) {
        if let Ok(review) = serde_json::from_str::<GateReview>(json) {
            return review;
        }
    }

    let upper = raw.trim().to_uppercase();
    if upper.starts_with("RERUN") {
        return GateReview {
            verdict: GateVerdict::Rerun,
            cleaned: None,
            abort_message: None,
        };
    }
    if upper.starts_with("ABORT") {
        let message = raw.trim()[5..]
            .trim_start_matches(|c: char| c == ':' || c == ' ')
            .trim();
        return GateReview {
            verdict: GateVerdict::Abort,
            cleaned: None,
            abort_message: (!message.is_empty()).then(|| message.to_string()),
        };
    }
    if !upper.starts_with("PASS") && !upper.is_empty() {
        tracing::debug!("Gate reply not parseable, passing through");
    }
    GateReview::pass()
}

#[derive(Debug, Deserialize)]
struct EscalationWire {
    action: String,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    subtasks: Vec<SubtaskWire>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubtaskWire {
    task: String,
    #[serde(default)]
    topic: Option<String>,
}

const ESCALATION_GIVE_UP: &str =
    "I could not find a workable way to continue this task, so I'm stopping here.";

/// 解析升级顾问回复；新描述继承原 Agent 的 system prompt、工具与模型角色
pub(crate) fn parse_escalation(raw: &str, request: &EscalationRequest) -> EscalationAction {
    let wire: EscalationWire = match extract_json(raw).and_then(|j| serde_json::from_str(j).ok()) {
        Some(wire) => wire,
        None => {
            tracing::warn!(agent_id = %request.agent_id, "Escalation reply not parseable, aborting");
            return EscalationAction::Abort(ESCALATION_GIVE_UP.to_string());
        }
    };

    let inherit = |task: String, topic: String| {
        AgentDescriptor::new(task, topic)
            .with_system_prompt(request.system_prompt.clone())
            .with_tools(request.tool_ids.clone())
            .with_model_role(request.model_role)
    };

    match wire.action.as_str() {
        "rewrite" => {
            let task = wire.task.unwrap_or_else(|| request.task.clone());
            let topic = wire.topic.unwrap_or_else(|| request.topic.clone());
            EscalationAction::Rewrite(inherit(task, topic))
        }
        "decompose" if !wire.subtasks.is_empty() => {
            let subs = wire
                .subtasks
                .into_iter()
                .map(|s| {
                    let topic = s.topic.unwrap_or_else(|| request.topic.clone());
                    inherit(s.task, topic)
                })
                .collect();
            EscalationAction::Decompose(subs)
        }
        "abort" | "decompose" => {
            EscalationAction::Abort(wire.message.unwrap_or_else(|| ESCALATION_GIVE_UP.to_string()))
        }
        other => {
            tracing::warn!(action = %other, "Unknown escalation action, aborting");
            EscalationAction::Abort(wire.message.unwrap_or_else(|| ESCALATION_GIVE_UP.to_string()))
        }
    }
}

#[async_trait]
impl QualityGate for OpenAiCollaborator {
    async fn review(&self, request: &GateRequest) -> Result<GateReview, CoordError> {
        let retry_note = if request.is_retry {
            "\n\nThis response is already a rerun. Do not answer rerun again; choose pass, cleaned or abort."
        } else {
            ""
        };
        let user = format!(
            "Task:\n{}\n\nProposed response:\n{}{}",
            request.task, request.response, retry_note
        );

        let raw = self.complete(GATE_PROMPT, &user).await?;
        Ok(parse_gate_review(&raw))
    }
}

#[async_trait]
impl Escalator for OpenAiCollaborator {
    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationAction, CoordError> {
        let user = format!(
            "Topic: {}\nTask:\n{}\n\nFailure reason: {}\n\nWork log:\n{}",
            request.topic,
            request.task,
            request.reason,
            request.work_log.join("\n")
        );

        let raw = self.complete(ESCALATION_PROMPT, &user).await?;
        Ok(parse_escalation(&raw, request))
    }
}

#[async_trait]
impl Reflector for OpenAiCollaborator {
    async fn reflect(&self, record: &ReflectionRecord) -> Result<(), CoordError> {
        let user = format!(
            "Topic: {}\nTask:\n{}\n\nFinal response:\n{}\n\nVerdict: {:?}, elapsed {}ms\nWork log:\n{}",
            record.topic,
            record.task,
            record.response,
            record.verdict,
            record.elapsed_ms,
            record.work_log.join("\n")
        );

        let summary = self.complete(REFLECTION_PROMPT, &user).await?;
        tracing::info!(agent_id = %record.agent_id, "Reflection: {}", summary.trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ModelRole;

    fn request() -> EscalationRequest {
        EscalationRequest {
            agent_id: "agent_x".to_string(),
            topic: "research".to_string(),
            task: "find the best rust web framework".to_string(),
            reason: "stalled".to_string(),
            work_log: vec!["searched crates.io".to_string()],
            system_prompt: "be thorough".to_string(),
            tool_ids: vec!["search".to_string()],
            model_role: ModelRole::Reasoner,
        }
    }

    #[test]
    fn test_parse_gate_json() {
        let review = parse_gate_review(r#"{"verdict": "cleaned", "cleaned": "Better text."}"#);
        assert_eq!(review.verdict, GateVerdict::Cleaned);
        assert_eq!(review.cleaned.as_deref(), Some("Better text."));
    }

    #[test]
    fn test_parse_gate_fenced_json() {
        let raw = "Here is my review:\n```json\n{\"verdict\": \"rerun\"}\n```";
        assert_eq!(parse_gate_review(raw).verdict, GateVerdict::Rerun);
    }

    #[test]
    fn test_parse_gate_prefix_fallback() {
        let review = parse_gate_review("ABORT: the task cannot be completed");
        assert_eq!(review.verdict, GateVerdict::Abort);
        assert_eq!(
            review.abort_message.as_deref(),
            Some("the task cannot be completed")
        );
    }

    #[test]
    fn test_parse_gate_unparseable_passes_through() {
        let review = parse_gate_review("looks fine to me!");
        assert_eq!(review.verdict, GateVerdict::Pass);
    }

    #[test]
    fn test_parse_escalation_rewrite_inherits_context() {
        let raw = r#"{"action": "rewrite", "task": "compare axum and actix only"}"#;
        match parse_escalation(raw, &request()) {
            EscalationAction::Rewrite(d) => {
                assert_eq!(d.task, "compare axum and actix only");
                assert_eq!(d.topic, "research");
                assert_eq!(d.system_prompt, "be thorough");
                assert_eq!(d.selected_tool_ids, vec!["search".to_string()]);
                assert_eq!(d.model_role, ModelRole::Reasoner);
            }
            other => panic!("expected rewrite, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_escalation_decompose() {
        let raw = r#"{"action": "decompose", "subtasks": [
            {"task": "list frameworks", "topic": "inventory"},
            {"task": "benchmark the top two"}
        ]}"#;
        match parse_escalation(raw, &request()) {
            EscalationAction::Decompose(subs) => {
                assert_eq!(subs.len(), 2);
                assert_eq!(subs[0].topic, "inventory");
                // 未给 topic 的子任务继承原主题
                assert_eq!(subs[1].topic, "research");
            }
            other => panic!("expected decompose, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_escalation_empty_decompose_aborts() {
        let raw = r#"{"action": "decompose", "subtasks": []}"#;
        assert!(matches!(
            parse_escalation(raw, &request()),
            EscalationAction::Abort(_)
        ));
    }

    #[test]
    fn test_parse_escalation_garbage_aborts() {
        assert!(matches!(
            parse_escalation("I have no idea", &request()),
            EscalationAction::Abort(_)
        ));
    }
}
