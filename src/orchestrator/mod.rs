//! 编排器
//!
//! 顺序执行一组 Agent 任务描述：先把所有 Agent 建档并登记消息路由，
//! 再逐个备工作区、托管给注册表执行、交给监管器盯梢。
//! 失败走升级诊断（rewrite / decompose / abort），成品过质量门（重跑硬上限一次），
//! 运行日志落盘失败不阻塞，复盘旁路触发，最后按成败合并响应。

pub mod merge;
pub mod workspace;

pub use merge::{merge_responses, AgentRunRecord};
pub use workspace::{continuation_summary, WorkspaceManager};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::{
    AgentDescriptor, AgentManager, AgentStatus, Conversation, Message, SpawnedAgent, WaitRegistry,
};
use crate::collaborators::{
    collaborators_from_config, CollaboratorSet, EscalationAction, EscalationRequest, GateRequest,
    GateReview, GateVerdict, ReflectionRecord,
};
use crate::config::{AppConfig, OrchestratorSection};
use crate::core::error::CoordError;
use crate::registry::{RunContext, RunOutcome, SpawnSpec, TaskId, TaskNotification, TaskRegistry};
use crate::routing::{InjectionRouter, MessageRouter};
use crate::supervisor::{NoopHooks, Supervisor, SupervisorHooks, WatchdogThresholds};

const DEFAULT_ABORT_MESSAGE: &str =
    "I wasn't able to produce a reliable answer for this task.";

/// 执行器拿到的完整开工包
#[derive(Debug, Clone)]
pub struct AgentRunInput {
    pub agent_id: String,
    pub task: String,
    pub topic: String,
    pub system_prompt: String,
    pub selected_tool_ids: Vec<String>,
    /// 路由切片（续接时末尾带进展摘要）后的初始对话
    pub conversation: Vec<Message>,
    pub workspace: PathBuf,
}

/// Agent 执行器：真正跑任务的一方（工具循环、生成调用都在里面）
///
/// 实现方有义务定期调用 ctx 的活动钩子，并在安全点检查当前令牌。
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, input: AgentRunInput, ctx: RunContext)
        -> Result<RunOutcome, CoordError>;
}

/// 一次编排请求
#[derive(Debug, Clone)]
pub struct OrchestratorRequest {
    pub device_id: String,
    pub user_id: String,
    /// 共享消息流，路由器按下标切片
    pub shared_history: Vec<Message>,
    pub agents: Vec<AgentDescriptor>,
}

/// 一次编排的结果：合并后的响应与逐 Agent 去向
pub struct RunReport {
    pub response: String,
    pub records: Vec<AgentRunRecord>,
}

/// 上一个成功 Agent 留下的现场（续接任务用）
struct PreviousRun {
    topic: String,
    response: String,
    work_log: Vec<String>,
    workspace: PathBuf,
}

struct PreparedAgent {
    agent_id: String,
    input: AgentRunInput,
}

/// 编排器
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    agents: Arc<AgentManager>,
    router: Arc<MessageRouter>,
    supervisor: Arc<Supervisor>,
    waits: Arc<WaitRegistry>,
    executor: Arc<dyn AgentExecutor>,
    collaborators: CollaboratorSet,
    workspaces: WorkspaceManager,
    settings: OrchestratorSection,
}

impl Orchestrator {
    /// 顺序执行一次编排请求
    pub async fn run(&self, request: OrchestratorRequest) -> RunReport {
        // 先全部建档并登记路由，再逐个执行
        let mut planned = Vec::with_capacity(request.agents.len());
        for descriptor in &request.agents {
            let agent = SpawnedAgent::from_descriptor(descriptor);
            let agent_id = self.agents.insert(agent).await;
            for &index in &descriptor.relevant_message_indices {
                self.router
                    .assign_message(index, &agent_id, &descriptor.topic)
                    .await;
            }
            planned.push((agent_id, descriptor.clone()));
        }

        let mut records = Vec::with_capacity(planned.len());
        let mut previous: Option<PreviousRun> = None;
        for (agent_id, descriptor) in planned {
            let record = self
                .run_agent(&request, agent_id, descriptor, &mut previous)
                .await;
            records.push(record);
        }

        let response = merge_responses(&records);
        RunReport { response, records }
    }

    /// 把用户回复送达阻塞中的 Agent（Blocked → Running）
    pub async fn deliver_user_reply(&self, agent_id: &str, reply: impl Into<String>) -> bool {
        if self.waits.resolve(agent_id, reply).await {
            self.agents.resume(agent_id).await;
            true
        } else {
            false
        }
    }

    /// 单个 Agent 的完整生命周期，升级额度内可循环重试
    async fn run_agent(
        &self,
        request: &OrchestratorRequest,
        first_agent_id: String,
        descriptor: AgentDescriptor,
        previous: &mut Option<PreviousRun>,
    ) -> AgentRunRecord {
        let mut current = descriptor;
        let mut existing = Some(first_agent_id);
        let mut escalations_left = self.settings.escalation_depth;

        loop {
            let prepared = match self
                .prepare_agent(request, &current, previous.as_ref(), existing.take())
                .await
            {
                Ok(prepared) => prepared,
                Err(record) => return record,
            };
            let agent_id = prepared.agent_id;
            let input = prepared.input;

            let started = Instant::now();
            let (task_id, result) = self
                .execute_supervised(request, &agent_id, input.clone())
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    // 执行方自报升级
                    if let Some(reason) = outcome.escalation.clone() {
                        if escalations_left > 0 {
                            escalations_left -= 1;
                            match self
                                .consult_escalator(&agent_id, &current, &reason, outcome.work_log.clone())
                                .await
                            {
                                EscalationAction::Rewrite(next) => {
                                    self.retire_agent(&agent_id, "superseded by rewritten task").await;
                                    tracing::info!(agent_id = %agent_id, "Escalation: task rewritten");
                                    current = next;
                                    continue;
                                }
                                EscalationAction::Decompose(subs) => {
                                    self.retire_agent(&agent_id, "decomposed into subtasks").await;
                                    return self.run_decomposed(request, &agent_id, &current, subs).await;
                                }
                                EscalationAction::Abort(message) => {
                                    return self.finish_aborted(&agent_id, &current, message).await;
                                }
                            }
                        }
                        tracing::warn!(
                            agent_id = %agent_id, reason = %reason,
                            "Escalation depth exhausted, gating the result as-is"
                        );
                    }
                    return self
                        .finish_success(request, &agent_id, &current, input, outcome, elapsed_ms, previous)
                        .await;
                }
                Err(e) if e.is_cancellation() => {
                    let snapshot = self.registry.get(&task_id).await;
                    let phase = snapshot.as_ref().map(|t| t.watchdog_phase).unwrap_or(3);
                    let work_log = snapshot
                        .map(|t| t.recent_activity.labels())
                        .unwrap_or_default();

                    // 阶段 3（强杀）或升级额度用尽：不再诊断
                    if phase >= 3 || escalations_left == 0 {
                        return self
                            .finish_failure(&agent_id, &current, "aborted by watchdog: no progress")
                            .await;
                    }
                    escalations_left -= 1;
                    match self
                        .consult_escalator(
                            &agent_id,
                            &current,
                            "cancelled by watchdog after stalling",
                            work_log,
                        )
                        .await
                    {
                        EscalationAction::Rewrite(next) => {
                            self.retire_agent(&agent_id, "superseded after watchdog abort").await;
                            current = next;
                            continue;
                        }
                        EscalationAction::Decompose(subs) => {
                            self.retire_agent(&agent_id, "decomposed after watchdog abort").await;
                            return self.run_decomposed(request, &agent_id, &current, subs).await;
                        }
                        EscalationAction::Abort(message) => {
                            return self.finish_aborted(&agent_id, &current, message).await;
                        }
                    }
                }
                Err(e) => return self.finish_failure(&agent_id, &current, &e.to_string()).await,
            }
        }
    }

    /// 建档（或复用已建档的 Agent）、切片消息、备工作区
    async fn prepare_agent(
        &self,
        request: &OrchestratorRequest,
        descriptor: &AgentDescriptor,
        previous: Option<&PreviousRun>,
        existing: Option<String>,
    ) -> Result<PreparedAgent, AgentRunRecord> {
        let agent_id = match existing {
            Some(id) => id,
            None => {
                let agent = SpawnedAgent::from_descriptor(descriptor);
                let id = self.agents.insert(agent).await;
                for &index in &descriptor.relevant_message_indices {
                    self.router.assign_message(index, &id, &descriptor.topic).await;
                }
                id
            }
        };

        let mut conversation = self
            .router
            .messages_for_agent(&agent_id, &request.shared_history)
            .await;

        // 续接：复用上一个工作区并用进展摘要开场；否则新开目录
        let workspace = match previous {
            Some(prev) if descriptor.continues_previous => {
                conversation.push(Message::user(continuation_summary(
                    &prev.topic,
                    &prev.response,
                    &prev.work_log,
                )));
                prev.workspace.clone()
            }
            _ => match self.workspaces.prepare(&request.user_id, &agent_id).await {
                Ok(dir) => dir,
                Err(e) => {
                    return Err(self.finish_failure(&agent_id, descriptor, &e.to_string()).await)
                }
            },
        };

        self.agents
            .with_agent(&agent_id, |a| {
                a.conversation = Conversation::seeded(conversation.clone())
            })
            .await;

        Ok(PreparedAgent {
            agent_id: agent_id.clone(),
            input: AgentRunInput {
                agent_id,
                task: descriptor.task.clone(),
                topic: descriptor.topic.clone(),
                system_prompt: descriptor.system_prompt.clone(),
                selected_tool_ids: descriptor.selected_tool_ids.clone(),
                conversation,
                workspace,
            },
        })
    }

    /// 托管执行一次：spawn、watch、wait、unwatch
    async fn execute_supervised(
        &self,
        request: &OrchestratorRequest,
        agent_id: &str,
        input: AgentRunInput,
    ) -> (TaskId, Result<RunOutcome, CoordError>) {
        self.agents.set_status(agent_id, AgentStatus::Running).await;

        let spec = SpawnSpec::new(&request.device_id, &request.user_id, &input.topic, &input.task);
        let executor = Arc::clone(&self.executor);
        let task = self
            .registry
            .spawn(
                spec,
                Box::new(move |ctx| Box::pin(async move { executor.execute(input, ctx).await })),
            )
            .await;

        self.supervisor.watch(agent_id, &task.id).await;
        let result = self.registry.wait(&task.id).await;
        self.supervisor.unwatch(agent_id).await;

        (task.id, result)
    }

    async fn consult_escalator(
        &self,
        agent_id: &str,
        descriptor: &AgentDescriptor,
        reason: &str,
        work_log: Vec<String>,
    ) -> EscalationAction {
        let request = EscalationRequest {
            agent_id: agent_id.to_string(),
            topic: descriptor.topic.clone(),
            task: descriptor.task.clone(),
            reason: reason.to_string(),
            work_log,
            system_prompt: descriptor.system_prompt.clone(),
            tool_ids: descriptor.selected_tool_ids.clone(),
            model_role: descriptor.model_role,
        };
        match self.collaborators.escalator.escalate(&request).await {
            Ok(action) => action,
            Err(e) => {
                // 升级顾问不可用：降级为带原因的放弃，不把错误抛给用户
                tracing::warn!(agent_id = %agent_id, "Escalator unavailable: {}", e);
                EscalationAction::Abort(format!(
                    "Task \"{}\" failed: {}",
                    descriptor.topic, reason
                ))
            }
        }
    }

    /// 升级拆解：子任务顺序执行，产出按主题拼接
    async fn run_decomposed(
        &self,
        request: &OrchestratorRequest,
        parent_agent_id: &str,
        parent: &AgentDescriptor,
        subs: Vec<AgentDescriptor>,
    ) -> AgentRunRecord {
        tracing::info!(topic = %parent.topic, count = subs.len(), "Escalation: running subtasks");
        let mut pieces: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for sub in &subs {
            let prepared = match self.prepare_agent(request, sub, None, None).await {
                Ok(prepared) => prepared,
                Err(record) => {
                    failures.push(format!("{}: {}", sub.topic, record.outcome.err().unwrap_or_default()));
                    continue;
                }
            };
            let (_task_id, result) = self
                .execute_supervised(request, &prepared.agent_id, prepared.input.clone())
                .await;
            match result {
                Ok(outcome) => {
                    self.agents
                        .with_agent(&prepared.agent_id, |a| {
                            a.result = Some(outcome.response.clone())
                        })
                        .await;
                    self.agents
                        .set_status(&prepared.agent_id, AgentStatus::Completed)
                        .await;
                    pieces.push(format!("**{}**\n\n{}", sub.topic, outcome.response));
                }
                Err(e) => {
                    self.retire_agent(&prepared.agent_id, &e.to_string()).await;
                    failures.push(format!("{}: {}", sub.topic, e));
                }
            }
        }

        if pieces.is_empty() {
            return AgentRunRecord::failed(
                parent_agent_id,
                &parent.topic,
                format!("all subtasks failed: {}", failures.join("; ")),
            );
        }

        let mut merged = pieces.join("\n\n");
        if !failures.is_empty() {
            merged.push_str("\n\nSome subtasks could not be completed:");
            for failure in &failures {
                merged.push_str(&format!("\n- {}", failure));
            }
        }
        AgentRunRecord::succeeded(parent_agent_id, &parent.topic, merged)
    }

    /// 质量门 + 至多一次重跑，给出最终文本与实际采纳的结论
    async fn review_response(
        &self,
        request: &OrchestratorRequest,
        agent_id: &str,
        descriptor: &AgentDescriptor,
        input: &AgentRunInput,
        outcome: &RunOutcome,
    ) -> (String, GateVerdict) {
        let review = self
            .gate_review(agent_id, &descriptor.task, &outcome.response, false)
            .await;

        match review.verdict {
            GateVerdict::Pass => (outcome.response.clone(), GateVerdict::Pass),
            GateVerdict::Cleaned => (
                review.cleaned.unwrap_or_else(|| outcome.response.clone()),
                GateVerdict::Cleaned,
            ),
            GateVerdict::Abort => (
                review
                    .abort_message
                    .unwrap_or_else(|| DEFAULT_ABORT_MESSAGE.to_string()),
                GateVerdict::Abort,
            ),
            GateVerdict::Rerun => {
                if self.settings.max_reruns == 0 {
                    tracing::warn!(agent_id = %agent_id, "Rerun requested but disabled, accepting response");
                    return (outcome.response.clone(), GateVerdict::Pass);
                }
                tracing::info!(agent_id = %agent_id, "Quality gate requested a rerun");

                let mut retry_input = input.clone();
                retry_input.conversation.push(Message::user(
                    "Your previous answer did not pass review. Address the task again, more carefully.",
                ));
                let (_task_id, retry) = self
                    .execute_supervised(request, agent_id, retry_input)
                    .await;
                let second = match retry {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, "Rerun failed ({}), keeping first response", e);
                        return (outcome.response.clone(), GateVerdict::Pass);
                    }
                };

                let review = self
                    .gate_review(agent_id, &descriptor.task, &second.response, true)
                    .await;
                match review.verdict {
                    GateVerdict::Pass => (second.response, GateVerdict::Pass),
                    GateVerdict::Cleaned => (
                        review.cleaned.unwrap_or(second.response),
                        GateVerdict::Cleaned,
                    ),
                    // 第二次 Abort：话术原样采用
                    GateVerdict::Abort => (
                        review
                            .abort_message
                            .unwrap_or_else(|| DEFAULT_ABORT_MESSAGE.to_string()),
                        GateVerdict::Abort,
                    ),
                    // 重跑硬上限一次：再要求重跑就降级为接受
                    GateVerdict::Rerun => {
                        tracing::warn!(agent_id = %agent_id, "Second rerun verdict downgraded, accepting rerun output");
                        (second.response, GateVerdict::Pass)
                    }
                }
            }
        }
    }

    async fn gate_review(
        &self,
        agent_id: &str,
        task: &str,
        response: &str,
        is_retry: bool,
    ) -> GateReview {
        let request = GateRequest {
            agent_id: agent_id.to_string(),
            task: task.to_string(),
            response: response.to_string(),
            is_retry,
        };
        match self.collaborators.gate.review(&request).await {
            Ok(review) => review,
            Err(e) => {
                // 质检不可用时放行，绝不拦住用户可见回复
                tracing::warn!(agent_id = %agent_id, "Quality gate unavailable ({}), passing through", e);
                GateReview::pass()
            }
        }
    }

    /// 成功收尾：过质量门、落运行日志、旁路复盘、更新续接现场
    #[allow(clippy::too_many_arguments)]
    async fn finish_success(
        &self,
        request: &OrchestratorRequest,
        agent_id: &str,
        descriptor: &AgentDescriptor,
        input: AgentRunInput,
        outcome: RunOutcome,
        elapsed_ms: u64,
        previous: &mut Option<PreviousRun>,
    ) -> AgentRunRecord {
        let (response, verdict) = self
            .review_response(request, agent_id, descriptor, &input, &outcome)
            .await;
        let aborted = verdict == GateVerdict::Abort;

        self.agents
            .with_agent(agent_id, |a| {
                if aborted {
                    a.error = Some("aborted by quality gate".to_string());
                } else {
                    a.result = Some(response.clone());
                }
            })
            .await;
        self.agents
            .set_status(
                agent_id,
                if aborted { AgentStatus::Failed } else { AgentStatus::Completed },
            )
            .await;

        if self.settings.persist_run_log {
            if let Err(e) = self
                .workspaces
                .write_run_log(
                    &input.workspace,
                    &descriptor.topic,
                    &descriptor.task,
                    &response,
                    &outcome.work_log,
                )
                .await
            {
                tracing::warn!(agent_id = %agent_id, "Run log write failed: {}", e);
            }
        }

        // 复盘：旁路触发，不等待也不看结果
        let reflector = Arc::clone(&self.collaborators.reflector);
        let record = ReflectionRecord {
            agent_id: agent_id.to_string(),
            topic: descriptor.topic.clone(),
            task: descriptor.task.clone(),
            response: response.clone(),
            work_log: outcome.work_log.clone(),
            elapsed_ms,
            verdict,
        };
        tokio::spawn(async move {
            if let Err(e) = reflector.reflect(&record).await {
                tracing::warn!("Reflection failed: {}", e);
            }
        });

        if !aborted {
            *previous = Some(PreviousRun {
                topic: descriptor.topic.clone(),
                response: response.clone(),
                work_log: outcome.work_log,
                workspace: input.workspace,
            });
        }

        AgentRunRecord::succeeded(agent_id, &descriptor.topic, response)
    }

    /// 升级放弃：话术作为该 Agent 的用户可见产出
    async fn finish_aborted(
        &self,
        agent_id: &str,
        descriptor: &AgentDescriptor,
        message: String,
    ) -> AgentRunRecord {
        self.retire_agent(agent_id, "aborted after escalation").await;
        AgentRunRecord::succeeded(agent_id, &descriptor.topic, message)
    }

    async fn finish_failure(
        &self,
        agent_id: &str,
        descriptor: &AgentDescriptor,
        error: &str,
    ) -> AgentRunRecord {
        tracing::warn!(agent_id = %agent_id, topic = %descriptor.topic, error = %error, "Agent failed");
        self.retire_agent(agent_id, error).await;
        AgentRunRecord::failed(agent_id, &descriptor.topic, error)
    }

    async fn retire_agent(&self, agent_id: &str, note: &str) {
        self.agents
            .with_agent(agent_id, |a| a.error = Some(note.to_string()))
            .await;
        self.agents.set_status(agent_id, AgentStatus::Failed).await;
    }
}

/// 组装完成的协调系统
pub struct Coordinator {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<TaskRegistry>,
    pub agents: Arc<AgentManager>,
    pub router: Arc<MessageRouter>,
    pub injections: InjectionRouter,
    pub waits: Arc<WaitRegistry>,
    pub supervisor: Arc<Supervisor>,
    /// 任务终态通知（接收端交给调用方消费）
    pub notifications: mpsc::UnboundedReceiver<TaskNotification>,
}

impl Coordinator {
    /// 启动监管巡检循环
    pub fn start_supervisor(&self) -> tokio::task::JoinHandle<()> {
        self.supervisor.start()
    }

    /// 停止监管巡检循环
    pub fn shutdown(&self) {
        self.supervisor.stop();
    }
}

/// 协调系统构建器：统一初始化注册表、监管器、协作方与编排器
pub struct CoordinatorBuilder {
    config: AppConfig,
    executor: Arc<dyn AgentExecutor>,
    hooks: Arc<dyn SupervisorHooks>,
    collaborators: Option<CollaboratorSet>,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            config,
            executor,
            hooks: Arc::new(NoopHooks),
            collaborators: None,
        }
    }

    /// 设置监管回调（默认 Noop）
    pub fn with_hooks(mut self, hooks: Arc<dyn SupervisorHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// 显式指定协作方（默认按配置与环境变量选择）
    pub fn with_collaborators(mut self, collaborators: CollaboratorSet) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn build(self) -> anyhow::Result<Coordinator> {
        let workspace_root = match self.config.app.workspace_root.clone() {
            Some(path) => path,
            None => std::env::current_dir()
                .context("resolve workspace root")?
                .join("workspace"),
        };
        std::fs::create_dir_all(&workspace_root)
            .with_context(|| format!("create workspace root {}", workspace_root.display()))?;

        let (registry, notifications) = TaskRegistry::new();
        let agents = Arc::new(AgentManager::new());
        let router = Arc::new(MessageRouter::new());
        let waits = Arc::new(WaitRegistry::new(self.config.orchestrator.blocked_wait_secs));
        let collaborators = self
            .collaborators
            .unwrap_or_else(|| collaborators_from_config(&self.config));
        let thresholds = WatchdogThresholds::from_config(&self.config.watchdog);
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            Arc::clone(&agents),
            self.hooks,
            self.config.supervisor.clone(),
            thresholds,
        ));
        let injections = InjectionRouter::new(Arc::clone(&registry));

        let orchestrator = Arc::new(Orchestrator {
            registry: Arc::clone(&registry),
            agents: Arc::clone(&agents),
            router: Arc::clone(&router),
            supervisor: Arc::clone(&supervisor),
            waits: Arc::clone(&waits),
            executor: self.executor,
            collaborators,
            workspaces: WorkspaceManager::new(workspace_root),
            settings: self.config.orchestrator.clone(),
        });

        Ok(Coordinator {
            orchestrator,
            registry,
            agents,
            router,
            injections,
            waits,
            supervisor,
            notifications,
        })
    }
}
