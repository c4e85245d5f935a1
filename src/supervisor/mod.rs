//! 监管器（看门狗）
//!
//! 固定节拍巡检所有被监管 Agent，单轮串行执行、不会重叠。
//! 进展信号三选一：对话变长、工具调用数增加、工具活动时间戳前移。
//! 升级阶梯：提醒（有限次）→ 中止并换新令牌（保持监管，等待诊断）→ 强杀。
//! 对外只通过 SupervisorHooks 回调沟通，自身从不调用生成接口。

pub mod report;
pub mod thresholds;

pub use report::{NoopHooks, ReportStatus, StatusReport, SupervisorHooks};
pub use thresholds::{RolePolicy, WatchdogThresholds};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentManager, AgentStatus, ModelRole};
use crate::config::SupervisorSection;
use crate::registry::{TaskId, TaskRegistry, TaskSnapshot};

/// 每个被监管 Agent 的巡检状态
struct WatchState {
    task_id: TaskId,
    topic: String,
    started_at: Instant,
    last_conversation_len: usize,
    last_tool_calls: u64,
    last_tool_activity_at: Option<i64>,
    /// 连续无进展的巡检轮数
    idle_ticks: u32,
    nudges_sent: u32,
    /// 强杀窗口起点：阶段 2 中止时设置，观察到恢复后重新起算
    aborted_at: Option<Instant>,
}

/// 单轮巡检对一个 Agent 的处置
#[derive(Default)]
struct Decision {
    unwatch: bool,
    nudge: bool,
    /// 阶段 2：取消并换新令牌
    abort_reason: Option<String>,
    /// 阶段 3：强杀
    kill_reason: Option<String>,
    report: Option<StatusReport>,
}

/// 监管器
pub struct Supervisor {
    registry: Arc<TaskRegistry>,
    agents: Arc<AgentManager>,
    hooks: Arc<dyn SupervisorHooks>,
    settings: SupervisorSection,
    thresholds: WatchdogThresholds,
    /// 被监管集合（agent_id → 巡检状态）
    watched: RwLock<HashMap<String, WatchState>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        agents: Arc<AgentManager>,
        hooks: Arc<dyn SupervisorHooks>,
        settings: SupervisorSection,
        thresholds: WatchdogThresholds,
    ) -> Self {
        Self {
            registry,
            agents,
            hooks,
            settings,
            thresholds,
            watched: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 开始监管一个 Agent 及其任务
    pub async fn watch(&self, agent_id: &str, task_id: &str) {
        let topic = self
            .agents
            .with_agent(agent_id, |a| a.topic.clone())
            .await
            .unwrap_or_default();

        // 接手时已处于中止阶段的任务：强杀窗口从现在起算
        let aborted_at = match self.registry.get(task_id).await {
            Some(task) if task.watchdog_phase >= 2 => Some(Instant::now()),
            _ => None,
        };

        let state = WatchState {
            task_id: task_id.to_string(),
            topic,
            started_at: Instant::now(),
            last_conversation_len: 0,
            last_tool_calls: 0,
            last_tool_activity_at: None,
            idle_ticks: 0,
            nudges_sent: 0,
            aborted_at,
        };
        self.watched.write().await.insert(agent_id.to_string(), state);
        tracing::debug!(agent_id = %agent_id, task_id = %task_id, "Agent under supervision");
    }

    /// 停止监管（幂等）
    pub async fn unwatch(&self, agent_id: &str) -> bool {
        self.watched.write().await.remove(agent_id).is_some()
    }

    pub async fn watched_count(&self) -> usize {
        self.watched.read().await.len()
    }

    /// 启动巡检循环；tick 内逐个 await，自然不会重叠
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(supervisor.settings.tick_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = ticker.tick() => supervisor.pass().await,
                }
            }
            tracing::info!("Supervisor loop stopped");
        })
    }

    /// 停止巡检循环（幂等）
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// 执行一轮完整巡检
    pub async fn pass(&self) {
        let ids: Vec<String> = self.watched.read().await.keys().cloned().collect();
        for agent_id in ids {
            self.check_agent(&agent_id).await;
        }
    }

    async fn check_agent(&self, agent_id: &str) {
        let task_id = match self.watched.read().await.get(agent_id) {
            Some(state) => state.task_id.clone(),
            None => return,
        };

        let agent_view = self
            .agents
            .with_agent(agent_id, |a| (a.status, a.conversation.len(), a.model_role))
            .await;
        let task = self.registry.get(&task_id).await;

        let decision = {
            let mut watched = self.watched.write().await;
            let state = match watched.get_mut(agent_id) {
                Some(state) => state,
                None => return,
            };
            self.decide(state, agent_view, task)
        };

        self.execute(agent_id, &task_id, decision).await;
    }

    /// 纯状态计算：更新巡检计数，产出处置（锁内，不做 IO）
    fn decide(
        &self,
        state: &mut WatchState,
        agent_view: Option<(AgentStatus, usize, ModelRole)>,
        task: Option<TaskSnapshot>,
    ) -> Decision {
        let mut decision = Decision::default();

        // Agent 或任务记录不在了：解除监管
        let (status, conv_len, role) = match agent_view {
            Some(view) => view,
            None => {
                decision.unwatch = true;
                return decision;
            }
        };
        let task = match task {
            Some(task) => task,
            None => {
                decision.unwatch = true;
                return decision;
            }
        };

        let elapsed_ms = state.started_at.elapsed().as_millis() as u64;
        let topic = state.topic.clone();
        let report = move |status_kind, message: String| StatusReport {
            agent_id: String::new(), // execute 时补
            topic: topic.clone(),
            status: status_kind,
            message,
            elapsed_ms,
        };

        // 终态：解除监管（恰好一次）
        if status.is_terminal() || task.status.is_terminal() {
            decision.unwatch = true;
            return decision;
        }

        // Blocked 定义上不算卡住：刷新基线后跳过
        if status == AgentStatus::Blocked {
            state.last_conversation_len = conv_len;
            state.last_tool_calls = task.tool_call_count;
            state.last_tool_activity_at = task.last_tool_activity_at;
            state.idle_ticks = 0;
            return decision;
        }

        let progressed = conv_len > state.last_conversation_len
            || task.tool_call_count > state.last_tool_calls
            || task.last_tool_activity_at > state.last_tool_activity_at;

        state.last_conversation_len = conv_len;
        state.last_tool_calls = task.tool_call_count;
        state.last_tool_activity_at = task.last_tool_activity_at;

        let policy = self.thresholds.for_role(role);

        // 阶段 2 之后：恢复进展则重开强杀窗口继续观察，整窗无进展才强杀
        if task.watchdog_phase >= 2 {
            if progressed {
                state.idle_ticks = 0;
                state.aborted_at = Some(Instant::now());
                decision.report = Some(report(
                    ReportStatus::Progressing,
                    "recovered after abort".to_string(),
                ));
                return decision;
            }
            if let Some(aborted_at) = state.aborted_at {
                if aborted_at.elapsed() >= policy.abort {
                    decision.kill_reason =
                        Some("no reaction to abort, force killing".to_string());
                    decision.report = Some(report(
                        ReportStatus::Aborted,
                        "task ignored cancellation and was killed".to_string(),
                    ));
                    decision.unwatch = true;
                    return decision;
                }
            }
            decision.report = Some(report(
                ReportStatus::Slow,
                "aborted, waiting for wind-down".to_string(),
            ));
            return decision;
        }

        // 快速中止：迟迟没有任何启动迹象，不必等完整阈值阶梯
        if conv_len == 0
            && !task.tool_loop_started
            && state.started_at.elapsed() >= Duration::from_secs(self.settings.fast_abort_secs)
        {
            state.aborted_at = Some(Instant::now());
            decision.abort_reason = Some("never started working".to_string());
            decision.report = Some(report(
                ReportStatus::Aborted,
                "no sign of startup, aborting".to_string(),
            ));
            return decision;
        }

        if progressed {
            state.idle_ticks = 0;
            decision.report = Some(report(ReportStatus::Progressing, "making progress".to_string()));
            return decision;
        }
        state.idle_ticks += 1;

        let idle_ms = chrono::Utc::now().timestamp_millis() - task.last_activity_at;
        let idle = Duration::from_millis(idle_ms.max(0) as u64);

        // 提醒用尽且超过中止阈值：阶段 2
        if state.nudges_sent >= self.settings.max_nudges && idle >= policy.abort {
            state.aborted_at = Some(Instant::now());
            decision.abort_reason = Some(format!(
                "stalled for {}s after {} nudges",
                idle.as_secs(),
                state.nudges_sent
            ));
            decision.report = Some(report(
                ReportStatus::Aborted,
                "stalled beyond abort threshold, cancelling".to_string(),
            ));
            return decision;
        }

        // 连续无进展且超过卡住阈值：提醒（有限次）
        if state.idle_ticks >= self.settings.no_progress_ticks
            && idle >= policy.stuck
            && state.nudges_sent < self.settings.max_nudges
        {
            state.nudges_sent += 1;
            decision.nudge = true;
            decision.report = Some(report(
                ReportStatus::Stuck,
                format!("stuck for {}s, nudging", idle.as_secs()),
            ));
            return decision;
        }

        decision.report = Some(report(ReportStatus::Slow, "no progress this tick".to_string()));
        decision
    }

    /// 执行处置（锁外，做真正的 IO 与回调）
    async fn execute(&self, agent_id: &str, task_id: &str, decision: Decision) {
        if decision.nudge {
            let message = self.settings.nudge_message.clone();
            self.registry.inject(task_id, message.clone()).await;
            self.registry.mark_nudged(task_id).await;
            self.hooks.on_inject_message(agent_id, &message).await;
            tracing::info!(agent_id = %agent_id, "Nudge injected");
        }

        if let Some(reason) = &decision.abort_reason {
            self.registry.escalate_abort(task_id).await;
            self.hooks.on_abort_agent(agent_id, reason).await;
        }

        if let Some(reason) = &decision.kill_reason {
            self.registry.kill(task_id, reason.clone()).await;
            self.hooks.on_abort_agent(agent_id, reason).await;
        }

        if let Some(mut report) = decision.report {
            report.agent_id = agent_id.to_string();
            self.hooks.on_status_report(report).await;
        }

        if decision.unwatch {
            self.watched.write().await.remove(agent_id);
            tracing::debug!(agent_id = %agent_id, "Agent left supervision");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::agent::{AgentDescriptor, AgentStatus, SpawnedAgent};
    use crate::config::WatchdogSection;
    use crate::registry::{RunFn, RunOutcome, SpawnSpec};

    #[derive(Default)]
    struct RecordingHooks {
        injected: Mutex<Vec<(String, String)>>,
        aborted: Mutex<Vec<(String, String)>>,
        reports: Mutex<Vec<StatusReport>>,
    }

    #[async_trait]
    impl SupervisorHooks for RecordingHooks {
        async fn on_inject_message(&self, agent_id: &str, message: &str) {
            self.injected
                .lock()
                .await
                .push((agent_id.to_string(), message.to_string()));
        }

        async fn on_abort_agent(&self, agent_id: &str, reason: &str) {
            self.aborted
                .lock()
                .await
                .push((agent_id.to_string(), reason.to_string()));
        }

        async fn on_status_report(&self, report: StatusReport) {
            self.reports.lock().await.push(report);
        }
    }

    fn zombie_run() -> RunFn {
        Box::new(|_ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(RunOutcome::new("never"))
            })
        })
    }

    /// 阈值全零、提醒一次即升级的激进配置（测试用）
    fn aggressive() -> (SupervisorSection, WatchdogThresholds) {
        let settings = SupervisorSection {
            tick_secs: 1,
            fast_abort_secs: 3600,
            max_nudges: 1,
            no_progress_ticks: 1,
            nudge_message: "checking in".to_string(),
        };
        let mut section = WatchdogSection::default();
        for role in [
            &mut section.default,
            &mut section.reasoner,
            &mut section.chat,
            &mut section.lite,
        ] {
            role.stuck_secs = 0;
            role.abort_secs = 0;
        }
        (settings, WatchdogThresholds::from_config(&section))
    }

    async fn setup(
        settings: SupervisorSection,
        thresholds: WatchdogThresholds,
    ) -> (
        Arc<TaskRegistry>,
        Arc<AgentManager>,
        Arc<RecordingHooks>,
        Supervisor,
    ) {
        let (registry, _rx) = TaskRegistry::new();
        let agents = Arc::new(AgentManager::new());
        let hooks = Arc::new(RecordingHooks::default());
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            Arc::clone(&agents),
            hooks.clone() as Arc<dyn SupervisorHooks>,
            settings,
            thresholds,
        );
        (registry, agents, hooks, supervisor)
    }

    async fn spawn_watched(
        registry: &Arc<TaskRegistry>,
        agents: &Arc<AgentManager>,
        supervisor: &Supervisor,
        run: RunFn,
    ) -> (String, String) {
        let mut agent = SpawnedAgent::from_descriptor(&AgentDescriptor::new("work", "topic"));
        agent.status = AgentStatus::Running;
        let agent_id = agents.insert(agent).await;

        let task = registry
            .spawn(SpawnSpec::new("device_1", "user_1", "t", "work"), run)
            .await;
        supervisor.watch(&agent_id, &task.id).await;
        (agent_id, task.id)
    }

    #[tokio::test]
    async fn test_progress_then_slow() {
        let (registry, agents, hooks, supervisor) =
            setup(SupervisorSection::default(), WatchdogThresholds::default()).await;
        let (agent_id, _task_id) =
            spawn_watched(&registry, &agents, &supervisor, zombie_run()).await;

        agents
            .with_agent(&agent_id, |a| {
                a.conversation.push(crate::agent::Message::assistant("thinking"))
            })
            .await;

        supervisor.pass().await;
        supervisor.pass().await;

        let reports = hooks.reports.lock().await;
        assert_eq!(reports[0].status, ReportStatus::Progressing);
        assert_eq!(reports[1].status, ReportStatus::Slow);
        assert!(hooks.injected.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_escalation_ladder_nudge_abort_kill() {
        let (settings, thresholds) = aggressive();
        let (registry, agents, hooks, supervisor) = setup(settings, thresholds).await;
        let (agent_id, task_id) =
            spawn_watched(&registry, &agents, &supervisor, zombie_run()).await;
        registry.mark_tool_loop_started(&task_id).await;

        let old_token = registry.current_token(&task_id).await.unwrap();

        // 第 1 轮：提醒
        supervisor.pass().await;
        assert_eq!(hooks.injected.lock().await.len(), 1);
        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 1);
        assert_eq!(task.pending_injections, 1);

        // 第 2 轮：提醒用尽，中止并换新令牌
        supervisor.pass().await;
        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 2);
        assert!(old_token.is_cancelled());
        let fresh = registry.current_token(&task_id).await.unwrap();
        assert!(!fresh.is_cancelled());
        assert_eq!(hooks.aborted.lock().await.len(), 1);
        // 中止后仍在监管
        assert_eq!(supervisor.watched_count().await, 1);

        // 第 3 轮：仍无反应，强杀并解除监管
        supervisor.pass().await;
        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 3);
        assert_eq!(task.status, crate::registry::TaskStatus::Failed);
        assert!(task.was_cancelled);
        assert_eq!(supervisor.watched_count().await, 0);
        assert_eq!(hooks.aborted.lock().await.len(), 2);

        let reports = hooks.reports.lock().await;
        let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ReportStatus::Stuck, ReportStatus::Aborted, ReportStatus::Aborted]
        );
        assert_eq!(reports[0].agent_id, agent_id);
    }

    #[tokio::test]
    async fn test_recovery_after_abort_reopens_kill_window() {
        let (mut settings, _) = aggressive();
        settings.max_nudges = 0;
        let mut section = WatchdogSection::default();
        for role in [
            &mut section.default,
            &mut section.reasoner,
            &mut section.chat,
            &mut section.lite,
        ] {
            role.stuck_secs = 0;
            role.abort_secs = 1;
        }
        let (registry, agents, hooks, supervisor) =
            setup(settings, WatchdogThresholds::from_config(&section)).await;
        let (_agent_id, task_id) =
            spawn_watched(&registry, &agents, &supervisor, zombie_run()).await;
        registry.mark_tool_loop_started(&task_id).await;

        // 停滞超过中止阈值：阶段 2
        tokio::time::sleep(Duration::from_millis(1100)).await;
        supervisor.pass().await;
        assert_eq!(registry.get(&task_id).await.unwrap().watchdog_phase, 2);

        // 一个整窗过去之后才恢复了工具活动
        tokio::time::sleep(Duration::from_millis(1100)).await;
        registry.record_tool_activity(&task_id).await;
        supervisor.pass().await;

        // 恢复后的第一轮无进展：窗口刚重开，不得强杀
        supervisor.pass().await;
        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 2);
        assert_eq!(task.status, crate::registry::TaskStatus::Running);
        assert_eq!(supervisor.watched_count().await, 1);

        // 重开的窗口内始终无进展：强杀
        tokio::time::sleep(Duration::from_millis(1100)).await;
        supervisor.pass().await;
        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 3);
        assert_eq!(supervisor.watched_count().await, 0);

        let reports = hooks.reports.lock().await;
        let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ReportStatus::Aborted,
                ReportStatus::Progressing,
                ReportStatus::Slow,
                ReportStatus::Aborted,
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_after_abort_seeds_kill_window() {
        let (settings, thresholds) = aggressive();
        let (registry, agents, hooks, supervisor) = setup(settings, thresholds).await;

        let mut agent = SpawnedAgent::from_descriptor(&AgentDescriptor::new("work", "topic"));
        agent.status = AgentStatus::Running;
        let agent_id = agents.insert(agent).await;
        let task = registry
            .spawn(SpawnSpec::new("device_1", "user_1", "t", "work"), zombie_run())
            .await;

        // 任务先被中止到阶段 2，之后才进入监管
        registry.escalate_abort(&task.id).await;
        supervisor.watch(&agent_id, &task.id).await;

        supervisor.pass().await;

        let snapshot = registry.get(&task.id).await.unwrap();
        assert_eq!(snapshot.watchdog_phase, 3);
        assert_eq!(snapshot.status, crate::registry::TaskStatus::Failed);
        assert_eq!(supervisor.watched_count().await, 0);
        assert_eq!(hooks.aborted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_agent_is_exempt() {
        let (settings, thresholds) = aggressive();
        let (registry, agents, hooks, supervisor) = setup(settings, thresholds).await;
        let (agent_id, task_id) =
            spawn_watched(&registry, &agents, &supervisor, zombie_run()).await;

        agents.set_status(&agent_id, AgentStatus::Blocked).await;

        supervisor.pass().await;
        supervisor.pass().await;
        supervisor.pass().await;

        assert!(hooks.injected.lock().await.is_empty());
        assert!(hooks.aborted.lock().await.is_empty());
        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 0);
        assert_eq!(supervisor.watched_count().await, 1);
    }

    #[tokio::test]
    async fn test_fast_abort_when_never_started() {
        let (mut settings, thresholds) = aggressive();
        settings.fast_abort_secs = 0;
        let (registry, agents, hooks, supervisor) = setup(settings, thresholds).await;
        // 对话为空、从未进入工具循环
        let (_agent_id, task_id) =
            spawn_watched(&registry, &agents, &supervisor, zombie_run()).await;

        supervisor.pass().await;

        let task = registry.get(&task_id).await.unwrap();
        assert_eq!(task.watchdog_phase, 2);
        let aborted = hooks.aborted.lock().await;
        assert_eq!(aborted.len(), 1);
        assert!(aborted[0].1.contains("never started"));
    }

    #[tokio::test]
    async fn test_terminal_agent_unwatched_once() {
        let (registry, agents, _hooks, supervisor) =
            setup(SupervisorSection::default(), WatchdogThresholds::default()).await;
        let (agent_id, _task_id) =
            spawn_watched(&registry, &agents, &supervisor, zombie_run()).await;

        agents.set_status(&agent_id, AgentStatus::Completed).await;

        supervisor.pass().await;
        assert_eq!(supervisor.watched_count().await, 0);
        // 再次 unwatch 幂等
        assert!(!supervisor.unwatch(&agent_id).await);
    }
}
