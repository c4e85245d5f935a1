//! Hive 演示入口
//!
//! 初始化日志、加载配置，用内置演示执行器跑一轮两个 Agent 的顺序编排
//! （第二个续接第一个），最后打印合并响应与逐 Agent 去向。

use std::sync::Arc;

use async_trait::async_trait;

use hive::agent::AgentDescriptor;
use hive::collaborators::CollaboratorSet;
use hive::config::load_config;
use hive::core::error::CoordError;
use hive::orchestrator::{AgentRunInput, OrchestratorRequest};
use hive::registry::{RunContext, RunOutcome};
use hive::{AgentExecutor, CoordinatorBuilder};

/// 演示执行器：记录几步活动后返回一段固定格式的响应
struct DemoExecutor;

#[async_trait]
impl AgentExecutor for DemoExecutor {
    async fn execute(&self, input: AgentRunInput, ctx: RunContext) -> Result<RunOutcome, CoordError> {
        ctx.mark_tool_loop_started().await;
        ctx.record_activity(format!("reading task: {}", input.topic)).await;
        ctx.record_tool_activity().await;

        if ctx.is_cancelled().await {
            return Err(CoordError::Cancelled);
        }

        let response = format!(
            "[{}] handled \"{}\" in workspace {}",
            input.topic,
            input.task,
            input.workspace.display()
        );
        Ok(RunOutcome::new(response).with_work_log(vec![
            "inspected the task".to_string(),
            "produced the write-up".to_string(),
        ]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    println!("🚀 Starting Hive coordination demo");

    let config = load_config(None).unwrap_or_default();

    let coordinator = CoordinatorBuilder::new(config, Arc::new(DemoExecutor))
        .with_collaborators(CollaboratorSet::mock())
        .build()?;
    let supervisor_handle = coordinator.start_supervisor();

    let request = OrchestratorRequest {
        device_id: "demo_device".to_string(),
        user_id: "demo_user".to_string(),
        shared_history: Vec::new(),
        agents: vec![
            AgentDescriptor::new("collect three interesting facts about coffee", "coffee facts"),
            AgentDescriptor::new("turn the facts into a short note", "coffee note")
                .with_continuation(),
        ],
    };

    println!("📊 Running {} agents sequentially...", request.agents.len());
    let report = coordinator.orchestrator.run(request).await;

    println!("\n=== Merged response ===\n{}\n", report.response);
    for record in &report.records {
        match &record.outcome {
            Ok(_) => println!("  ✓ {} ({})", record.topic, record.agent_id),
            Err(e) => println!("  ✗ {} ({}): {}", record.topic, record.agent_id, e),
        }
    }

    coordinator.shutdown();
    let _ = supervisor_handle.await;

    println!("\n✅ Demo completed");
    Ok(())
}
