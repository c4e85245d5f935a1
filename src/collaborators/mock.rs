//! Mock 协作方（用于测试，无需 API）
//!
//! 质量门一律放行、升级顾问固定放弃、复盘器只计数，行为完全确定。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::core::error::CoordError;

use super::{
    EscalationAction, EscalationRequest, Escalator, GateRequest, GateReview, QualityGate,
    ReflectionRecord, Reflector,
};

/// Mock 质量门：一律放行
#[derive(Debug, Default)]
pub struct MockQualityGate;

#[async_trait]
impl QualityGate for MockQualityGate {
    async fn review(&self, _request: &GateRequest) -> Result<GateReview, CoordError> {
        Ok(GateReview::pass())
    }
}

/// Mock 升级顾问：固定放弃，附确定性话术
#[derive(Debug, Default)]
pub struct MockEscalator;

#[async_trait]
impl Escalator for MockEscalator {
    async fn escalate(&self, request: &EscalationRequest) -> Result<EscalationAction, CoordError> {
        Ok(EscalationAction::Abort(format!(
            "Task \"{}\" failed and no recovery advisor is configured.",
            request.topic
        )))
    }
}

/// Mock 复盘器：只计数，便于断言 fire-and-forget 确实触发
#[derive(Debug, Default)]
pub struct MockReflector {
    calls: AtomicUsize,
}

impl MockReflector {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Reflector for MockReflector {
    async fn reflect(&self, record: &ReflectionRecord) -> Result<(), CoordError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(agent_id = %record.agent_id, "Mock reflection recorded");
        Ok(())
    }
}
