//! 阻塞等待注册表
//!
//! Agent 进入 Blocked 后在此登记，以 agent id 为键等待用户回复；
//! 回复送达时 resolve 唤醒等待方。等待有上限（默认 30 分钟），超时即失败。

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::core::error::CoordError;

/// 等待用户回复的解析器集合（agent_id → oneshot）
pub struct WaitRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    timeout: Duration,
}

impl WaitRegistry {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 登记并等待该 Agent 的用户回复
    ///
    /// 同一 Agent 重复登记会顶掉旧的等待（旧等待以 Cancelled 结束）。
    pub async fn wait_for_reply(&self, agent_id: &str) -> Result<String, CoordError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(agent_id.to_string(), tx);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // 发送端被丢弃：等待被取消（cancel_wait 或被新等待顶掉）
            Ok(Err(_)) => Err(CoordError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(agent_id);
                Err(CoordError::WaitTimeout(self.timeout.as_secs()))
            }
        }
    }

    /// 送达用户回复，唤醒等待方；返回是否有等待者
    pub async fn resolve(&self, agent_id: &str, reply: impl Into<String>) -> bool {
        let sender = self.pending.lock().await.remove(agent_id);
        match sender {
            Some(tx) => tx.send(reply.into()).is_ok(),
            None => false,
        }
    }

    /// 取消某个 Agent 的等待（Agent 被中止时调用）
    pub async fn cancel_wait(&self, agent_id: &str) -> bool {
        self.pending.lock().await.remove(agent_id).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
