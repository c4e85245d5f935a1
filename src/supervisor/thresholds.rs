//! 模型角色阈值表
//!
//! (stuck, abort) 按模型角色分档：深度推理模型慢但步子大，宽限要长；
//! 轻量模型响应快，很久没动静基本就是真卡了。未知角色落到 default。

use std::collections::HashMap;
use std::time::Duration;

use crate::agent::ModelRole;
use crate::config::WatchdogSection;

/// 单个角色的阈值档位
#[derive(Debug, Clone, Copy)]
pub struct RolePolicy {
    pub stuck: Duration,
    pub abort: Duration,
}

impl RolePolicy {
    pub fn from_secs(stuck_secs: u64, abort_secs: u64) -> Self {
        Self {
            stuck: Duration::from_secs(stuck_secs),
            abort: Duration::from_secs(abort_secs),
        }
    }
}

/// 角色 → 阈值表（带 default 兜底）
#[derive(Debug, Clone)]
pub struct WatchdogThresholds {
    table: HashMap<ModelRole, RolePolicy>,
    fallback: RolePolicy,
}

impl WatchdogThresholds {
    pub fn from_config(section: &WatchdogSection) -> Self {
        let mut table = HashMap::new();
        table.insert(
            ModelRole::Reasoner,
            RolePolicy::from_secs(section.reasoner.stuck_secs, section.reasoner.abort_secs),
        );
        table.insert(
            ModelRole::Chat,
            RolePolicy::from_secs(section.chat.stuck_secs, section.chat.abort_secs),
        );
        table.insert(
            ModelRole::Lite,
            RolePolicy::from_secs(section.lite.stuck_secs, section.lite.abort_secs),
        );

        Self {
            table,
            fallback: RolePolicy::from_secs(section.default.stuck_secs, section.default.abort_secs),
        }
    }

    /// 查角色档位，查不到用 default
    pub fn for_role(&self, role: ModelRole) -> RolePolicy {
        self.table.get(&role).copied().unwrap_or(self.fallback)
    }
}

impl Default for WatchdogThresholds {
    fn default() -> Self {
        Self::from_config(&WatchdogSection::default())
    }
}
