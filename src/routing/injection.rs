//! 注入路由
//!
//! 新消息到达时决定去向：状态询问（只读答复）、注入进行中的任务、
//! 或设备上没有活跃任务（走常规路径）。
//! 状态询问靠固定短语表做大小写不敏感匹配，不调用 LLM。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::registry::{TaskRegistry, TaskSnapshot};

/// 包含匹配的状态询问短语（中英混排，与输入小写后做子串匹配）
const STATUS_PHRASES: &[&str] = &[
    "any updates",
    "how's it going",
    "how is it going",
    "done yet",
    "progress",
    "进展如何",
    "进展怎么样",
    "怎么样了",
    "好了吗",
    "完成了吗",
];

/// 整句匹配的状态询问词（去掉末尾标点后整句比对，避免 "eta" 误伤 "metadata" 之类）
const STATUS_WORDS: &[&str] = &["status", "eta", "状态", "进度"];

/// 需要从用户可见文本里剥掉的内部分类标记
const INTERNAL_MARKERS: &[&str] = &[
    "[STATUS_QUERY]",
    "[SINGLE_TASK]",
    "[NO_ACTIVE_TASK]",
    "[NUDGE]",
    "[WATCHDOG]",
];

/// 路由结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InjectionRoute {
    /// 设备上没有活跃任务
    None,
    /// 状态询问：附带目标任务快照，调用方据此生成状态答复，无副作用
    StatusQuery { task: TaskSnapshot },
    /// 注入目标任务：调用方负责调用 inject 送入
    SingleTask { task: TaskSnapshot },
}

/// 是否为状态询问（纯函数，短语表驱动）
pub fn is_status_query(input: &str) -> bool {
    let lower = input.trim().to_lowercase();
    let bare = lower.trim_end_matches(['?', '？', '!', '！', '。', '.']).trim();

    if STATUS_WORDS.iter().any(|w| bare == *w) {
        return true;
    }
    STATUS_PHRASES.iter().any(|p| lower.contains(p))
}

/// 剥掉内部分类标记（标记表驱动的纯函数）
pub fn strip_internal_markers(text: &str) -> String {
    let mut out = text.to_string();
    for marker in INTERNAL_MARKERS {
        out = out.replace(marker, "");
    }
    // 标记移除后逐行收拢空白，保留换行结构
    let lines: Vec<String> = out
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    lines.join("\n").trim().to_string()
}

/// 注入路由器
pub struct InjectionRouter {
    registry: Arc<TaskRegistry>,
}

impl InjectionRouter {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// 路由一条新消息
    ///
    /// 多个活跃任务时选最近活跃的那个（状态询问与注入同一策略）。
    /// 本函数无副作用：注入由调用方执行。
    pub async fn route(&self, device_id: &str, message: &str) -> InjectionRoute {
        let task = match self.registry.most_recent_active(device_id).await {
            Some(task) => task,
            None => return InjectionRoute::None,
        };

        if is_status_query(message) {
            tracing::debug!(device_id = %device_id, task_id = %task.id, "Routed as status query");
            InjectionRoute::StatusQuery { task }
        } else {
            tracing::debug!(device_id = %device_id, task_id = %task.id, "Routed as task injection");
            InjectionRoute::SingleTask { task }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::{RunOutcome, SpawnSpec};

    #[test]
    fn test_status_phrases() {
        assert!(is_status_query("Any updates?"));
        assert!(is_status_query("status?"));
        assert!(is_status_query("ETA?"));
        assert!(is_status_query("how is it going"));
        assert!(is_status_query("How's it going??"));
        assert!(is_status_query("done yet?"));
        assert!(is_status_query("进展如何"));
        assert!(is_status_query("好了吗？"));
    }

    #[test]
    fn test_non_status_messages() {
        assert!(!is_status_query("change the color to blue"));
        assert!(!is_status_query("use React instead of Vue"));
        assert!(!is_status_query("hello"));
        // "eta" 只做整句匹配
        assert!(!is_status_query("update the metadata file"));
    }

    #[test]
    fn test_strip_internal_markers() {
        assert_eq!(
            strip_internal_markers("[STATUS_QUERY] everything is on track"),
            "everything is on track"
        );
        assert_eq!(
            strip_internal_markers("done [WATCHDOG] with [NUDGE] the task"),
            "done with the task"
        );
        assert_eq!(strip_internal_markers("plain text"), "plain text");
    }

    #[test]
    fn test_strip_preserves_line_structure() {
        let text = "[WATCHDOG] Summary so far:\n- step   one done\n- step two running\n\nNext: wait for CI";
        assert_eq!(
            strip_internal_markers(text),
            "Summary so far:\n- step one done\n- step two running\n\nNext: wait for CI"
        );
    }

    async fn spawn_busy(registry: &Arc<TaskRegistry>, device: &str) -> TaskSnapshot {
        registry
            .spawn(
                SpawnSpec::new(device, "user_1", "busy", "long work"),
                Box::new(|_ctx| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(RunOutcome::new("done"))
                    })
                }),
            )
            .await
    }

    #[tokio::test]
    async fn test_route_no_active_task() {
        let (registry, _rx) = TaskRegistry::new();
        let router = InjectionRouter::new(Arc::clone(&registry));

        let route = router.route("device_1", "hello").await;
        assert!(matches!(route, InjectionRoute::None));
    }

    #[tokio::test]
    async fn test_route_status_query_and_injection() {
        let (registry, _rx) = TaskRegistry::new();
        let router = InjectionRouter::new(Arc::clone(&registry));
        let task = spawn_busy(&registry, "device_1").await;

        let route = router.route("device_1", "Any updates?").await;
        match route {
            InjectionRoute::StatusQuery { task: t } => assert_eq!(t.id, task.id),
            other => panic!("unexpected route: {:?}", other),
        }

        let route = router.route("device_1", "use React instead of Vue").await;
        match route {
            InjectionRoute::SingleTask { task: t } => assert_eq!(t.id, task.id),
            other => panic!("unexpected route: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_picks_most_recent_of_two() {
        let (registry, _rx) = TaskRegistry::new();
        let router = InjectionRouter::new(Arc::clone(&registry));

        let first = spawn_busy(&registry, "device_1").await;
        let _second = spawn_busy(&registry, "device_1").await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.record_activity(&first.id, "still at it").await;

        let route = router.route("device_1", "hurry up please").await;
        match route {
            InjectionRoute::SingleTask { task } => assert_eq!(task.id, first.id),
            other => panic!("unexpected route: {:?}", other),
        }
    }
}
