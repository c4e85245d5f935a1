//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SUPERVISOR__TICK_SECS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [app] 段：应用名与工作区根目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// Agent 工作区根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [supervisor] 段：巡检节拍与提醒策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// 巡检间隔（秒）
    pub tick_secs: u64,
    /// 快速中止窗口：对话为空且未进工具循环超过该时长直接中止
    pub fast_abort_secs: u64,
    /// 单个 Agent 最多提醒次数
    pub max_nudges: u32,
    /// 连续多少个无进展巡检后才算卡住
    pub no_progress_ticks: u32,
    /// 提醒注入文案
    pub nudge_message: String,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            fast_abort_secs: 60,
            max_nudges: 2,
            no_progress_ticks: 3,
            nudge_message: default_nudge_message(),
        }
    }
}

fn default_nudge_message() -> String {
    "Quick check-in: please report current progress and continue with the task.".to_string()
}

/// 单个模型角色的看门狗档位（秒）
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RoleThresholdsSection {
    pub stuck_secs: u64,
    pub abort_secs: u64,
}

/// [watchdog] 段：按模型角色的 (stuck, abort) 阈值表
///
/// 慢而强的推理模型宽限更长；未知角色落到 default。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub default: RoleThresholdsSection,
    pub reasoner: RoleThresholdsSection,
    pub chat: RoleThresholdsSection,
    pub lite: RoleThresholdsSection,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            default: RoleThresholdsSection {
                stuck_secs: 120,
                abort_secs: 240,
            },
            reasoner: RoleThresholdsSection {
                stuck_secs: 240,
                abort_secs: 480,
            },
            chat: RoleThresholdsSection {
                stuck_secs: 120,
                abort_secs: 240,
            },
            lite: RoleThresholdsSection {
                stuck_secs: 90,
                abort_secs: 180,
            },
        }
    }
}

/// [orchestrator] 段：重跑上限、阻塞等待与运行日志
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 质量门重跑硬上限
    pub max_reruns: u32,
    /// 阻塞等待用户回复的超时（秒）
    pub blocked_wait_secs: u64,
    /// 升级（Rewrite / Decompose）的最大嵌套深度
    pub escalation_depth: u32,
    /// 是否把运行日志写入工作区
    pub persist_run_log: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_reruns: 1,
            blocked_wait_secs: 1800,
            escalation_depth: 1,
            persist_run_log: true,
        }
    }
}

/// [llm] 段：协作方（质量门 / 升级 / 反思）所用后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            supervisor: SupervisorSection::default(),
            watchdog: WatchdogSection::default(),
            orchestrator: OrchestratorSection::default(),
            llm: LlmSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.supervisor.tick_secs, 30);
        assert_eq!(config.supervisor.fast_abort_secs, 60);
        assert_eq!(config.supervisor.max_nudges, 2);
        assert_eq!(config.orchestrator.max_reruns, 1);
        assert_eq!(config.orchestrator.blocked_wait_secs, 1800);
        // 推理角色宽限长于轻量角色
        assert!(config.watchdog.reasoner.abort_secs > config.watchdog.lite.abort_secs);
    }
}
