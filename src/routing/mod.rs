//! 路由层：注入路由（状态询问 / 任务注入）与共享消息流切片

pub mod feed;
pub mod injection;

pub use feed::{Assignment, MessageRouter};
pub use injection::{is_status_query, strip_internal_markers, InjectionRoute, InjectionRouter};
