//! 核心基础层：错误类型与可取消调用

pub mod cancellable;
pub mod error;

pub use cancellable::run_cancellable;
pub use error::CoordError;
