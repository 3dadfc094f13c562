//! 事件模块
//!
//! 上传管理器通过广播通道发布的任务事件
//! - `types.rs`: 上传任务事件类型
//! - `throttle.rs`: 进度事件节流器

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
