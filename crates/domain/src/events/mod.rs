//! 领域事件定义
//!
//! 包含传输层推送给会话核心的消息、在线状态和连接状态事件。

pub mod chat_event;

// 重新导出事件类型
pub use chat_event::*;
