//! 聊天会话核心领域模型
//!
//! 包含连接状态、消息、在线成员集合、令牌请求等核心类型，以及相关的校验规则。

pub mod entities;
pub mod errors;
pub mod events;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use value_objects::*;
