//! Redis 骨干网
//!
//! 用 Redis Pub/Sub 承载频道消息与在线状态事件，用集合保存在线成员快照。

pub mod error;
pub mod transport;

// 重新导出
pub use error::*;
pub use transport::*;
