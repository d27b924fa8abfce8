use domain::Timestamp;

pub trait Clock: Send + Sync {
    /// 当前时间，Unix 毫秒
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}
