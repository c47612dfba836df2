use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use domain::{Timestamp, UserId};

use crate::clock::Clock;

/// 单个用户在当前窗口内的计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    /// 当前窗口内已放行的次数
    pub count: u32,
    /// 窗口结束时间
    pub reset_at: Timestamp,
}

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("{bucket} rate limit of {limit} exceeded, retry in {retry_after_ms}ms")]
    Exceeded {
        bucket: &'static str,
        limit: u32,
        retry_after_ms: u64,
    },
}

impl RateLimitError {
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            RateLimitError::Exceeded { retry_after_ms, .. } => *retry_after_ms,
        }
    }
}

/// 固定窗口计数器，按用户而不是按连接计数。
///
/// 窗口过期后计数清零并从当前时刻重新开窗；计数达到上限时拒绝，
/// 被拒绝的事件直接丢弃，不排队。
pub struct RateLimiter {
    bucket: &'static str,
    capacity: u32,
    window: time::Duration,
    clock: Arc<dyn Clock>,
    windows: RwLock<HashMap<UserId, FixedWindow>>,
}

impl RateLimiter {
    pub fn new(
        bucket: &'static str,
        capacity: u32,
        window: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bucket,
            capacity,
            window: time::Duration::try_from(window).unwrap_or(time::Duration::MAX),
            clock,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// 发送消息的限流器
    pub fn messages(capacity: u32, window: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self::new("message", capacity, window, clock)
    }

    /// 输入状态事件的限流器
    pub fn typing(capacity: u32, window: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self::new("typing", capacity, window, clock)
    }

    pub fn consume(&self, user_id: UserId) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(user_id).or_insert(FixedWindow {
            count: 0,
            reset_at: now + self.window,
        });

        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }

        if window.count >= self.capacity {
            let remaining = (window.reset_at - now).whole_milliseconds().max(1);
            let retry_after_ms = u64::try_from(remaining).unwrap_or(u64::MAX);
            tracing::warn!(
                user_id = %user_id,
                bucket = self.bucket,
                limit = self.capacity,
                retry_after_ms,
                "rate limit exceeded"
            );
            return Err(RateLimitError::Exceeded {
                bucket: self.bucket,
                limit: self.capacity,
                retry_after_ms,
            });
        }

        window.count += 1;
        Ok(())
    }

    /// 当前窗口内还能放行的次数
    pub fn remaining(&self, user_id: UserId) -> u32 {
        let now = self.clock.now();
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        match windows.get(&user_id) {
            Some(window) if now < window.reset_at => self.capacity.saturating_sub(window.count),
            _ => self.capacity,
        }
    }

    /// 清理已经过期的窗口（防止内存泄漏），返回清理的条目数
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, window| now < window.reset_at);
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use time::macros::datetime;

    fn limiter(capacity: u32, window: Duration) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        (
            RateLimiter::messages(capacity, window, clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_rate_limiting() {
        let (limiter, _clock) = limiter(5, Duration::from_secs(60));
        let user_id = UserId::generate();

        for i in 0..5 {
            assert!(limiter.consume(user_id).is_ok(), "call {} should pass", i + 1);
        }

        match limiter.consume(user_id) {
            Err(RateLimitError::Exceeded {
                limit,
                retry_after_ms,
                ..
            }) => {
                assert_eq!(limit, 5);
                assert!(retry_after_ms > 0);
                assert!(retry_after_ms <= 60_000);
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_window_reset() {
        let (limiter, clock) = limiter(2, Duration::from_secs(10));
        let user_id = UserId::generate();

        assert!(limiter.consume(user_id).is_ok());
        clock.advance(time::Duration::seconds(4));
        assert!(limiter.consume(user_id).is_ok());

        let err = limiter.consume(user_id).unwrap_err();
        assert_eq!(err.retry_after_ms(), 6_000);

        clock.advance(time::Duration::seconds(6));
        assert!(limiter.consume(user_id).is_ok());
        assert_eq!(limiter.remaining(user_id), 1);
    }

    #[test]
    fn test_users_are_isolated() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(60));
        let alice = UserId::generate();
        let bob = UserId::generate();

        assert!(limiter.consume(alice).is_ok());
        assert!(limiter.consume(alice).is_err());
        assert!(limiter.consume(bob).is_ok());
    }

    #[test]
    fn test_purge_expired() {
        let (limiter, clock) = limiter(3, Duration::from_secs(10));
        limiter.consume(UserId::generate()).unwrap();
        clock.advance(time::Duration::seconds(5));
        limiter.consume(UserId::generate()).unwrap();

        clock.advance(time::Duration::seconds(6));
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.purge_expired(), 0);
    }
}
