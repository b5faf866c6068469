//! 提交限流 (滑动窗口)。
//!
//! 存储通过 `RateLimitStore` 注入; 默认的 `InMemoryRateLimiter` 基于 `DashMap`,
//! 多实例部署时可替换为共享存储实现。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

/// 一次计数的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// 需等待 `retry_after` 后重试
    Limited { retry_after: Duration },
}

impl RateDecision {
    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

pub trait RateLimitStore: Send + Sync {
    /// 记录一次尝试; 被限流时不计入窗口
    fn hit(&self, key: &str, now: DateTime<Utc>) -> RateDecision;

    /// 清理窗口内已无记录的 key, 返回清理数量
    fn purge(&self, now: DateTime<Utc>) -> usize;
}

/// 每经过一个窗口, 下一次 `hit` 会顺带清理空闲 key,
/// 所以 map 大小受窗口内活跃 key 数约束。
pub struct InMemoryRateLimiter {
    limit: usize,
    window: Duration,
    hits: DashMap<String, VecDeque<DateTime<Utc>>>,
    /// 下次清理时间 (毫秒时间戳)
    next_sweep: AtomicI64,
}

impl InMemoryRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: DashMap::new(),
            next_sweep: AtomicI64::new(i64::MIN),
        }
    }

    /// 到期则清理一次; 并发调用时只有一个线程真正执行
    fn sweep_if_due(&self, now: DateTime<Utc>) {
        let due = self.next_sweep.load(Ordering::Relaxed);
        let now_ms = now.timestamp_millis();
        if now_ms < due {
            return;
        }
        let next = now_ms + self.window.num_milliseconds();
        if self
            .next_sweep
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.purge(now);
            if removed > 0 {
                tracing::debug!("límite de envíos: {} claves inactivas eliminadas", removed);
            }
        }
    }

    fn evict(queue: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while queue.front().is_some_and(|t| *t <= cutoff) {
            queue.pop_front();
        }
    }
}

impl RateLimitStore for InMemoryRateLimiter {
    fn hit(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        // 必须在持有 entry 锁之前清理
        self.sweep_if_due(now);
        let cutoff = now - self.window;
        let mut entry = self.hits.entry(key.to_string()).or_default();
        let queue = entry.value_mut();
        Self::evict(queue, cutoff);

        if queue.len() >= self.limit {
            let retry_after = queue
                .front()
                .map(|oldest| *oldest + self.window - now)
                .unwrap_or(self.window);
            tracing::warn!("límite de envíos alcanzado para {}", key);
            return RateDecision::Limited { retry_after };
        }

        queue.push_back(now);
        RateDecision::Allowed
    }

    fn purge(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.hits.len();
        self.hits.retain(|_, queue| {
            Self::evict(queue, cutoff);
            !queue.is_empty()
        });
        before - self.hits.len()
    }
}
