//! Per-user throttle on chunk uploads
//!
//! Each user gets a token bucket held in process memory. A refused request is
//! told how long to wait before the next token is available.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::services::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Chunks a user may send back to back
    pub burst: u32,
    /// Sustained chunks per second
    pub per_second: f64,
}

struct Allowance {
    tokens: f64,
    refreshed: Instant,
}

pub struct ChunkThrottle {
    config: ThrottleConfig,
    users: Mutex<HashMap<i64, Allowance>>,
}

impl ChunkThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn users(&self) -> MutexGuard<'_, HashMap<i64, Allowance>> {
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spends one chunk of `user_id`'s allowance
    pub fn admit(&self, user_id: i64) -> IngestResult<()> {
        self.take(user_id, Instant::now())
            .map_err(|wait| IngestError::RateLimited {
                retry_after_secs: wait.as_secs_f64().ceil().max(1.0) as u64,
            })
    }

    /// `Err` carries the time until the next token
    fn take(&self, user_id: i64, now: Instant) -> Result<(), Duration> {
        let burst = f64::from(self.config.burst);
        let mut users = self.users();
        let allowance = users.entry(user_id).or_insert(Allowance {
            tokens: burst,
            refreshed: now,
        });

        let idle = now.saturating_duration_since(allowance.refreshed);
        let refill = idle.as_secs_f64() * self.config.per_second;
        allowance.tokens = (allowance.tokens + refill).min(burst);
        allowance.refreshed = now;

        if allowance.tokens >= 1.0 {
            allowance.tokens -= 1.0;
            return Ok(());
        }
        if self.config.per_second <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64(
            (1.0 - allowance.tokens) / self.config.per_second,
        ))
    }

    /// Forgets users idle for at least `idle`. Returns how many.
    pub fn forget_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut users = self.users();
        let before = users.len();
        users.retain(|_, a| now.saturating_duration_since(a.refreshed) < idle);
        before - users.len()
    }
}
