//! Per-repository write-quota gate: a token bucket keyed by
//! `project/repo`, refilled continuously at `permits / period_seconds`,
//! with burst capacity `permits`. Absence of a configured quota means
//! unlimited.

use std::time::Instant;

use dashmap::DashMap;

use crate::errors::DogmaError;
use crate::metadata::WriteQuota;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(quota: &WriteQuota) -> Self {
        let refill_per_sec = quota.permits as f64 / quota.period_seconds.max(1) as f64;
        Self {
            capacity: quota.permits as f64,
            tokens: quota.permits as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Holds one bucket per `(project, repo)` that currently has a quota
/// configured. `configure` is called whenever metadata changes a
/// repository's quota, so the bucket always reflects the latest rate —
/// repositories without a configured quota never gain an entry and are
/// always permitted.
#[derive(Default)]
pub struct QuotaGate {
    buckets: DashMap<(String, String), TokenBucket>,
}

impl QuotaGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, project: &str, repo: &str, quota: Option<&WriteQuota>) {
        let key = (project.to_string(), repo.to_string());
        match quota {
            Some(q) => {
                self.buckets.insert(key, TokenBucket::new(q));
            }
            None => {
                self.buckets.remove(&key);
            }
        }
    }

    /// Fails with `QuotaExceeded` if the repository has a configured quota
    /// and its bucket is currently empty. A repository with no configured
    /// quota always succeeds.
    pub fn check(&self, project: &str, repo: &str) -> Result<(), DogmaError> {
        let key = (project.to_string(), repo.to_string());
        match self.buckets.get_mut(&key) {
            Some(mut bucket) => {
                if bucket.try_acquire() {
                    Ok(())
                } else {
                    Err(DogmaError::QuotaExceeded(format!("{project}/{repo}")))
                }
            }
            None => Ok(()),
        }
    }
}
