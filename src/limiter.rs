//! Per-user and global request throttling.
//!
//! Fixed-window counters: each user gets `quota` dispatches per `window`,
//! tracked process-locally. A denied request touches neither the cache nor
//! the store; the caller reports the returned retry-after to the user. An
//! optional global window sits behind the per-user check to protect shared
//! downstream sources from aggregate bursts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Map size at which stale windows are pruned during acquisition.
const PRUNE_THRESHOLD: usize = 4096;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed; a slot was consumed.
    Allowed,
    /// Quota exhausted for the current window.
    Denied {
        /// Time until the window rolls over.
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    /// Roll the window forward if it has elapsed, then try to take a slot.
    fn acquire(&mut self, now: Instant, quota: u32, window: Duration) -> Decision {
        let elapsed = now.duration_since(self.started);
        if elapsed >= window {
            self.started = now;
            self.count = 0;
        }
        if self.count >= quota {
            return Decision::Denied {
                retry_after: window.saturating_sub(now.duration_since(self.started)),
            };
        }
        self.count += 1;
        Decision::Allowed
    }
}

struct GlobalLimit {
    quota: u32,
    window: Mutex<Window>,
}

/// Fixed-window rate limiter keyed by user id.
pub struct RateLimiter {
    quota: u32,
    window: Duration,
    per_user: Mutex<HashMap<i64, Window>>,
    global: Option<GlobalLimit>,
}

impl RateLimiter {
    /// Create a limiter with a per-user quota and, optionally, a global
    /// (cross-user) quota over the same window size.
    #[must_use]
    pub fn new(quota: u32, window: Duration, global_quota: Option<u32>) -> Self {
        Self {
            quota,
            window,
            per_user: Mutex::new(HashMap::new()),
            global: global_quota.map(|quota| GlobalLimit {
                quota,
                window: Mutex::new(Window::new(Instant::now())),
            }),
        }
    }

    /// Try to consume one dispatch slot for the user.
    ///
    /// The per-user window is checked first; if it allows, the global window
    /// (when configured) is checked next. A global denial refunds the user's
    /// slot so cross-user bursts do not burn individual quotas.
    pub fn try_acquire(&self, user_id: i64) -> Decision {
        let now = Instant::now();
        let mut users = lock_recovering(&self.per_user);

        if users.len() >= PRUNE_THRESHOLD {
            let horizon = self.window * 2;
            users.retain(|_, w| now.duration_since(w.started) < horizon);
        }

        let user_window = users.entry(user_id).or_insert_with(|| Window::new(now));
        let decision = user_window.acquire(now, self.quota, self.window);
        if let Decision::Denied { retry_after } = decision {
            debug!(user_id, retry_after_ms = retry_after.as_millis() as u64, "per-user quota exhausted");
            return decision;
        }

        if let Some(global) = &self.global {
            let mut window = lock_recovering(&global.window);
            let global_decision = window.acquire(now, global.quota, self.window);
            if let Decision::Denied { retry_after } = global_decision {
                user_window.count = user_window.count.saturating_sub(1);
                debug!(user_id, retry_after_ms = retry_after.as_millis() as u64, "global quota exhausted");
                return Decision::Denied { retry_after };
            }
        }

        Decision::Allowed
    }

    /// Configured per-user quota.
    #[must_use]
    pub const fn quota(&self) -> u32 {
        self.quota
    }

    /// Configured window size.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    #[cfg(test)]
    fn user_count(&self, user_id: i64) -> u32 {
        lock_recovering(&self.per_user)
            .get(&user_id)
            .map_or(0, |w| w.count)
    }
}

/// Take the mutex even if a panicking holder poisoned it; counters are
/// always internally consistent, so the stale-guard data is safe to reuse.
fn lock_recovering<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
