//! Fixed-window rate limiting per (route, client).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use modos_protocol::{RateLimitSpec, RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Windows are created lazily and replaced once their reset time passes.
/// Expired windows are evicted by [`FixedWindowLimiter::sweep_expired`].
#[derive(Debug, Default)]
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, route: &str, client: &str, spec: RateLimitSpec) -> RuntimeResult<()> {
        self.check_at(route, client, spec, Instant::now())
    }

    pub fn check_at(
        &self,
        route: &str,
        client: &str,
        spec: RateLimitSpec,
        now: Instant,
    ) -> RuntimeResult<()> {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((route.to_owned(), client.to_owned()))
            .or_insert(Window {
                count: 0,
                reset_at: now + Duration::from_millis(spec.window_ms),
            });
        if now >= window.reset_at {
            *window = Window {
                count: 0,
                reset_at: now + Duration::from_millis(spec.window_ms),
            };
        }
        if window.count >= spec.max {
            let retry_after_ms = window.reset_at.saturating_duration_since(now).as_millis() as u64;
            debug!(route, client, retry_after_ms, "rate limit exceeded");
            return Err(RuntimeError::RateLimited { retry_after_ms });
        }
        window.count += 1;
        Ok(())
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
