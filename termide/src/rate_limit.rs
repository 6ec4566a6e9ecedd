use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

fn default_max_requests() -> usize {
    50
}

fn default_time_window_secs() -> u64 {
    60
}

/// Rate limiter settings as stored in the config file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            time_window_secs: default_time_window_secs(),
        }
    }
}

#[derive(Default)]
struct RateWindow {
    /// Accepted-request timestamps, oldest first.
    timestamps: VecDeque<Instant>,
    /// Total admissions since construction. Not affected by pruning.
    request_count: u64,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window admission control for outbound model requests.
///
/// Checked synchronously before every model call. A `false` from
/// [`can_make_request`](Self::can_make_request) means "deny and tell the user",
/// never an error. Uses `tokio::time::Instant` so a paused test clock drives it.
pub struct RateLimitHandler {
    max_requests: usize,
    time_window: Duration,
    window: Mutex<RateWindow>,
}

impl RateLimitHandler {
    pub fn new(max_requests: usize, time_window: Duration) -> Self {
        Self {
            max_requests,
            time_window,
            window: Mutex::new(RateWindow::default()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_requests,
            Duration::from_secs(config.time_window_secs),
        )
    }

    fn lock(&self) -> MutexGuard<'_, RateWindow> {
        // The window holds plain data; a panic mid-update can't leave it invalid.
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a request if the window has room, recording it.
    pub fn can_make_request(&self) -> bool {
        let now = Instant::now();
        let mut window = self.lock();
        window.prune(now, self.time_window);

        if window.timestamps.len() < self.max_requests {
            window.timestamps.push_back(now);
            window.request_count += 1;
            true
        } else {
            tracing::debug!(
                max_requests = self.max_requests,
                window_secs = self.time_window.as_secs_f64(),
                "request denied by rate limiter"
            );
            false
        }
    }

    /// How long until a request would be admitted. Zero if one would be admitted now.
    /// Never consumes a slot.
    pub fn time_until_next_request(&self) -> Duration {
        let now = Instant::now();
        let mut window = self.lock();
        window.prune(now, self.time_window);

        if window.timestamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        match window.timestamps.front() {
            Some(&oldest) => self
                .time_window
                .saturating_sub(now.duration_since(oldest)),
            None => self.time_window,
        }
    }

    /// Total admitted requests. Monotonic.
    pub fn request_count(&self) -> u64 {
        self.lock().request_count
    }

    /// Requests still admissible in the current window.
    pub fn remaining(&self) -> usize {
        let now = Instant::now();
        let mut window = self.lock();
        window.prune(now, self.time_window);
        self.max_requests.saturating_sub(window.timestamps.len())
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }
}

impl Default for RateLimitHandler {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
