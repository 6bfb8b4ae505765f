use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Permits granted per window.
    pub permits: u32,
    #[serde(with = "window_millis")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits: 80,
            window: Duration::from_secs(1),
        }
    }
}

mod window_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Default)]
struct WindowState {
    granted: u64,
    window_start: Option<Instant>,
}

/// Fixed-window limiter shared by every worker of a run.
///
/// Each window admits `permits` acquisitions. The next one waits out whatever
/// is left of the window and then opens a new one. Count, compare, sleep and reset all
/// happen under one lock, so callers queue behind a sleeping acquirer.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RateLimitConfig {
                permits: config.permits.max(1),
                window: config.window,
            },
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Waits until the caller may issue one request.
    ///
    /// Dropping the future mid-wait gives the permit back: the count is only
    /// advanced once the wait has finished.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let window_start = *state.window_start.get_or_insert(now);
        let permits = u64::from(self.config.permits);

        if state.granted > 0 && state.granted % permits == 0 {
            let elapsed = now.duration_since(window_start);
            if elapsed < self.config.window {
                let remaining = self.config.window - elapsed;
                tracing::debug!(?remaining, "Rate limit window full, waiting");
                tokio::time::sleep(remaining).await;
            }
            state.window_start = Some(Instant::now());
        }
        state.granted += 1;
    }

    /// Permits handed out so far.
    pub async fn granted(&self) -> u64 {
        self.state.lock().await.granted
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
