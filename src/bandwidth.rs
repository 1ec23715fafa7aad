//! Adaptive bandwidth control for object storage transfers.
//!
//! [`AdaptiveRateController`] couples a token bucket with a small state
//! machine driven by provider throttling:
//!
//! - a throttling error halves the current bandwidth, at most once per
//!   [`SPEED_DOWN_WINDOW`], never below [`DEFAULT_MIN_BANDWIDTH`]
//! - a bandwidth request after [`STABLE_WINDOW`] without any change doubles
//!   the bandwidth, capped at the configured ceiling; with no ceiling, growing
//!   past [`DEFAULT_MAX_BANDWIDTH`] removes the limit entirely
//!
//! A bandwidth of `0` means unlimited.
//!
//! # Example
//!
//! ```
//! use filer_core::bandwidth::AdaptiveRateController;
//!
//! # async fn example() {
//! // 8 MiB/s ceiling, start at the ceiling.
//! let controller = AdaptiveRateController::new("upload", 8 * 1024 * 1024, 0);
//! controller.acquire(1024 * 1024).await;
//! # }
//! ```

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_MAX_BANDWIDTH, DEFAULT_MIN_BANDWIDTH};
use crate::transport::TransferError;

/// Throttling signals closer together than this count as one event.
pub const SPEED_DOWN_WINDOW: Duration = Duration::from_secs(10);

/// Bandwidth is only raised after this long without any change.
pub const STABLE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Token bucket that lets a caller go into debt and tells it how long to wait.
///
/// Capacity equals one second of traffic at the configured rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket refilling at `rate` bytes per second.
    #[must_use]
    pub fn new(rate: u64, now: Instant) -> Self {
        Self {
            rate,
            #[allow(clippy::cast_precision_loss)]
            tokens: rate as f64,
            last_refill: now,
        }
    }

    /// Takes `want` tokens and returns how long the caller must wait before
    /// sending them, or `None` if they are available now.
    #[allow(clippy::cast_precision_loss)]
    pub fn reserve(&mut self, want: u64, now: Instant) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        let rate = self.rate as f64;
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(rate);
        self.last_refill = now;

        self.tokens -= want as f64;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / rate))
        }
    }
}

#[derive(Debug)]
struct RateState {
    ceiling: u64,
    bandwidth: u64,
    last_speed_down: Option<Instant>,
    last_speed_change: Option<Instant>,
    saw_throttle: bool,
    saw_other: bool,
    bucket: TokenBucket,
}

impl RateState {
    fn speed_down(&mut self, direction: &str) {
        let mut bandwidth = self.bandwidth;
        if bandwidth == 0 {
            bandwidth = DEFAULT_MAX_BANDWIDTH;
        }
        if bandwidth <= DEFAULT_MIN_BANDWIDTH {
            info!(direction, bandwidth, "bandwidth already at minimum");
        } else {
            bandwidth /= 2;
            info!(direction, bandwidth, "bandwidth lowered");
        }
        self.bandwidth = bandwidth;
    }

    fn speed_up(&mut self, direction: &str) {
        let bandwidth = self.bandwidth.saturating_mul(2);
        if self.ceiling == 0 && bandwidth > DEFAULT_MAX_BANDWIDTH {
            info!(direction, "bandwidth limit removed");
            self.bandwidth = 0;
            return;
        }
        self.bandwidth = if self.ceiling > 0 {
            bandwidth.min(self.ceiling)
        } else {
            bandwidth
        };
        info!(direction, bandwidth = self.bandwidth, "bandwidth raised");
    }
}

/// Shared bandwidth governor for one direction of one object storage client.
#[derive(Debug)]
pub struct AdaptiveRateController {
    direction: &'static str,
    state: Mutex<RateState>,
}

impl AdaptiveRateController {
    /// Creates a controller.
    ///
    /// `bandwidth` is the starting rate; `0` starts at the ceiling. Both are
    /// bytes per second and `ceiling == 0` means no ceiling.
    #[must_use]
    pub fn new(direction: &'static str, ceiling: u64, bandwidth: u64) -> Self {
        let mut bandwidth = if bandwidth == 0 { ceiling } else { bandwidth };
        if ceiling > 0 && bandwidth > ceiling {
            bandwidth = ceiling;
        }
        debug!(direction, ceiling, bandwidth, "creating rate controller");
        Self {
            direction,
            state: Mutex::new(RateState {
                ceiling,
                bandwidth,
                last_speed_down: None,
                last_speed_change: None,
                saw_throttle: false,
                saw_other: false,
                bucket: TokenBucket::new(bandwidth, Instant::now()),
            }),
        }
    }

    /// Current bandwidth in bytes per second; `0` is unlimited.
    #[must_use]
    pub fn bandwidth(&self) -> u64 {
        self.lock().bandwidth
    }

    /// Clears the per-attempt error flags.
    pub fn begin_attempt(&self) {
        let mut state = self.lock();
        state.saw_throttle = false;
        state.saw_other = false;
    }

    /// True if the current attempt saw throttling and nothing else.
    #[must_use]
    pub fn only_throttled(&self) -> bool {
        let state = self.lock();
        state.saw_throttle && !state.saw_other
    }

    /// Feeds a failed request into the state machine.
    pub fn on_error(&self, error: &TransferError) {
        let throttled = error
            .as_object_store()
            .is_some_and(crate::transport::ObjectStoreError::is_throttle);
        self.on_failure(throttled, error);
    }

    fn on_failure(&self, throttled: bool, error: &dyn std::fmt::Display) {
        let now = Instant::now();
        let mut state = self.lock();

        if !throttled {
            warn!(direction = self.direction, error = %error, "object storage request failed");
            state.saw_other = true;
            return;
        }

        state.saw_throttle = true;
        if let Some(last) = state.last_speed_down
            && now.saturating_duration_since(last) < SPEED_DOWN_WINDOW
        {
            debug!(direction = self.direction, "throttled again inside speed-down window");
            return;
        }

        state.last_speed_down = Some(now);
        state.last_speed_change = Some(now);
        state.speed_down(self.direction);
        state.bucket = TokenBucket::new(state.bandwidth, now);
    }

    /// Records a throttling signal that did not come with a [`TransferError`].
    pub fn on_throttle(&self) {
        self.on_failure(true, &"throttled");
    }

    /// Waits until `want` bytes may be sent.
    pub async fn acquire(&self, want: u64) {
        if let Some(wait) = self.reserve(want) {
            tokio::time::sleep(wait).await;
        }
    }

    /// Applies the speed-up policy and reserves `want` bytes, returning the
    /// wait the caller owes.
    pub fn reserve(&self, want: u64) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.bandwidth == 0 {
            return None;
        }
        if state.ceiling > 0 && state.bandwidth == state.ceiling {
            return state.bucket.reserve(want, now);
        }
        if let Some(last) = state.last_speed_change
            && now.saturating_duration_since(last) < STABLE_WINDOW
        {
            return state.bucket.reserve(want, now);
        }

        state.last_speed_change = Some(now);
        state.speed_up(self.direction);
        state.bucket = TokenBucket::new(state.bandwidth, now);
        if state.bandwidth == 0 {
            return None;
        }
        state.bucket.reserve(want, now)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
