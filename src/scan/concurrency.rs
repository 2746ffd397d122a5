use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use crate::error::Result;
use crate::shutdown::Shutdown;

/// Highest exponent applied to the 429 backoff base
const MAX_BACKOFF_LEVEL: u32 = 10;

/// Upper bound of the random jitter added to a 429 backoff
const MAX_BACKOFF_JITTER: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ControllerState {
    current: usize,
    max: usize,
    backoff_level: u32,
    backoff_until: Option<Instant>,
    last_adjust: Option<Instant>,
}

/// Concurrency level that grows on success, shrinks on errors and collapses
/// into a timed backoff on rate limiting
///
/// `current` always stays within `[min, max]`.
#[derive(Debug)]
pub struct AdaptiveConcurrency {
    min: usize,
    adjust_cooldown: Duration,
    state: Mutex<ControllerState>,
}

impl AdaptiveConcurrency {
    /// Start at `min` with room to grow up to `max`
    pub fn new(min: usize, max: usize, adjust_cooldown: Duration) -> Self {
        let min = min.max(1);
        Self {
            min,
            adjust_cooldown,
            state: Mutex::new(ControllerState {
                current: min,
                max: max.max(min),
                backoff_level: 0,
                backoff_until: None,
                last_adjust: None,
            }),
        }
    }

    pub fn current(&self) -> usize {
        self.state.lock().current
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.state.lock().max
    }

    pub fn backoff_level(&self) -> u32 {
        self.state.lock().backoff_level
    }

    pub fn backoff_until(&self) -> Option<Instant> {
        self.state.lock().backoff_until
    }

    /// Track the number of usable proxy buckets; `current` is clamped
    pub fn set_max(&self, max: usize) {
        let mut state = self.state.lock();
        state.max = max.max(self.min);
        state.current = state.current.min(state.max);
    }

    fn cooled_down(&self, state: &ControllerState, now: Instant) -> bool {
        state
            .last_adjust
            .map_or(true, |t| now.duration_since(t) >= self.adjust_cooldown)
    }

    pub fn on_success(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.backoff_level > 0 && state.backoff_until.map_or(true, |until| now >= until) {
            state.backoff_level -= 1;
        }
        if state.current < state.max && self.cooled_down(&state, now) {
            state.current += 1;
            state.last_adjust = Some(now);
        }
    }

    pub fn on_transient_error(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.current > self.min && self.cooled_down(&state, now) {
            state.current -= 1;
            state.last_adjust = Some(now);
        }
    }

    /// Enter backoff after a rate-limit answer; returns the backoff applied
    pub fn on_429(&self, base: Duration, max: Duration) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.backoff_level = (state.backoff_level + 1).min(MAX_BACKOFF_LEVEL);
        let exp = base.saturating_mul(1u32 << (state.backoff_level - 1));
        let wait = exp.min(max);

        let jitter_cap = (wait / 10).min(MAX_BACKOFF_JITTER);
        let jitter = if jitter_cap.is_zero() {
            Duration::ZERO
        } else {
            let cap_ms = jitter_cap.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
        };
        let wait = wait + jitter;

        let until = now + wait;
        state.backoff_until = Some(state.backoff_until.map_or(until, |prev| prev.max(until)));
        state.current = self.min;
        state.last_adjust = Some(now);
        wait
    }

    /// Sleep until any active backoff has passed; aborts on shutdown
    pub async fn wait_if_backoff(&self, shutdown: &mut Shutdown) -> Result<()> {
        loop {
            let until = self.state.lock().backoff_until;
            let now = Instant::now();
            match until {
                Some(until) if until > now => shutdown.sleep(until - now).await?,
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyScanError;
    use crate::shutdown::ShutdownHandle;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_growth_respects_cooldown_and_max() {
        let c = AdaptiveConcurrency::new(1, 3, Duration::from_secs(5));
        c.on_success();
        assert_eq!(c.current(), 2);
        c.on_success();
        assert_eq!(c.current(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        c.on_success();
        assert_eq!(c.current(), 3);

        tokio::time::advance(Duration::from_secs(5)).await;
        c.on_success();
        assert_eq!(c.current(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_floors_at_min() {
        let c = AdaptiveConcurrency::new(1, 4, Duration::ZERO);
        for _ in 0..3 {
            c.on_success();
        }
        assert_eq!(c.current(), 4);

        for _ in 0..10 {
            c.on_transient_error();
        }
        assert_eq!(c.current(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_resets_to_min_and_backoff_never_shrinks() {
        let c = AdaptiveConcurrency::new(1, 4, Duration::ZERO);
        for _ in 0..3 {
            c.on_success();
        }

        let first = c.on_429(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(c.current(), 1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let until_first = c.backoff_until().unwrap();

        let second = c.on_429(Duration::from_millis(100), Duration::from_secs(10));
        assert!(second >= Duration::from_millis(200));
        assert!(c.backoff_until().unwrap() >= until_first);
        assert_eq!(c.backoff_level(), 2);

        for _ in 0..20 {
            let wait = c.on_429(Duration::from_millis(100), Duration::from_secs(10));
            assert!(wait <= Duration::from_secs(11));
        }
        assert_eq!(c.backoff_level(), MAX_BACKOFF_LEVEL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_decays_after_expiry() {
        let c = AdaptiveConcurrency::new(1, 2, Duration::ZERO);
        c.on_429(Duration::from_millis(100), Duration::from_secs(1));
        c.on_success();
        assert_eq!(c.backoff_level(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        c.on_success();
        assert_eq!(c.backoff_level(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_max_clamps_current() {
        let c = AdaptiveConcurrency::new(1, 4, Duration::ZERO);
        for _ in 0..3 {
            c.on_success();
        }
        c.set_max(2);
        assert_eq!(c.current(), 2);
        c.set_max(0);
        assert_eq!(c.max(), 1);
        assert_eq!(c.current(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_if_backoff() {
        let c = AdaptiveConcurrency::new(1, 2, Duration::ZERO);
        let mut shutdown = Shutdown::never();
        assert_ok!(c.wait_if_backoff(&mut shutdown).await);

        let wait = c.on_429(Duration::from_millis(500), Duration::from_secs(1));
        let started = Instant::now();
        assert_ok!(c.wait_if_backoff(&mut shutdown).await);
        assert!(started.elapsed() >= wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_if_backoff_is_cancellable() {
        let c = AdaptiveConcurrency::new(1, 2, Duration::ZERO);
        c.on_429(Duration::from_secs(60), Duration::from_secs(60));

        let (handle, mut shutdown) = ShutdownHandle::new();
        handle.shutdown();
        let err = assert_err!(c.wait_if_backoff(&mut shutdown).await);
        assert!(matches!(err, ProxyScanError::Cancelled));
    }
}
