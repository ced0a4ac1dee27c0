//! Request budget enforcement with human-like pacing.
//!
//! `RateGate` admits at most `max_requests` requests in any trailing window
//! and, independently of the budget, sleeps a randomized "natural" delay
//! after every admission. One gate may be shared across workers through an
//! `Arc`; the window bookkeeping sits behind a mutex because checking and
//! recording an admission is a read-modify-write.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Sliding window of admission timestamps.
#[derive(Debug)]
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Creates an empty window.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            admitted: VecDeque::with_capacity(max_requests.min(1024)),
        }
    }

    /// Records an admission at `now` if fewer than `max_requests` fall in the trailing window.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.admitted.len() < self.max_requests {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Number of admissions still inside the window at `now`.
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.admitted.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Randomized delay applied after every admitted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Mean of the Gaussian delay, in milliseconds.
    pub mean_ms: u64,
    /// Standard deviation of the Gaussian delay, in milliseconds.
    pub sigma_ms: u64,
    /// Lower bound of the Gaussian delay, in milliseconds.
    pub floor_ms: u64,
    /// Probability of adding an extended pause.
    pub long_pause_probability: f64,
    /// Extended pause range, in milliseconds.
    pub long_pause_min_ms: u64,
    pub long_pause_max_ms: u64,
}

impl PacingConfig {
    /// No pacing at all.
    pub fn disabled() -> Self {
        Self {
            mean_ms: 0,
            sigma_ms: 0,
            floor_ms: 0,
            long_pause_probability: 0.0,
            long_pause_min_ms: 0,
            long_pause_max_ms: 0,
        }
    }

    /// Draws one delay.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let mean = self.mean_ms as f64;
        let gaussian = match Normal::new(mean, self.sigma_ms as f64) {
            Ok(normal) => normal.sample(rng),
            Err(_) => mean,
        };
        let mut delay_ms = gaussian.max(self.floor_ms as f64);

        if self.long_pause_probability > 0.0
            && rng.gen_bool(self.long_pause_probability.clamp(0.0, 1.0))
        {
            delay_ms += random_between(rng, self.long_pause_min_ms, self.long_pause_max_ms) as f64;
        }

        Duration::from_millis(delay_ms.round() as u64)
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            mean_ms: 2000,
            sigma_ms: 500,
            floor_ms: 500,
            long_pause_probability: 0.1,
            long_pause_min_ms: 2000,
            long_pause_max_ms: 5000,
        }
    }
}

/// Request budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admissions per window.
    pub max_requests: usize,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Randomized wait between admission checks while over budget, in milliseconds.
    pub wait_min_ms: u64,
    pub wait_max_ms: u64,
    /// Delay applied after each admission.
    pub pacing: PacingConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            window_secs: 3600,
            wait_min_ms: 5000,
            wait_max_ms: 15000,
            pacing: PacingConfig::default(),
        }
    }
}

/// Shared request budget.
pub struct RateGate {
    config: RateLimitConfig,
    window: Mutex<SlidingWindow>,
}

impl RateGate {
    /// Creates a gate from its configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let window = SlidingWindow::new(config.max_requests, Duration::from_secs(config.window_secs));
        Self {
            config,
            window: Mutex::new(window),
        }
    }

    /// Creates a gate admitting `max_requests` per `window` with default waits and pacing.
    pub fn per_window(max_requests: usize, window: Duration) -> Self {
        let window_secs = window.as_secs().max(1);
        Self::new(RateLimitConfig {
            max_requests,
            window_secs,
            ..Default::default()
        })
    }

    /// Returns the gate configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admits one request now if the budget allows.
    pub async fn try_admit(&self) -> bool {
        self.window.lock().await.try_admit(Instant::now())
    }

    /// Number of admissions in the current window.
    pub async fn in_window(&self) -> usize {
        self.window.lock().await.in_window(Instant::now())
    }

    /// Waits until a request is admitted, then applies the natural delay.
    ///
    /// Returns the instant of admission.
    pub async fn acquire(&self) -> Instant {
        loop {
            let now = Instant::now();
            if self.window.lock().await.try_admit(now) {
                let pause = self.natural_delay();
                if !pause.is_zero() {
                    debug!("Pacing for {:.2}s", pause.as_secs_f64());
                    tokio::time::sleep(pause).await;
                }
                return now;
            }

            let wait = Duration::from_millis(random_between(
                &mut rand::thread_rng(),
                self.config.wait_min_ms,
                self.config.wait_max_ms,
            ));
            info!("Rate limit reached, waiting {:.2} seconds", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    fn natural_delay(&self) -> Duration {
        self.config.pacing.sample(&mut rand::thread_rng())
    }
}

fn random_between<R: Rng + ?Sized>(rng: &mut R, min: u64, max: u64) -> u64 {
    if max <= min {
        min
    } else {
        rng.gen_range(min..=max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn quiet_config(max_requests: usize, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window_secs,
            wait_min_ms: 100,
            wait_max_ms: 250,
            pacing: PacingConfig::disabled(),
        }
    }

    /// Largest number of admissions inside any trailing window.
    fn max_in_any_window(stamps: &[Instant], window: Duration) -> usize {
        stamps
            .iter()
            .map(|&start| {
                stamps
                    .iter()
                    .filter(|&&t| t >= start && t.duration_since(start) < window)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_window_admits_up_to_budget() {
        let base = Instant::now();
        let mut window = SlidingWindow::new(2, Duration::from_secs(10));
        assert!(window.try_admit(base));
        assert!(window.try_admit(base + Duration::from_secs(1)));
        assert!(!window.try_admit(base + Duration::from_secs(2)));
        assert_eq!(window.in_window(base + Duration::from_secs(2)), 2);
    }

    #[test]
    fn test_window_evicts_expired() {
        let base = Instant::now();
        let mut window = SlidingWindow::new(1, Duration::from_secs(10));
        assert!(window.try_admit(base));
        assert!(!window.try_admit(base + Duration::from_millis(9_999)));
        assert!(window.try_admit(base + Duration::from_secs(10)));
    }

    #[test]
    fn test_window_zero_budget_never_admits() {
        let mut window = SlidingWindow::new(0, Duration::from_secs(1));
        assert!(!window.try_admit(Instant::now()));
    }

    proptest! {
        #[test]
        fn prop_window_never_exceeds_budget(
            max_requests in 1usize..6,
            window_ms in 1u64..2_000,
            gaps in proptest::collection::vec(0u64..500, 1..80),
        ) {
            let window = Duration::from_millis(window_ms);
            let mut limiter = SlidingWindow::new(max_requests, window);
            let base = Instant::now();
            let mut now = base;
            let mut admitted = Vec::new();
            for gap in gaps {
                now += Duration::from_millis(gap);
                if limiter.try_admit(now) {
                    admitted.push(now);
                }
            }
            prop_assert!(max_in_any_window(&admitted, window) <= max_requests);
        }
    }

    #[test]
    fn test_pacing_disabled_is_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(PacingConfig::disabled().sample(&mut rng), Duration::ZERO);
    }

    #[test]
    fn test_pacing_respects_floor() {
        let mut rng = StdRng::seed_from_u64(42);
        let pacing = PacingConfig {
            long_pause_probability: 0.0,
            ..Default::default()
        };
        for _ in 0..500 {
            assert!(pacing.sample(&mut rng) >= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_pacing_long_pause_always() {
        let mut rng = StdRng::seed_from_u64(3);
        let pacing = PacingConfig {
            mean_ms: 100,
            sigma_ms: 0,
            floor_ms: 0,
            long_pause_probability: 1.0,
            long_pause_min_ms: 2000,
            long_pause_max_ms: 5000,
        };
        let delay = pacing.sample(&mut rng);
        assert!(delay >= Duration::from_millis(2100));
        assert!(delay <= Duration::from_millis(5100));
    }

    #[test]
    fn test_rate_limit_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_requests, 1000);
        assert_eq!(config.window_secs, 3600);
        assert_eq!(config.pacing.mean_ms, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_try_admit() {
        let gate = RateGate::new(quiet_config(2, 60));
        assert!(gate.try_admit().await);
        assert!(gate.try_admit().await);
        assert!(!gate.try_admit().await);
        assert_eq!(gate.in_window().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_acquire_waits_for_window() {
        let gate = RateGate::new(quiet_config(1, 5));
        let first = gate.acquire().await;
        let second = gate.acquire().await;
        assert!(second.duration_since(first) >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_concurrent_callers_respect_budget() {
        let gate = Arc::new(RateGate::new(quiet_config(3, 2)));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.acquire().await })
            })
            .collect();

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }
        stamps.sort();

        assert_eq!(stamps.len(), 12);
        assert!(max_in_any_window(&stamps, Duration::from_secs(2)) <= 3);
    }

    #[test]
    fn test_per_window_constructor() {
        let gate = RateGate::per_window(10, Duration::from_secs(60));
        assert_eq!(gate.config().max_requests, 10);
        assert_eq!(gate.config().window_secs, 60);
    }
}
