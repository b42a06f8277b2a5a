//! Retry, circuit breaking, rate limiting and connection recovery around
//! connector I/O.
//!
//! On by default for every connector; the knobs below can be overridden per
//! connector through reserved parameter keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use sqlflow::{Error, Reason, WithErrorInfo};

/// Cooperative cancellation. Checked before each operation starts and at
/// every retry decision point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_canceled() {
            Err(Error::new(Reason::Canceled))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// ±fraction applied to each backoff delay.
    pub jitter: f64,

    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,

    pub rate_per_min: u32,
    pub burst: u32,

    pub request_timeout: Duration,
    pub max_recovery_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            rate_per_min: 300,
            burst: 50,
            request_timeout: Duration::from_secs(30),
            max_recovery_attempts: 3,
        }
    }
}

impl ResilienceConfig {
    /// Overlay reserved connector params onto the defaults.
    pub fn from_params(params: &serde_json::Value) -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        let get = |key: &str| params.get(key).and_then(|v| v.as_u64());

        if let Some(v) = get("retry_max_attempts") {
            config.max_attempts = v as u32;
        }
        if let Some(v) = get("retry_initial_delay_ms") {
            config.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = get("circuit_failure_threshold") {
            config.failure_threshold = v as u32;
        }
        if let Some(v) = get("circuit_recovery_secs") {
            config.recovery_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("rate_limit_per_min") {
            config.rate_per_min = v as u32;
        }
        if let Some(v) = get("rate_limit_burst") {
            config.burst = v as u32;
        }
        if let Some(v) = get("request_timeout_secs") {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = get("max_recovery_attempts") {
            config.max_recovery_attempts = v as u32;
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-endpoint circuit breaker:
/// CLOSED → OPEN after `failure_threshold` consecutive failures; OPEN rejects
/// until `recovery_timeout` has passed, then HALF_OPEN admits probes;
/// `success_threshold` successes close it, one failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(config: &ResilienceConfig) -> CircuitBreaker {
        CircuitBreaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            success_threshold: config.success_threshold,
        }
    }

    fn check_at(&mut self, endpoint: &str, now: Instant) -> Result<(), Error> {
        if self.state == BreakerState::Open {
            let elapsed = self.opened_at.map(|t| now.duration_since(t));
            if elapsed.is_some_and(|e| e >= self.recovery_timeout) {
                log::info!("circuit for `{endpoint}` half-open after recovery timeout");
                self.state = BreakerState::HalfOpen;
                self.half_open_successes = 0;
            } else {
                return Err(Error::new(Reason::CircuitOpen {
                    endpoint: endpoint.to_string(),
                })
                .push_hint("the endpoint has been failing repeatedly; wait for the recovery timeout"));
            }
        }
        Ok(())
    }

    fn on_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.success_threshold {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                }
            }
            _ => self.consecutive_failures = 0,
        }
    }

    fn on_failure_at(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
            }
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                }
            }
        }
    }
}

/// Per-host token bucket. Blocks rather than drops: callers wait for refill.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &ResilienceConfig) -> TokenBucket {
        TokenBucket {
            tokens: config.burst as f64,
            capacity: config.burst as f64,
            refill_per_sec: config.rate_per_min as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or say how long until one is available.
    fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    fn acquire_blocking(&mut self, host: &str, cancel: &CancelToken) -> Result<(), Error> {
        loop {
            cancel.check()?;
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    log::debug!(
                        "{}",
                        Reason::RateLimited {
                            host: host.to_string()
                        }
                    );
                    std::thread::sleep(wait.min(Duration::from_millis(200)));
                }
            }
        }
    }
}

/// The wrapper composed around every connector's network/IO calls.
pub struct Resilience {
    config: ResilienceConfig,
    breakers: HashMap<String, CircuitBreaker>,
    buckets: HashMap<String, TokenBucket>,
    cancel: CancelToken,
}

impl Resilience {
    pub fn new(config: ResilienceConfig, cancel: CancelToken) -> Resilience {
        Resilience {
            config,
            breakers: HashMap::new(),
            buckets: HashMap::new(),
            cancel,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn call<T>(
        &mut self,
        endpoint: &str,
        mut op: impl FnMut() -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.call_attempts(endpoint, |_| op())
    }

    /// Run `op` with retry, circuit breaking and rate limiting. The closure
    /// sees the attempt context; `attempt.reconnect` is set after a
    /// connection-level failure, bounded by `max_recovery_attempts`, so the
    /// connector can rebuild its connection before trying again.
    pub fn call_attempts<T>(
        &mut self,
        endpoint: &str,
        mut op: impl FnMut(&Attempt) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let breaker = self
            .breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.config));
        let bucket = self
            .buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| TokenBucket::new(&self.config));

        let mut context = Attempt {
            number: 1,
            reconnect: false,
        };
        let mut recoveries: u32 = 0;

        loop {
            self.cancel.check()?;
            breaker.check_at(endpoint, Instant::now())?;
            bucket.acquire_blocking(endpoint, &self.cancel)?;

            match op(&context) {
                Ok(value) => {
                    breaker.on_success();
                    return Ok(value);
                }
                Err(error) if error.reason.is_retryable() => {
                    breaker.on_failure_at(Instant::now());
                    if context.number >= self.config.max_attempts {
                        log::warn!(
                            "`{endpoint}` failed after {} attempts: {}",
                            context.number,
                            error.reason
                        );
                        return Err(error);
                    }

                    context.reconnect = false;
                    if matches!(error.reason, Reason::ConnectionFailed { .. }) {
                        recoveries += 1;
                        if recoveries > self.config.max_recovery_attempts {
                            log::warn!("`{endpoint}`: recovery budget exhausted");
                            return Err(error);
                        }
                        context.reconnect = true;
                    }

                    let delay = backoff_delay(&self.config, context.number);
                    context.number += 1;
                    log::warn!(
                        "retryable error from `{endpoint}` (attempt {}): {} -> sleeping {}ms",
                        context.number - 1,
                        error.reason,
                        delay.as_millis()
                    );
                    sleep_cancellable(delay, &self.cancel)?;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// What the closure passed to [Resilience::call_attempts] learns about the
/// in-flight attempt.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// 1-based attempt counter.
    pub number: u32,
    /// The previous attempt hit a connection-level failure: tear down and
    /// rebuild the connection before doing any work.
    pub reconnect: bool,
}

fn backoff_delay(config: &ResilienceConfig, attempt: u32) -> Duration {
    let base = config.initial_delay.as_secs_f64()
        * config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(-config.jitter..=config.jitter);
    Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
}

fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> Result<(), Error> {
    let deadline = Instant::now() + total;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
