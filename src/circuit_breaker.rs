//! Circuit breaker with a sliding failure window.
//!
//! One breaker per named upstream service. Failures are counted inside a
//! rolling monitor window; crossing the threshold opens the circuit and
//! rejections while open are NOT counted as failures. After the reset
//! timeout the first arriving call transitions the breaker to half-open and
//! probes the service; success closes the circuit, failure re-arms it.
//! State transitions are linearizable per instance (CAS on the state word).

use crate::clock::{Clock, MonotonicClock};
use crate::error::EnsembleError;
use crate::events::{EngineEvent, EventSink, NullSink};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitor window before the circuit opens.
    pub failure_threshold: usize,
    /// How long the circuit stays open before allowing a probe.
    pub reset_timeout: Duration,
    /// Rolling window over which failures are counted.
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitor_window: Duration::from_secs(120),
        }
    }
}

/// Read-only view of a breaker for health scoring and recovery automation.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    /// Time until the next probe is allowed; zero when not open.
    pub next_attempt_in: Duration,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    /// Failure timestamps (clock millis) inside the monitor window.
    window: Mutex<VecDeque<u64>>,
    next_attempt_at: AtomicU64,
    half_open_probes: AtomicUsize,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.current_state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            window: Mutex::new(VecDeque::new()),
            next_attempt_at: AtomicU64::new(0),
            half_open_probes: AtomicUsize::new(0),
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now_millis();
        let next = self.next_attempt_at.load(Ordering::Acquire);
        BreakerSnapshot {
            service: self.service.clone(),
            state: self.current_state(),
            failures_in_window: self.failures_in_window(now),
            next_attempt_in: Duration::from_millis(next.saturating_sub(now)),
        }
    }

    /// Whether an open breaker is past its reset timeout (a probe would be
    /// admitted). Used by recovery automation.
    #[must_use]
    pub fn probe_due(&self) -> bool {
        self.current_state() == CircuitState::Open
            && self.clock.now_millis() >= self.next_attempt_at.load(Ordering::Acquire)
    }

    /// Reset to closed, clearing all recorded failures.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.window.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.next_attempt_at.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        tracing::info!(service = %self.service, "circuit breaker reset to closed");
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, EnsembleError>
    where
        T: Send,
        Fut: Future<Output = Result<T, EnsembleError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let now = self.clock.now_millis();
                    let next = self.next_attempt_at.load(Ordering::Acquire);
                    if now < next {
                        return Err(EnsembleError::CircuitOpen {
                            service: self.service.clone(),
                            retry_after: Duration::from_millis(next - now),
                        });
                    }
                    // Reset timeout elapsed: first caller wins the probe slot.
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.half_open_probes.store(1, Ordering::Release);
                            self.sink.emit(EngineEvent::BreakerHalfOpen {
                                service: self.service.clone(),
                            });
                            tracing::debug!(service = %self.service, "circuit breaker half-open");
                            break;
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // One probe at a time; everyone else is rejected as open.
                    let probes = self.half_open_probes.fetch_add(1, Ordering::AcqRel);
                    if probes >= 1 {
                        self.half_open_probes.fetch_sub(1, Ordering::Release);
                        return Err(EnsembleError::CircuitOpen {
                            service: self.service.clone(),
                            retry_after: self.config.reset_timeout,
                        });
                    }
                    break;
                }
                _ => break,
            }
        }

        let was_half_open = self.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.half_open_probes.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    fn failures_in_window(&self, now: u64) -> usize {
        let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let horizon = now.saturating_sub(self.config.monitor_window.as_millis() as u64);
        while window.front().is_some_and(|&t| t < horizon) {
            window.pop_front();
        }
        window.len()
    }

    fn on_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.window.lock().unwrap_or_else(|p| p.into_inner()).clear();
                    self.next_attempt_at.store(0, Ordering::Release);
                    self.sink.emit(EngineEvent::BreakerClosed { service: self.service.clone() });
                    tracing::info!(service = %self.service, "circuit breaker closed");
                }
            }
            STATE_CLOSED => {
                // Successes age failures out naturally via the window; no
                // hard reset so a flapping service can still trip.
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();

        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.arm(now);
                    let failures = self.failures_in_window(now);
                    self.sink.emit(EngineEvent::BreakerOpened {
                        service: self.service.clone(),
                        failures,
                    });
                    tracing::warn!(service = %self.service, "probe failed, circuit breaker re-opened");
                }
            }
            STATE_CLOSED => {
                let failures = {
                    let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
                    window.push_back(now);
                    let horizon =
                        now.saturating_sub(self.config.monitor_window.as_millis() as u64);
                    while window.front().is_some_and(|&t| t < horizon) {
                        window.pop_front();
                    }
                    window.len()
                };

                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.arm(now);
                    self.sink.emit(EngineEvent::BreakerOpened {
                        service: self.service.clone(),
                        failures,
                    });
                    tracing::error!(
                        service = %self.service,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                }
            }
            _ => {}
        }
    }

    fn arm(&self, now: u64) {
        let next = now + self.config.reset_timeout.as_millis() as u64;
        self.next_attempt_at.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCategory;
    use crate::role::ProviderId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fail() -> EnsembleError {
        EnsembleError::model_failure(ProviderId::OpenAi, "gpt-4o", ErrorCategory::ServerError, "503")
    }

    fn breaker(threshold: usize, reset_ms: u64, window_ms: u64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            "openai:gpt-4o",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                monitor_window: Duration::from_millis(window_ms),
            },
        )
        .with_clock(Arc::new(clock.clone()));
        (breaker, clock)
    }

    async fn run_failure(breaker: &CircuitBreaker) -> Result<(), EnsembleError> {
        breaker.execute(|| async { Err::<(), _>(fail()) }).await
    }

    async fn run_success(breaker: &CircuitBreaker, counter: &Arc<AtomicUsize>) -> Result<u32, EnsembleError> {
        let counter = counter.clone();
        breaker
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, EnsembleError>(42)
                }
            })
            .await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls() {
        let (breaker, _clock) = breaker(3, 1_000, 5_000);
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(run_success(&breaker, &counter).await.unwrap(), 42);
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_in_window() {
        let (breaker, _clock) = breaker(3, 1_000, 5_000);
        for _ in 0..3 {
            let _ = run_failure(&breaker).await;
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);

        // Next call is rejected without invoking the operation.
        let counter = Arc::new(AtomicUsize::new(0));
        let result = run_success(&breaker, &counter).await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_count() {
        let (breaker, clock) = breaker(3, 1_000, 5_000);
        let _ = run_failure(&breaker).await;
        let _ = run_failure(&breaker).await;

        // Let the window slide past the first two failures.
        clock.advance(6_000);

        let _ = run_failure(&breaker).await;
        assert_eq!(
            breaker.current_state(),
            CircuitState::Closed,
            "only one failure is inside the window"
        );
    }

    #[tokio::test]
    async fn open_rejections_are_not_counted_as_failures() {
        let (breaker, _clock) = breaker(2, 10_000, 60_000);
        let _ = run_failure(&breaker).await;
        let _ = run_failure(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);

        for _ in 0..10 {
            let _ = run_failure(&breaker).await;
        }
        assert_eq!(breaker.snapshot().failures_in_window, 2);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let (breaker, clock) = breaker(2, 1_000, 60_000);
        let _ = run_failure(&breaker).await;
        let _ = run_failure(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);

        clock.advance(1_500);
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(run_success(&breaker, &counter).await.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "probe executed");
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 0, "window cleared on close");
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let (breaker, clock) = breaker(2, 1_000, 60_000);
        let _ = run_failure(&breaker).await;
        let _ = run_failure(&breaker).await;

        clock.advance(1_500);
        let _ = run_failure(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);

        // Re-armed: still rejecting before the new reset timeout.
        let counter = Arc::new(AtomicUsize::new(0));
        let result = run_success(&breaker, &counter).await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejection_reports_retry_after() {
        let (breaker, _clock) = breaker(1, 30_000, 60_000);
        let _ = run_failure(&breaker).await;

        match run_failure(&breaker).await.unwrap_err() {
            EnsembleError::CircuitOpen { service, retry_after } => {
                assert_eq!(service, "openai:gpt-4o");
                assert!(retry_after <= Duration::from_millis(30_000));
                assert!(retry_after > Duration::ZERO);
            }
            e => panic!("expected CircuitOpen, got {e}"),
        }
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let (breaker, _clock) = breaker(1, 30_000, 60_000);
        let _ = run_failure(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 0);
    }

    #[tokio::test]
    async fn probe_due_tracks_reset_timeout() {
        let (breaker, clock) = breaker(1, 1_000, 60_000);
        let _ = run_failure(&breaker).await;
        assert!(!breaker.probe_due());

        clock.advance(1_000);
        assert!(breaker.probe_due());
    }

    #[tokio::test]
    async fn half_open_admits_one_probe_at_a_time() {
        let (breaker, clock) = breaker(1, 1_000, 60_000);
        let breaker = Arc::new(breaker);
        let _ = run_failure(&breaker).await;
        clock.advance(1_000);

        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..3 {
            let breaker = Arc::clone(&breaker);
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .execute(|| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, EnsembleError>(42)
                        }
                    })
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| {
                r.as_ref().unwrap().as_ref().err().is_some_and(|e| e.is_circuit_open())
            })
            .count();

        assert_eq!(successes, 1, "only the probe call may execute half-open");
        assert_eq!(rejected, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emits_breaker_events() {
        use crate::events::MemorySink;

        let sink = MemorySink::with_capacity(16);
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(100),
                monitor_window: Duration::from_secs(60),
            },
        )
        .with_clock(Arc::new(clock.clone()))
        .with_sink(Arc::new(sink.clone()));

        let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        clock.advance(150);
        let _ = breaker.execute(|| async { Ok::<_, EnsembleError>(()) }).await;

        assert_eq!(sink.count_where(|e| matches!(e, EngineEvent::BreakerOpened { .. })), 1);
        assert_eq!(sink.count_where(|e| matches!(e, EngineEvent::BreakerHalfOpen { .. })), 1);
        assert_eq!(sink.count_where(|e| matches!(e, EngineEvent::BreakerClosed { .. })), 1);
    }
}
