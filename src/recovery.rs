//! Background recovery automation.
//!
//! Every cycle, services whose breaker is open and past its reset timeout
//! get a small playbook keyed by their last classified error. Probe-style
//! actions exercise the service through its breaker (so a good probe closes
//! the circuit); traffic-shifting actions lean on the fallback manager's
//! health filtering, which is already steering load away. Auth failures are
//! terminal after one credential refresh attempt: they page a human instead
//! of looping.

use crate::breaker_registry::BreakerRegistry;
use crate::clock::Clock;
use crate::degradation::DegradationManager;
use crate::error::{EnsembleError, ErrorCategory};
use crate::events::{EngineEvent, EventSink, NullSink};
use crate::health::HealthTracker;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Attempt budget per service within [`RATE_WINDOW`].
const MAX_ATTEMPTS_PER_WINDOW: usize = 3;
const RATE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    WaitAndRetry,
    SwitchProvider,
    ReduceLoad,
    IncreaseTimeout,
    RetryWithBackoff,
    SwitchEndpoint,
    UseFallback,
    RefreshCredentials,
    AlertAdmin,
}

impl RecoveryAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::WaitAndRetry => "wait_and_retry",
            RecoveryAction::SwitchProvider => "switch_provider",
            RecoveryAction::ReduceLoad => "reduce_load",
            RecoveryAction::IncreaseTimeout => "increase_timeout",
            RecoveryAction::RetryWithBackoff => "retry_with_backoff",
            RecoveryAction::SwitchEndpoint => "switch_endpoint",
            RecoveryAction::UseFallback => "use_fallback",
            RecoveryAction::RefreshCredentials => "refresh_credentials",
            RecoveryAction::AlertAdmin => "alert_admin",
        }
    }

    /// Probe actions exercise the service; advisory actions shift traffic
    /// and end the playbook.
    fn is_probe(&self) -> bool {
        matches!(
            self,
            RecoveryAction::WaitAndRetry
                | RecoveryAction::IncreaseTimeout
                | RecoveryAction::RetryWithBackoff
                | RecoveryAction::SwitchEndpoint
                | RecoveryAction::RefreshCredentials
        )
    }
}

/// Remediation sequence for a failure category.
#[must_use]
pub fn playbook(category: ErrorCategory) -> &'static [RecoveryAction] {
    use RecoveryAction::*;
    match category {
        ErrorCategory::RateLimit => &[WaitAndRetry, SwitchProvider, ReduceLoad],
        ErrorCategory::Timeout => &[IncreaseTimeout, RetryWithBackoff, SwitchEndpoint],
        ErrorCategory::ServerError => &[RetryWithBackoff, SwitchProvider, UseFallback],
        ErrorCategory::AuthError => &[RefreshCredentials, AlertAdmin],
        ErrorCategory::NetworkError => &[RetryWithBackoff, SwitchEndpoint],
        ErrorCategory::ServiceUnavailable => &[WaitAndRetry, UseFallback],
        _ => &[RetryWithBackoff],
    }
}

/// Cheap service probe used by recovery cycles.
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    async fn probe(&self, service: &str) -> Result<(), EnsembleError>;
}

pub struct RecoveryAutomation {
    breakers: BreakerRegistry,
    health: HealthTracker,
    probe: Arc<dyn RecoveryProbe>,
    degradation: Arc<DegradationManager>,
    interval: Duration,
    attempts: Mutex<HashMap<String, VecDeque<u64>>>,
    alerted: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RecoveryAutomation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryAutomation").field("interval", &self.interval).finish()
    }
}

impl RecoveryAutomation {
    pub fn new(
        breakers: BreakerRegistry,
        health: HealthTracker,
        probe: Arc<dyn RecoveryProbe>,
        degradation: Arc<DegradationManager>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers,
            health,
            probe,
            degradation,
            interval,
            attempts: Mutex::new(HashMap::new()),
            alerted: Mutex::new(HashSet::new()),
            clock,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Spawn the periodic recovery loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One recovery cycle over every probe-due breaker.
    pub async fn run_once(&self) {
        if self.degradation.is_feature_restricted("auto_recovery") {
            tracing::debug!("auto recovery restricted by degradation level, skipping cycle");
            return;
        }

        for breaker in self.breakers.probe_candidates() {
            let service = breaker.service().to_string();

            if self.alerted.lock().unwrap_or_else(|p| p.into_inner()).contains(&service) {
                continue;
            }
            if !self.try_take_attempt(&service) {
                tracing::debug!(service = %service, "recovery attempt budget exhausted for window");
                continue;
            }

            let category = self
                .health
                .record(&service)
                .and_then(|r| r.last_error_category)
                .unwrap_or(ErrorCategory::Unknown);

            for action in playbook(category) {
                if action.is_probe() {
                    let started = Instant::now();
                    let result = breaker.execute(|| self.probe.probe(&service)).await;
                    let success = result.is_ok();

                    match &result {
                        Ok(()) => self.health.record_success(&service, started.elapsed()),
                        Err(e) => self.health.record_failure(
                            &service,
                            Some(e.category()),
                            &e.to_string(),
                            started.elapsed(),
                        ),
                    }
                    self.sink.emit(EngineEvent::RecoveryAttempted {
                        service: service.clone(),
                        action: action.as_str(),
                        success,
                    });

                    if success {
                        break;
                    }
                    if *action == RecoveryAction::RefreshCredentials {
                        // One refresh attempt only; the next step alerts.
                        continue;
                    }
                    // Failed probe re-armed the breaker; no point running
                    // more probe actions this cycle.
                    break;
                }

                match action {
                    RecoveryAction::AlertAdmin => {
                        tracing::error!(
                            service = %service,
                            category = category.as_str(),
                            "auth recovery exhausted, paging admin"
                        );
                        self.alerted.lock().unwrap_or_else(|p| p.into_inner()).insert(service.clone());
                        self.sink.emit(EngineEvent::RecoveryAttempted {
                            service: service.clone(),
                            action: action.as_str(),
                            success: false,
                        });
                        break;
                    }
                    _ => {
                        // Traffic-shifting advisory: the fallback manager's
                        // health filtering is already routing around this
                        // service.
                        self.sink.emit(EngineEvent::RecoveryAttempted {
                            service: service.clone(),
                            action: action.as_str(),
                            success: true,
                        });
                        break;
                    }
                }
            }
        }
    }

    /// Sliding-window rate limit on recovery attempts per service.
    fn try_take_attempt(&self, service: &str) -> bool {
        let now = self.clock.now_millis();
        let horizon = now.saturating_sub(RATE_WINDOW.as_millis() as u64);

        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        let window = attempts.entry(service.to_string()).or_default();
        while window.front().is_some_and(|&t| t < horizon) {
            window.pop_front();
        }
        if window.len() >= MAX_ATTEMPTS_PER_WINDOW {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Clear the terminal-alert flag for a service (after an operator fixed
    /// credentials).
    pub fn acknowledge_alert(&self, service: &str) {
        self.alerted.lock().unwrap_or_else(|p| p.into_inner()).remove(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::clock::ManualClock;
    use crate::events::{MemorySink, NullSink};
    use crate::role::ProviderId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProbe {
        fail_first: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn healthy() -> Self {
            Self { fail_first: AtomicUsize::new(0), calls: AtomicUsize::new(0) }
        }

        fn failing(times: usize) -> Self {
            Self { fail_first: AtomicUsize::new(times), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl RecoveryProbe for ScriptedProbe {
        async fn probe(&self, _service: &str) -> Result<(), EnsembleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(EnsembleError::model_failure(
                    ProviderId::OpenAi,
                    "gpt-4o",
                    ErrorCategory::ServerError,
                    "still down",
                ));
            }
            Ok(())
        }
    }

    struct Harness {
        automation: RecoveryAutomation,
        breakers: BreakerRegistry,
        health: HealthTracker,
        clock: ManualClock,
        probe: Arc<ScriptedProbe>,
        sink: MemorySink,
    }

    fn harness(probe: ScriptedProbe) -> Harness {
        let clock = ManualClock::new();
        let health = HealthTracker::new();
        let breakers = BreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(1_000),
                monitor_window: Duration::from_secs(120),
            },
            Arc::new(clock.clone()),
            Arc::new(NullSink),
        );
        let probe = Arc::new(probe);
        let sink = MemorySink::with_capacity(64);
        let automation = RecoveryAutomation::new(
            breakers.clone(),
            health.clone(),
            probe.clone(),
            Arc::new(DegradationManager::new(true)),
            Duration::from_secs(60),
            Arc::new(clock.clone()),
        )
        .with_sink(Arc::new(sink.clone()));
        Harness { automation, breakers, health, clock, probe, sink }
    }

    async fn trip(harness: &Harness, service: &str, category: ErrorCategory) {
        let breaker = harness.breakers.get_or_create(service);
        for _ in 0..2 {
            let service = service.to_string();
            let _ = breaker
                .execute(|| {
                    let service = service.clone();
                    async move {
                        Err::<(), _>(EnsembleError::model_failure(
                            ProviderId::OpenAi,
                            service,
                            category,
                            "boom",
                        ))
                    }
                })
                .await;
            harness.health.record_failure(&service, Some(category), "boom", Duration::ZERO);
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn successful_probe_closes_breaker() {
        let harness = harness(ScriptedProbe::healthy());
        trip(&harness, "openai:gpt-4o", ErrorCategory::ServerError).await;

        // Not yet due: nothing happens.
        harness.automation.run_once().await;
        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 0);

        harness.clock.advance(1_000);
        harness.automation.run_once().await;

        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 1);
        assert!(!harness.breakers.is_open("openai:gpt-4o"));
        assert_eq!(
            harness.sink.count_where(|e| matches!(
                e,
                EngineEvent::RecoveryAttempted { action, success, .. } if *action == "retry_with_backoff" && *success
            )),
            1
        );
    }

    #[tokio::test]
    async fn failed_probe_rearms_breaker() {
        let harness = harness(ScriptedProbe::failing(10));
        trip(&harness, "openai:gpt-4o", ErrorCategory::ServerError).await;

        harness.clock.advance(1_000);
        harness.automation.run_once().await;

        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 1);
        assert!(harness.breakers.is_open("openai:gpt-4o"));
    }

    #[tokio::test]
    async fn attempts_are_rate_limited_per_window() {
        let harness = harness(ScriptedProbe::failing(100));
        trip(&harness, "openai:gpt-4o", ErrorCategory::ServerError).await;

        for _ in 0..6 {
            harness.clock.advance(1_000);
            harness.automation.run_once().await;
        }
        assert_eq!(
            harness.probe.calls.load(Ordering::SeqCst),
            MAX_ATTEMPTS_PER_WINDOW,
            "attempts beyond the window budget must be skipped"
        );

        // A fresh window grants budget again.
        harness.clock.advance(RATE_WINDOW.as_millis() as u64);
        harness.automation.run_once().await;
        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), MAX_ATTEMPTS_PER_WINDOW + 1);
    }

    #[tokio::test]
    async fn auth_errors_alert_and_become_terminal() {
        let harness = harness(ScriptedProbe::failing(100));
        trip(&harness, "openai:gpt-4o", ErrorCategory::AuthError).await;

        harness.clock.advance(1_000);
        harness.automation.run_once().await;

        // refresh_credentials probed once, then alert_admin fired.
        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.sink.count_where(|e| matches!(
                e,
                EngineEvent::RecoveryAttempted { action, .. } if *action == "alert_admin"
            )),
            1
        );

        // Terminal: further cycles skip the service entirely.
        harness.clock.advance(2_000);
        harness.automation.run_once().await;
        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 1);

        // Until an operator acknowledges.
        harness.automation.acknowledge_alert("openai:gpt-4o");
        harness.clock.advance(2_000);
        harness.automation.run_once().await;
        assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_wait_and_retry_ends_the_cycle_for_rate_limits() {
        let harness = harness(ScriptedProbe::failing(100));
        trip(&harness, "openai:gpt-4o", ErrorCategory::RateLimit).await;

        harness.clock.advance(1_000);
        harness.automation.run_once().await;

        // wait_and_retry probed and failed; breaker re-armed, so the
        // advisory switch_provider action did not run this cycle.
        assert_eq!(
            harness.sink.count_where(|e| matches!(
                e,
                EngineEvent::RecoveryAttempted { action, success, .. } if *action == "wait_and_retry" && !*success
            )),
            1
        );
    }

    #[tokio::test]
    async fn restricted_auto_recovery_skips_cycles() {
        let clock = ManualClock::new();
        let health = HealthTracker::new();
        let breakers = BreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(100),
                monitor_window: Duration::from_secs(120),
            },
            Arc::new(clock.clone()),
            Arc::new(NullSink),
        );
        let degradation = Arc::new(DegradationManager::new(true));
        // Drive to emergency, which restricts auto_recovery.
        let mut map = std::collections::HashMap::new();
        map.insert(
            "openai:gpt-4o".to_string(),
            crate::health::HealthRecord {
                health_score: 0.0,
                success_rate: 0.0,
                avg_latency: Duration::from_secs(10),
                ..Default::default()
            },
        );
        degradation.assess(&map, &[]);

        let probe = Arc::new(ScriptedProbe::healthy());
        let automation = RecoveryAutomation::new(
            breakers.clone(),
            health,
            probe.clone(),
            degradation,
            Duration::from_secs(60),
            Arc::new(clock.clone()),
        );

        let breaker = breakers.get_or_create("openai:gpt-4o");
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(EnsembleError::model_failure(
                    ProviderId::OpenAi,
                    "gpt-4o",
                    ErrorCategory::ServerError,
                    "x",
                ))
            })
            .await;
        clock.advance(200);

        automation.run_once().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
