use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use taskgate_core::{
    clock::{add_duration, elapsed_between},
    config::CircuitBreakerSettings,
    Clock, DispatchError, DispatchResult,
};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - calls are blocked
    Open,
    /// Circuit is half-open - a single probe call decides whether to close again
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a probe is allowed
    pub reset_timeout: Duration,
    /// Growth of the reset timeout after a failed probe (1.0 = timeout simply restarts)
    pub backoff_multiplier: f64,
    /// Maximum reset timeout
    pub max_reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            max_reset_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            backoff_multiplier: settings.backoff_multiplier,
            max_reset_timeout: Duration::from_millis(settings.max_reset_timeout_ms),
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    current_reset_timeout: Duration,
    probe_in_flight: bool,
    probe_started_at: Option<DateTime<Utc>>,
    /// 每发放一次探测加一，用来区分过期探测和当前探测
    probe_generation: u64,
}

impl CircuitEntry {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            current_reset_timeout: config.reset_timeout,
            probe_in_flight: false,
            probe_started_at: None,
            probe_generation: 0,
        }
    }

    /// 探测超过一个 `reset_timeout` 仍未上报，视为已被放弃
    fn probe_is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.probe_started_at {
            Some(started) => now >= add_duration(started, self.current_reset_timeout),
            None => true,
        }
    }

    fn clear_probe(&mut self) {
        self.probe_in_flight = false;
        self.probe_started_at = None;
    }

    fn reopens_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
            .map(|at| add_duration(at, self.current_reset_timeout))
    }
}

/// Read-only view of one operation's circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub reset_timeout: Duration,
}

/// Per-operation circuit breaker
///
/// Each operation name has its own independent state; a failing operation never
/// opens the circuit of another. State for an operation is created lazily on its
/// first failure, so operations that only ever succeed leave no trace.
///
/// OPEN becomes HALF_OPEN lazily on the next call after `reset_timeout` has elapsed
/// since the last failure. Exactly one probe runs while HALF_OPEN; concurrent
/// callers are short-circuited until the probe reports. A probe whose caller is
/// dropped releases its slot on drop, and a probe that never reports is replaced
/// once a full `reset_timeout` has passed since it started.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitEntry>>>>,
}

/// What the pre-call check decided
enum Permit {
    Pass,
    Probe(ProbeGuard),
}

/// Holds the half-open probe slot; dropping it without a report frees the slot
struct ProbeGuard {
    entry: Arc<Mutex<CircuitEntry>>,
    generation: u64,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        // 锁被占用时交给过期判断兜底
        if let Ok(mut entry) = self.entry.try_lock() {
            if entry.probe_in_flight && entry.probe_generation == self.generation {
                debug!("half-open probe abandoned before reporting");
                entry.clear_probe();
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// Execute operation with circuit breaker protection
    ///
    /// No lock is held while `work` runs. The original error is always returned
    /// to the caller; an open circuit yields [`DispatchError::CircuitOpen`] without
    /// invoking `work`.
    pub async fn call<F, Fut, T>(&self, operation: &str, work: F) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let permit = self.acquire_permit(operation).await?;

        match work().await {
            Ok(value) => {
                self.record_success(operation, &permit).await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure(operation).await;
                Err(error)
            }
        }
    }

    /// Check if call should be allowed based on circuit state
    async fn acquire_permit(&self, operation: &str) -> DispatchResult<Permit> {
        let Some(handle) = self.existing(operation).await else {
            return Ok(Permit::Pass);
        };

        let now = self.clock.now();
        let mut entry = handle.lock().await;

        match entry.state {
            CircuitState::Closed => Ok(Permit::Pass),
            CircuitState::Open => {
                let reopens_at = entry.reopens_at().unwrap_or(now);
                if now >= reopens_at {
                    entry.state = CircuitState::HalfOpen;
                    info!("Circuit for {} half-open, probing", operation);
                    metrics::counter!("taskgate_circuit_transitions_total", "to" => "half_open")
                        .increment(1);
                    Ok(Self::grant_probe(&handle, &mut entry, now))
                } else {
                    Err(DispatchError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after: elapsed_between(now, reopens_at),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if !entry.probe_in_flight {
                    Ok(Self::grant_probe(&handle, &mut entry, now))
                } else if entry.probe_is_stale(now) {
                    warn!("Circuit for {} probe never reported, granting a new probe", operation);
                    Ok(Self::grant_probe(&handle, &mut entry, now))
                } else {
                    debug!("Circuit for {} is probing, rejecting concurrent call", operation);
                    let stale_at = entry
                        .probe_started_at
                        .map(|at| add_duration(at, entry.current_reset_timeout))
                        .unwrap_or(now);
                    Err(DispatchError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after: elapsed_between(now, stale_at),
                    })
                }
            }
        }
    }

    fn grant_probe(
        handle: &Arc<Mutex<CircuitEntry>>,
        entry: &mut CircuitEntry,
        now: DateTime<Utc>,
    ) -> Permit {
        entry.probe_generation = entry.probe_generation.wrapping_add(1);
        entry.probe_in_flight = true;
        entry.probe_started_at = Some(now);
        Permit::Probe(ProbeGuard {
            entry: Arc::clone(handle),
            generation: entry.probe_generation,
        })
    }

    /// Record successful call
    async fn record_success(&self, operation: &str, permit: &Permit) {
        let Some(entry) = self.existing(operation).await else {
            return;
        };
        let mut entry = entry.lock().await;

        let was_probe = matches!(permit, Permit::Probe(_)) || entry.state == CircuitState::HalfOpen;
        entry.failure_count = 0;
        entry.clear_probe();
        if was_probe && entry.state != CircuitState::Closed {
            entry.state = CircuitState::Closed;
            entry.current_reset_timeout = self.config.reset_timeout;
            info!("Circuit for {} closed after successful probe", operation);
            metrics::counter!("taskgate_circuit_transitions_total", "to" => "closed").increment(1);
        }
    }

    /// Record failed call
    async fn record_failure(&self, operation: &str) {
        let now = self.clock.now();
        let entry = self.entry(operation).await;
        let mut entry = entry.lock().await;

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_at = Some(now);
        entry.clear_probe();

        match entry.state {
            CircuitState::Closed if entry.failure_count >= self.config.failure_threshold => {
                entry.state = CircuitState::Open;
                entry.current_reset_timeout = self.config.reset_timeout;
                warn!(
                    "Circuit for {} opened after {} consecutive failures",
                    operation, entry.failure_count
                );
                metrics::counter!("taskgate_circuit_transitions_total", "to" => "open").increment(1);
            }
            CircuitState::HalfOpen => {
                // In half-open state, any failure immediately opens the circuit
                entry.state = CircuitState::Open;
                entry.current_reset_timeout = std::cmp::min(
                    entry
                        .current_reset_timeout
                        .mul_f64(self.config.backoff_multiplier),
                    self.config.max_reset_timeout,
                );
                warn!(
                    "Circuit for {} reopened after failed probe, next probe in {:?}",
                    operation, entry.current_reset_timeout
                );
                metrics::counter!("taskgate_circuit_transitions_total", "to" => "open").increment(1);
            }
            _ => {}
        }
    }

    /// Get current circuit state; operations never seen are closed
    pub async fn state(&self, operation: &str) -> CircuitState {
        match self.existing(operation).await {
            Some(entry) => entry.lock().await.state,
            None => CircuitState::Closed,
        }
    }

    /// Snapshot of every tracked operation
    pub async fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let entries: Vec<(String, Arc<Mutex<CircuitEntry>>)> = self
            .circuits
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut snapshots = Vec::with_capacity(entries.len());
        for (operation, entry) in entries {
            let entry = entry.lock().await;
            snapshots.push(CircuitSnapshot {
                operation,
                state: entry.state,
                failure_count: entry.failure_count,
                last_failure_at: entry.last_failure_at,
                reset_timeout: entry.current_reset_timeout,
            });
        }
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }

    /// Reset an operation's circuit to closed state
    pub async fn reset(&self, operation: &str) {
        self.circuits.write().await.remove(operation);
    }

    /// Force open circuit (for maintenance)
    pub async fn force_open(&self, operation: &str) {
        let now = self.clock.now();
        let entry = self.entry(operation).await;
        let mut entry = entry.lock().await;
        entry.state = CircuitState::Open;
        entry.last_failure_at = Some(now);
        entry.failure_count = entry.failure_count.max(self.config.failure_threshold);
        entry.clear_probe();
    }

    async fn existing(&self, operation: &str) -> Option<Arc<Mutex<CircuitEntry>>> {
        self.circuits.read().await.get(operation).cloned()
    }

    async fn entry(&self, operation: &str) -> Arc<Mutex<CircuitEntry>> {
        if let Some(entry) = self.existing(operation).await {
            return entry;
        }
        let mut circuits = self.circuits.write().await;
        Arc::clone(
            circuits
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitEntry::new(&self.config)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use taskgate_core::ManualClock;

    fn breaker(threshold: u32, reset_ms: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            ..Default::default()
        };
        (CircuitBreaker::new(config, clock.clone()), clock)
    }

    async fn fail(cb: &CircuitBreaker, op: &str) -> DispatchError {
        cb.call(op, || async { Err::<(), _>(DispatchError::execution("boom")) })
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_state() {
        let (cb, _clock) = breaker(3, 100);

        let result = cb.call("op", || async { Ok::<_, DispatchError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state("op").await, CircuitState::Closed);
        assert!(cb.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_circuit_breaker_open_state() {
        let (cb, _clock) = breaker(3, 100);

        for _ in 0..3 {
            let err = fail(&cb, "op").await;
            assert!(err.to_string().contains("boom"), "original error is re-raised");
        }
        assert_eq!(cb.state("op").await, CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let err = cb
            .call("op", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), DispatchError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_success_closes() {
        let (cb, clock) = breaker(3, 100);
        for _ in 0..3 {
            fail(&cb, "op").await;
        }

        clock.advance(Duration::from_millis(100));
        let result = cb.call("op", || async { Ok::<_, DispatchError>("probe") }).await;
        assert_eq!(result.unwrap(), "probe");
        assert_eq!(cb.state("op").await, CircuitState::Closed);

        // back to normal: failures count from zero again
        fail(&cb, "op").await;
        fail(&cb, "op").await;
        assert_eq!(cb.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_failure_reopens() {
        let (cb, clock) = breaker(3, 100);
        for _ in 0..3 {
            fail(&cb, "op").await;
        }

        clock.advance(Duration::from_millis(150));
        let err = fail(&cb, "op").await;
        assert!(!err.is_circuit_open(), "the probe was executed");
        assert_eq!(cb.state("op").await, CircuitState::Open);

        // the timeout restarts from the failed probe
        clock.advance(Duration::from_millis(50));
        assert!(fail(&cb, "op").await.is_circuit_open());
        clock.advance(Duration::from_millis(50));
        assert!(!fail(&cb, "op").await.is_circuit_open());
    }

    #[tokio::test]
    async fn test_operations_are_independent() {
        let (cb, _clock) = breaker(2, 100);
        fail(&cb, "A").await;
        fail(&cb, "A").await;
        assert_eq!(cb.state("A").await, CircuitState::Open);
        assert_eq!(cb.state("B").await, CircuitState::Closed);
        assert!(cb.call("B", || async { Ok::<_, DispatchError>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_single_probe_while_half_open() {
        let (cb, clock) = breaker(1, 100);
        fail(&cb, "op").await;
        clock.advance(Duration::from_millis(100));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = cb.call("op", || async move {
            let _ = rx.await;
            Ok::<_, DispatchError>(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let err = cb
                .call("op", || async { Ok::<_, DispatchError>(()) })
                .await
                .unwrap_err();
            let _ = tx.send(());
            err
        };
        let (probe_result, second_err) = tokio::join!(probe, second);
        assert!(probe_result.is_ok());
        assert!(second_err.is_circuit_open());
        assert_eq!(cb.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_probe_frees_the_slot() {
        let (cb, clock) = breaker(1, 100);
        fail(&cb, "op").await;
        clock.advance(Duration::from_millis(100));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call("op", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, DispatchError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state("op").await, CircuitState::HalfOpen);

        // no clock movement needed: the next caller becomes the probe
        let invoked = AtomicU32::new(0);
        let result = cb
            .call("op", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DispatchError>(())
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unreported_probe_goes_stale() {
        let (cb, clock) = breaker(1, 100);
        fail(&cb, "op").await;
        clock.advance(Duration::from_millis(100));

        // a probe that is polled once and then leaked never reports or drops
        let mut leaked = Box::pin(cb.call("op", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, DispatchError>(())
        }));
        assert!(futures::poll!(leaked.as_mut()).is_pending());
        std::mem::forget(leaked);

        let err = fail(&cb, "op").await;
        assert!(err.is_circuit_open());
        match err {
            DispatchError::CircuitOpen { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_millis(100))
            }
            other => panic!("unexpected error: {other}"),
        }

        clock.advance(Duration::from_millis(100));
        let result = cb.call("op", || async { Ok::<_, DispatchError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_timeout_backoff() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(100),
                backoff_multiplier: 2.0,
                max_reset_timeout: Duration::from_millis(400),
            },
            clock.clone(),
        );

        fail(&cb, "op").await;
        for expected in [200, 400, 400] {
            let current = cb.snapshot().await[0].reset_timeout;
            clock.advance(current);
            fail(&cb, "op").await;
            assert_eq!(
                cb.snapshot().await[0].reset_timeout,
                Duration::from_millis(expected)
            );
        }
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let (cb, _clock) = breaker(3, 100);
        cb.force_open("op").await;
        assert!(fail(&cb, "op").await.is_circuit_open());
        cb.reset("op").await;
        assert_eq!(cb.state("op").await, CircuitState::Closed);
    }
}
