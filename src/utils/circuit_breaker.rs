use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards calls to the broker so a dead broker fails publishes fast instead
// of every publish waiting out its own timeout.
//
// States:
// - Closed:   calls pass through, consecutive failures are counted
// - Open:     calls fail immediately until `open_duration` has elapsed
// - HalfOpen: calls pass through; enough successes close the circuit,
//             any failure opens it again
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
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
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    pub open_duration: Duration,
    /// Successes in half-open before closing
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit {0} is open")]
    Open(String),

    #[error("{0}")]
    Failed(E),
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match operation.await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(error) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Failed(error))
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut guard = self.state.lock().await;
        if guard.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = guard
            .opened_at
            .map(|at| at.elapsed() >= self.config.open_duration)
            .unwrap_or(true);
        if !elapsed {
            return Err(CircuitBreakerError::Open(self.name.clone()));
        }

        tracing::info!(circuit = %self.name, "Circuit half-open, probing");
        guard.state = CircuitState::HalfOpen;
        guard.success_count = 0;
        Ok(())
    }

    async fn on_success(&self) {
        let mut guard = self.state.lock().await;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "✅ Circuit closed");
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.success_count = 0;
                    guard.opened_at = None;
                }
            }
            _ => guard.failure_count = 0,
        }
    }

    async fn on_failure(&self) {
        let mut guard = self.state.lock().await;
        guard.failure_count += 1;

        let should_open = match guard.state {
            CircuitState::Closed => guard.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            tracing::warn!(
                circuit = %self.name,
                failures = guard.failure_count,
                "Circuit opened"
            );
            guard.state = CircuitState::Open;
            guard.success_count = 0;
            guard.opened_at = Some(Instant::now());
        }
    }
}
