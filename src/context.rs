use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// Request Context - Correlation ID + Deadline
// ============================================================================
//
// Every operation receives an explicit RequestContext value instead of
// relying on task-local or global state:
//
//   Transport boundary → extract or mint correlation id once
//   Orchestrator       → scope repository calls to the deadline
//   Publisher          → detach() keeps the correlation id, drops the deadline
//
// ============================================================================

/// Attribute / metadata key carrying the correlation identifier
pub const CORRELATION_ID_KEY: &str = "correlation-id";

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    correlation_id: Option<String>,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no correlation id and no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        self.correlation_id = if correlation_id.is_empty() {
            None
        } else {
            Some(correlation_id)
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the context unchanged if it already carries a correlation id,
    /// otherwise attaches a freshly minted one.
    pub fn ensure_correlation_id(self) -> Self {
        if self.correlation_id.is_some() {
            return self;
        }
        let minted = mint_correlation_id();
        tracing::debug!(correlation_id = %minted, "Minted correlation id");
        self.with_correlation_id(minted)
    }

    /// Fresh context for work that must outlive the originating request:
    /// same correlation id, new deadline of its own.
    pub fn detached(&self, timeout: Duration) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            deadline: None,
        }
        .with_timeout(timeout)
    }

    /// Run `future` bounded by this context's deadline, if any.
    pub async fn scope<F, T>(&self, future: F) -> Result<T, DeadlineExceeded>
    where
        F: Future<Output = T>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, future)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(future.await),
        }
    }
}

pub fn mint_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Shutdown Signal - process-wide cancellation for long-running loops
// ============================================================================

/// Sending half, owned by whoever decides when the process stops
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

/// Receiving half, cloned into every long-running task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // No receivers left is fine: nothing to stop
        let _ = self.sender.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is triggered or the trigger is dropped.
    pub async fn triggered(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_correlation_id_keeps_existing() {
        let ctx = RequestContext::background()
            .with_correlation_id("abc-123")
            .ensure_correlation_id();
        assert_eq!(ctx.correlation_id(), Some("abc-123"));
    }

    #[test]
    fn test_ensure_correlation_id_mints_when_absent() {
        let ctx = RequestContext::background().ensure_correlation_id();
        let id = ctx.correlation_id().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_empty_correlation_id_is_treated_as_absent() {
        let ctx = RequestContext::background().with_correlation_id("");
        assert!(ctx.correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_detached_context_outlives_expired_parent() {
        let parent = RequestContext::background()
            .with_correlation_id("req-1")
            .with_timeout(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let expired = parent.scope(async { 1 }).await;
        assert_eq!(expired, Err(DeadlineExceeded));

        let detached = parent.detached(Duration::from_secs(5));
        assert_eq!(detached.correlation_id(), Some("req-1"));
        assert_eq!(detached.scope(async { 2 }).await, Ok(2));
    }

    #[tokio::test]
    async fn test_scope_times_out_slow_future() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(10));
        let result = ctx
            .scope(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves_after_trigger() {
        let (trigger, mut signal) = shutdown_channel();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move {
            signal.triggered().await;
        });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves_when_trigger_dropped() {
        let (trigger, mut signal) = shutdown_channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("dropped trigger counts as shutdown");
    }
}
