use std::future::Future;
use tokio::task::{JoinError, JoinSet};

use super::OrderLifecycleOrchestrator;
use crate::context::{shutdown_channel, ShutdownTrigger};
use crate::messaging::MessagingError;

// ============================================================================
// Lifecycle Supervisor
// ============================================================================
//
// Owns the approval and rejection loops:
//   start      → spawn both loops with one shared shutdown signal
//   run_until  → wait for the stop future, trigger shutdown, join both
//
// A loop that ends with an error (its subscription could not be obtained)
// is logged and the other loop keeps running, unless fail_fast is set, in
// which case everything is stopped and the error is returned.
//
// ============================================================================

type LoopOutcome = (&'static str, Result<(), MessagingError>);

pub struct LifecycleSupervisor {
    trigger: ShutdownTrigger,
    tasks: JoinSet<LoopOutcome>,
    fail_fast: bool,
}

impl LifecycleSupervisor {
    pub fn start(orchestrator: OrderLifecycleOrchestrator) -> Self {
        let fail_fast = orchestrator.config().fail_fast_on_subscription_error;
        let (trigger, signal) = shutdown_channel();
        let mut tasks = JoinSet::new();

        let approvals = orchestrator.clone();
        let approval_signal = signal.clone();
        tasks.spawn(async move { ("approval", approvals.handle_order_approval(approval_signal).await) });

        let rejections = orchestrator;
        tasks.spawn(async move { ("rejection", rejections.handle_order_rejection(signal).await) });

        tracing::info!(fail_fast = fail_fast, "🚀 Order lifecycle loops started");

        Self {
            trigger,
            tasks,
            fail_fast,
        }
    }

    /// Run until `stop` resolves, then shut the loops down and join them
    pub async fn run_until<F>(mut self, stop: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                joined = self.tasks.join_next() => match joined {
                    Some(outcome) => self.on_loop_exit(outcome).await?,
                    // Every loop is gone; nothing left but waiting for stop
                    None => {
                        (&mut stop).await;
                        return Ok(());
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn on_loop_exit(&mut self, outcome: Result<LoopOutcome, JoinError>) -> anyhow::Result<()> {
        let error = match outcome {
            Ok((name, Ok(()))) => {
                tracing::info!(lifecycle_loop = name, "Lifecycle loop finished");
                return Ok(());
            }
            Ok((name, Err(e))) => {
                tracing::error!(lifecycle_loop = name, error = %e, "Lifecycle loop stopped");
                anyhow::Error::new(e).context(format!("{} loop could not run", name))
            }
            Err(e) => {
                tracing::error!(error = %e, "Lifecycle loop panicked");
                anyhow::Error::new(e).context("lifecycle loop panicked")
            }
        };

        if self.fail_fast {
            self.shutdown().await;
            return Err(error);
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!("Stopping order lifecycle loops");
        self.trigger.trigger();

        while let Some(outcome) = self.tasks.join_next().await {
            if let Ok((name, Err(e))) = &outcome {
                tracing::warn!(lifecycle_loop = name, error = %e, "Lifecycle loop ended with error");
            }
        }

        tracing::info!("✅ Order lifecycle loops stopped");
    }
}
