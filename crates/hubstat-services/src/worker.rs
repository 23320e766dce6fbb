//! Worker pool — a fixed set of tasks draining the ready queue.
//!
//! Each worker pops a ticket, claims the slot's buffered bundle, runs the
//! registration's handler, and reports back to the conflation unit. A
//! worker only listens for shutdown while idle; a handler that has started
//! is allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hubstat_core::config::ConflationConfig;

use crate::manager::ConflationManager;
use crate::ready_queue::Ticket;
use crate::unit::{Completion, Outcome};

/// Exponential backoff between handler attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per bundle, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempt + 1`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ConflationConfig::default())
    }
}

impl From<&ConflationConfig> for RetryPolicy {
    fn from(config: &ConflationConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        }
    }
}

pub struct WorkerPool {
    manager: Arc<ConflationManager>,
    retry: RetryPolicy,
    size: usize,
}

impl WorkerPool {
    pub fn new(manager: Arc<ConflationManager>, retry: RetryPolicy, size: usize) -> Self {
        Self {
            manager,
            retry,
            size: size.max(1),
        }
    }

    /// Start every worker. Await the handles after signalling shutdown to
    /// drain in-flight handlers.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!(workers = self.size, "starting worker pool");
        (0..self.size)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    self.manager.clone(),
                    self.retry,
                    shutdown.subscribe(),
                ))
            })
            .collect()
    }
}

async fn worker_loop(
    id: usize,
    manager: Arc<ConflationManager>,
    retry: RetryPolicy,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let ticket = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(worker = id, "worker shutting down");
                return;
            }
            ticket = manager.queue().pop() => ticket,
        };
        process(&manager, &retry, ticket).await;
    }
}

async fn process(manager: &Arc<ConflationManager>, retry: &RetryPolicy, ticket: Ticket) {
    let Some(claimed) = manager.claim(&ticket) else {
        tracing::trace!(
            source = %ticket.source,
            bundle_type = %ticket.bundle_type,
            "ticket no longer claimable"
        );
        return;
    };
    let version = claimed.metadata.version;
    let attempt = claimed.metadata.attempt;

    // Run on its own task so a panicking handler counts as a failure
    // instead of taking the worker down with the slot still claimed.
    let handler = claimed.registration.handler.clone();
    let result = tokio::spawn(async move {
        handler
            .handle(&claimed.envelope, &claimed.metadata)
            .await
    })
    .await
    .unwrap_or_else(|e| Err(anyhow::anyhow!("handler task failed: {e}")));

    let stats = manager.stats();
    let outcome = match &result {
        Ok(()) => Outcome::Succeeded,
        Err(e) => {
            stats.handler_failures();
            tracing::warn!(
                source = %ticket.source,
                bundle_type = %ticket.bundle_type,
                %version,
                attempt,
                error = %e,
                "handler failed"
            );
            Outcome::Failed {
                max_attempts: retry.max_attempts,
            }
        }
    };

    match manager.complete(&ticket.source, &ticket.bundle_type, outcome) {
        Completion::Processed => {
            stats.bundles_processed();
            tracing::debug!(
                source = %ticket.source,
                bundle_type = %ticket.bundle_type,
                %version,
                "bundle processed"
            );
        }
        Completion::Retry { attempt } => {
            let delay = retry.backoff(attempt);
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.end_backoff(&ticket.source, &ticket.bundle_type);
            });
        }
        Completion::Superseded => {
            tracing::debug!(
                source = %ticket.source,
                bundle_type = %ticket.bundle_type,
                %version,
                "failed bundle superseded by newer snapshot"
            );
        }
        Completion::Dropped { version, attempts } => {
            stats.bundles_dropped();
            tracing::error!(
                source = %ticket.source,
                bundle_type = %ticket.bundle_type,
                %version,
                attempts,
                "retries exhausted, bundle dropped"
            );
        }
        Completion::NotInFlight => {
            tracing::warn!(
                source = %ticket.source,
                bundle_type = %ticket.bundle_type,
                "completion for a bundle that was not in flight"
            );
        }
    }
}
