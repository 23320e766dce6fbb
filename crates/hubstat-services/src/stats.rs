//! Pipeline counters — shared across receiver, units, and workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    fragments_received: AtomicU64,
    fragments_dropped: AtomicU64,
    messages_assembled: AtomicU64,
    assemblies_failed: AtomicU64,
    assemblies_expired: AtomicU64,
    envelopes_inserted: AtomicU64,
    envelopes_conflated: AtomicU64,
    envelopes_stale: AtomicU64,
    envelopes_malformed: AtomicU64,
    unknown_type: AtomicU64,
    bundles_processed: AtomicU64,
    handler_failures: AtomicU64,
    bundles_dropped: AtomicU64,
}

/// Cheaply cloneable handle to the pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    inner: Arc<Counters>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fragments_received: u64,
    pub fragments_dropped: u64,
    pub messages_assembled: u64,
    pub assemblies_failed: u64,
    pub assemblies_expired: u64,
    pub envelopes_inserted: u64,
    pub envelopes_conflated: u64,
    pub envelopes_stale: u64,
    pub envelopes_malformed: u64,
    pub unknown_type: u64,
    pub bundles_processed: u64,
    pub handler_failures: u64,
    /// Bundles released after exhausting retries. Each one is lost data.
    pub bundles_dropped: u64,
}

macro_rules! counter {
    ($name:ident) => {
        pub fn $name(&self) {
            self.inner.$name.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(fragments_received);
    counter!(fragments_dropped);
    counter!(messages_assembled);
    counter!(assemblies_failed);
    counter!(envelopes_inserted);
    counter!(envelopes_conflated);
    counter!(envelopes_stale);
    counter!(envelopes_malformed);
    counter!(unknown_type);
    counter!(bundles_processed);
    counter!(handler_failures);
    counter!(bundles_dropped);

    pub fn assemblies_expired(&self, n: usize) {
        self.inner
            .assemblies_expired
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.inner;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        StatsSnapshot {
            fragments_received: load(&c.fragments_received),
            fragments_dropped: load(&c.fragments_dropped),
            messages_assembled: load(&c.messages_assembled),
            assemblies_failed: load(&c.assemblies_failed),
            assemblies_expired: load(&c.assemblies_expired),
            envelopes_inserted: load(&c.envelopes_inserted),
            envelopes_conflated: load(&c.envelopes_conflated),
            envelopes_stale: load(&c.envelopes_stale),
            envelopes_malformed: load(&c.envelopes_malformed),
            unknown_type: load(&c.unknown_type),
            bundles_processed: load(&c.bundles_processed),
            handler_failures: load(&c.handler_failures),
            bundles_dropped: load(&c.bundles_dropped),
        }
    }

    /// Emit one structured log line with the current counters.
    pub fn log(&self) {
        let s = self.snapshot();
        tracing::info!(
            fragments = s.fragments_received,
            assembled = s.messages_assembled,
            inserted = s.envelopes_inserted,
            conflated = s.envelopes_conflated,
            stale = s.envelopes_stale,
            unknown_type = s.unknown_type,
            processed = s.bundles_processed,
            failures = s.handler_failures,
            dropped = s.bundles_dropped,
            "pipeline stats"
        );
    }
}
