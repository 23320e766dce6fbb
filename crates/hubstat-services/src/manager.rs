//! Conflation manager — routes envelopes to per-source units.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use hubstat_core::{BundleEnvelope, TransportPosition};

use crate::ready_queue::{ReadyQueue, Ticket};
use crate::registration::{Registration, RegistrationError, Registry};
use crate::stats::PipelineStats;
use crate::unit::{ClaimedBundle, Completion, ConflationUnit, Outcome, ResumptionMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    /// Queued for a worker (now or already).
    Ready,
    /// Buffered behind an in-flight bundle, a dependency, or a retry delay.
    Buffered,
    /// Not newer than what the slot already has.
    Stale,
    UnknownType,
}

pub struct ConflationManager {
    registry: Registry,
    units: DashMap<String, Arc<ConflationUnit>>,
    queue: Arc<ReadyQueue>,
    stats: PipelineStats,
}

impl ConflationManager {
    pub fn new(stats: PipelineStats) -> Self {
        Self {
            registry: Registry::new(),
            units: DashMap::new(),
            queue: Arc::new(ReadyQueue::new()),
            stats,
        }
    }

    /// Registrations are fixed once the manager is shared.
    pub fn register(&mut self, registration: Registration) -> Result<(), RegistrationError> {
        self.registry.register(registration)
    }

    pub fn insert(&self, envelope: BundleEnvelope, position: TransportPosition) -> InsertOutcome {
        let last_offset = position.offset;
        self.insert_spanning(envelope, position, last_offset)
    }

    /// Insert a bundle whose fragments occupied `position.offset..=last_offset`.
    pub fn insert_spanning(
        &self,
        envelope: BundleEnvelope,
        position: TransportPosition,
        last_offset: u64,
    ) -> InsertOutcome {
        let Some(registration) = self.registry.get(&envelope.bundle_type) else {
            tracing::warn!(
                source = %envelope.source,
                bundle_type = %envelope.bundle_type,
                "unregistered bundle type, discarding"
            );
            self.stats.unknown_type();
            return InsertOutcome::UnknownType;
        };

        let unit = self.unit(&envelope.source);
        let version = envelope.version;
        let inserted = unit.insert(&self.registry, registration, envelope, position, last_offset);

        match inserted.outcome {
            InsertOutcome::Stale => self.stats.envelopes_stale(),
            _ => {
                self.stats.envelopes_inserted();
                if inserted.conflated {
                    self.stats.envelopes_conflated();
                }
            }
        }
        tracing::trace!(
            source = unit.source(),
            bundle_type = %registration.bundle_type,
            %version,
            outcome = ?inserted.outcome,
            "bundle inserted"
        );
        inserted.outcome
    }

    /// Look up or create the unit for `source`. Only the map shard is
    /// locked, and only for the lookup.
    fn unit(&self, source: &str) -> Arc<ConflationUnit> {
        if let Some(unit) = self.units.get(source) {
            return unit.clone();
        }
        self.units
            .entry(source.to_string())
            .or_insert_with(|| {
                tracing::info!(source, "new source");
                Arc::new(ConflationUnit::new(source, self.queue.clone()))
            })
            .clone()
    }

    pub fn claim(&self, ticket: &Ticket) -> Option<ClaimedBundle> {
        let unit = self.units.get(&ticket.source)?.clone();
        unit.claim(&self.registry, &ticket.bundle_type)
    }

    pub fn complete(&self, source: &str, bundle_type: &str, outcome: Outcome) -> Completion {
        let Some(unit) = self.units.get(source).map(|u| u.clone()) else {
            return Completion::NotInFlight;
        };
        unit.on_completion(&self.registry, bundle_type, outcome)
    }

    pub fn end_backoff(&self, source: &str, bundle_type: &str) -> bool {
        let Some(unit) = self.units.get(source).map(|u| u.clone()) else {
            return false;
        };
        unit.end_backoff(&self.registry, bundle_type)
    }

    /// Resumption metadata across every source, for the offset committer.
    pub fn metadatas(&self) -> Vec<ResumptionMetadata> {
        let units: Vec<Arc<ConflationUnit>> = self.units.iter().map(|u| u.value().clone()).collect();
        units.iter().flat_map(|u| u.metadatas()).collect()
    }

    pub fn registration(&self, bundle_type: &str) -> Option<&Arc<Registration>> {
        self.registry.get(bundle_type)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn queue(&self) -> &Arc<ReadyQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}
