//! Conflation unit — per-source slot state machine.
//!
//! Each registered bundle type owns one slot per source:
//!
//! ```text
//! Idle ──insert──▶ Pending ──deps ok──▶ Ready ──claim──▶ Processing
//!   ▲                 ▲                                     │
//!   └─────────────────┴──────────── completion ─────────────┘
//! ```
//!
//! A slot buffers at most one bundle behind at most one in-flight bundle.
//! Newer inserts coalesce into the buffered bundle according to the
//! registration's [`SyncMode`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use hubstat_core::{BundleEnvelope, BundleVersion, TransportPosition};

use crate::manager::InsertOutcome;
use crate::ready_queue::{ReadyQueue, Ticket};
use crate::registration::{BundleMetadata, Registration, Registry};

#[derive(Debug)]
struct Pending {
    envelope: BundleEnvelope,
    /// Earliest position of the buffered content.
    position: TransportPosition,
    /// Highest offset of the buffered content on the same partition.
    last_offset: u64,
    /// Failed attempts already spent on (part of) this content.
    attempts: u32,
}

#[derive(Debug)]
struct InFlight {
    envelope: Arc<BundleEnvelope>,
    position: TransportPosition,
    last_offset: u64,
    attempt: u32,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Pending>,
    in_flight: Option<InFlight>,
    /// A ticket for this slot sits in the ready queue.
    queued: bool,
    /// Waiting out a retry delay; only `end_backoff` clears it.
    backoff: bool,
    last_processed: Option<BundleVersion>,
    /// Last offset of the last bundle that left the slot, processed or
    /// dropped.
    settled: Option<(TransportPosition, BundleVersion)>,
}

impl Slot {
    fn newest_version(&self) -> Option<BundleVersion> {
        let pending = self.pending.as_ref().map(|p| p.envelope.version);
        let in_flight = self.in_flight.as_ref().map(|f| f.envelope.version);
        pending.max(in_flight).max(self.last_processed)
    }
}

/// A bundle handed to a worker. The slot stays in Processing until the
/// worker reports back through [`ConflationUnit::on_completion`].
#[derive(Debug, Clone)]
pub struct ClaimedBundle {
    pub envelope: Arc<BundleEnvelope>,
    pub metadata: BundleMetadata,
    /// The registration the bundle was claimed under, handler included.
    pub registration: Arc<Registration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { max_attempts: u32 },
}

/// What the unit did with a finished bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Processed,
    /// Put back behind a retry delay; the caller schedules `end_backoff`.
    Retry { attempt: u32 },
    /// A newer complete snapshot replaced the failed one.
    Superseded,
    /// Out of attempts. The content is lost.
    Dropped { version: BundleVersion, attempts: u32 },
    /// Nothing was in flight for that type.
    NotInFlight,
}

/// Result of a unit-level insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    pub outcome: InsertOutcome,
    /// The bundle was merged into an already-buffered one.
    pub conflated: bool,
}

/// Resumption bookkeeping for one slot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumptionMetadata {
    pub source: String,
    pub bundle_type: String,
    pub position: TransportPosition,
    pub version: BundleVersion,
    /// False while the content at `position` is buffered or in flight.
    /// Processed entries carry the last offset of the settled content;
    /// outstanding entries carry the first.
    pub processed: bool,
}

pub struct ConflationUnit {
    source: String,
    queue: Arc<ReadyQueue>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConflationUnit {
    pub fn new(source: impl Into<String>, queue: Arc<ReadyQueue>) -> Self {
        Self {
            source: source.into(),
            queue,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn insert(
        &self,
        registry: &Registry,
        registration: &Registration,
        envelope: BundleEnvelope,
        position: TransportPosition,
        last_offset: u64,
    ) -> Insertion {
        let bundle_type = registration.bundle_type.as_str();
        let mut slots = self.slots.lock();
        let slot = slots.entry(bundle_type.to_string()).or_default();

        if let Some(newest) = slot.newest_version() {
            if !envelope.version.newer_than(&newest) {
                tracing::debug!(
                    source = %self.source,
                    bundle_type,
                    version = %envelope.version,
                    newest = %newest,
                    "stale bundle discarded"
                );
                return Insertion {
                    outcome: InsertOutcome::Stale,
                    conflated: false,
                };
            }
        }

        let previous = slot.pending.take();
        let conflated = previous.is_some();
        let pending = match previous {
            None => Pending {
                envelope,
                position,
                last_offset,
                attempts: 0,
            },
            Some(prev) => {
                let delta = registration.sync_mode.is_delta();
                Pending {
                    position: if delta {
                        prev.position.min(position)
                    } else {
                        position
                    },
                    last_offset: prev.last_offset.max(last_offset),
                    attempts: if delta { prev.attempts } else { 0 },
                    envelope: registration
                        .sync_mode
                        .merge(Some(prev.envelope), envelope),
                }
            }
        };
        slot.pending = Some(pending);

        let outcome = if slot.queued || self.try_ready(&mut slots, registry, bundle_type) {
            InsertOutcome::Ready
        } else {
            InsertOutcome::Buffered
        };
        Insertion { outcome, conflated }
    }

    /// Move the buffered bundle of `bundle_type` into Processing.
    ///
    /// Returns None when the ticket went stale: nothing is buffered, the
    /// type is already in flight, or a newer buffered bundle needs a
    /// dependency version that has not been processed yet.
    pub fn claim(&self, registry: &Registry, bundle_type: &str) -> Option<ClaimedBundle> {
        let registration = registry.get(bundle_type)?;
        let mut slots = self.slots.lock();
        let satisfied = match slots.get(bundle_type)?.pending.as_ref() {
            Some(p) => dependency_satisfied(&slots, registration, &p.envelope),
            None => false,
        };
        let slot = slots.get_mut(bundle_type)?;
        slot.queued = false;
        if slot.in_flight.is_some() || slot.backoff || !satisfied {
            return None;
        }
        let pending = slot.pending.take()?;
        let envelope = Arc::new(pending.envelope);
        let attempt = pending.attempts + 1;
        slot.in_flight = Some(InFlight {
            envelope: envelope.clone(),
            position: pending.position.clone(),
            last_offset: pending.last_offset,
            attempt,
        });
        Some(ClaimedBundle {
            metadata: BundleMetadata {
                position: pending.position,
                version: envelope.version,
                dependency_version: envelope.dependency_version,
                attempt,
            },
            envelope,
            registration: registration.clone(),
        })
    }

    pub fn on_completion(
        &self,
        registry: &Registry,
        bundle_type: &str,
        outcome: Outcome,
    ) -> Completion {
        let Some(registration) = registry.get(bundle_type) else {
            return Completion::NotInFlight;
        };
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(bundle_type) else {
            return Completion::NotInFlight;
        };
        let Some(done) = slot.in_flight.take() else {
            return Completion::NotInFlight;
        };
        let version = done.envelope.version;
        let end = TransportPosition {
            offset: done.last_offset,
            ..done.position.clone()
        };

        let completion = match outcome {
            Outcome::Succeeded => {
                slot.last_processed = slot.last_processed.max(Some(version));
                slot.settled = Some((end, version));
                Completion::Processed
            }
            Outcome::Failed { max_attempts } if done.attempt >= max_attempts => {
                slot.settled = Some((end, version));
                Completion::Dropped {
                    version,
                    attempts: done.attempt,
                }
            }
            Outcome::Failed { .. } => {
                let failed = Arc::try_unwrap(done.envelope).unwrap_or_else(|e| (*e).clone());
                match (slot.pending.take(), registration.sync_mode.is_delta()) {
                    (Some(newer), false) => {
                        slot.pending = Some(newer);
                        Completion::Superseded
                    }
                    (Some(newer), true) => {
                        slot.pending = Some(Pending {
                            position: done.position.min(newer.position),
                            last_offset: done.last_offset.max(newer.last_offset),
                            attempts: done.attempt.max(newer.attempts),
                            envelope: registration
                                .sync_mode
                                .merge(Some(failed), newer.envelope),
                        });
                        slot.backoff = true;
                        Completion::Retry {
                            attempt: done.attempt,
                        }
                    }
                    (None, _) => {
                        slot.pending = Some(Pending {
                            envelope: failed,
                            position: done.position,
                            last_offset: done.last_offset,
                            attempts: done.attempt,
                        });
                        slot.backoff = true;
                        Completion::Retry {
                            attempt: done.attempt,
                        }
                    }
                }
            }
        };

        self.try_ready(&mut slots, registry, bundle_type);
        if completion == Completion::Processed {
            for dependent in registry.dependents(bundle_type) {
                self.try_ready(&mut slots, registry, dependent);
            }
        }
        completion
    }

    /// Lift the retry delay on `bundle_type` and re-evaluate it.
    pub fn end_backoff(&self, registry: &Registry, bundle_type: &str) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(bundle_type) {
            Some(slot) => slot.backoff = false,
            None => return false,
        }
        self.try_ready(&mut slots, registry, bundle_type)
    }

    pub fn last_processed(&self, bundle_type: &str) -> Option<BundleVersion> {
        self.slots.lock().get(bundle_type)?.last_processed
    }

    pub fn is_processing(&self, bundle_type: &str) -> bool {
        self.slots
            .lock()
            .get(bundle_type)
            .is_some_and(|s| s.in_flight.is_some())
    }

    pub fn metadatas(&self) -> Vec<ResumptionMetadata> {
        let slots = self.slots.lock();
        let mut out = Vec::new();
        for (bundle_type, slot) in slots.iter() {
            let mut entry = |position: &TransportPosition, version, processed| {
                out.push(ResumptionMetadata {
                    source: self.source.clone(),
                    bundle_type: bundle_type.clone(),
                    position: position.clone(),
                    version,
                    processed,
                })
            };
            if let Some((position, version)) = &slot.settled {
                entry(position, *version, true);
            }
            if let Some(f) = &slot.in_flight {
                entry(&f.position, f.envelope.version, false);
            }
            if let Some(p) = &slot.pending {
                entry(&p.position, p.envelope.version, false);
            }
        }
        out
    }

    /// Queue `bundle_type` if it can run now. Caller holds the slot lock.
    fn try_ready(
        &self,
        slots: &mut HashMap<String, Slot>,
        registry: &Registry,
        bundle_type: &str,
    ) -> bool {
        let Some(registration) = registry.get(bundle_type) else {
            return false;
        };
        let Some(slot) = slots.get(bundle_type) else {
            return false;
        };
        let Some(pending) = slot.pending.as_ref() else {
            return false;
        };
        if slot.in_flight.is_some() || slot.queued || slot.backoff {
            return false;
        }
        if !dependency_satisfied(slots, registration, &pending.envelope) {
            tracing::debug!(
                source = %self.source,
                bundle_type,
                depends_on = ?registration.depends_on,
                "waiting on dependency"
            );
            return false;
        }
        if let Some(slot) = slots.get_mut(bundle_type) {
            slot.queued = true;
        }
        self.queue.push(Ticket {
            source: self.source.clone(),
            bundle_type: bundle_type.to_string(),
            priority: registration.priority,
        });
        true
    }
}

impl std::fmt::Debug for ConflationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflationUnit")
            .field("source", &self.source)
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

/// The dependency's processed version must reach the bundle's
/// `dependencyversion`, or its own version when that is absent.
fn dependency_satisfied(
    slots: &HashMap<String, Slot>,
    registration: &Registration,
    envelope: &BundleEnvelope,
) -> bool {
    let Some(dependency) = &registration.depends_on else {
        return true;
    };
    let required = envelope.dependency_version.unwrap_or(envelope.version);
    slots
        .get(dependency)
        .and_then(|s| s.last_processed)
        .is_some_and(|processed| processed >= required)
}
