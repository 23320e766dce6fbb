//! Offset commit — turns resumption metadata into transport positions.
//!
//! For every (topic, partition) the committed offset is the lowest offset
//! whose content has not been processed yet (buffered, in flight, or still
//! being reassembled). With nothing outstanding it is one past the highest
//! processed offset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use hubstat_core::TransportPosition;

use crate::assembler::MessageAssembler;
use crate::manager::ConflationManager;
use crate::sink::write_atomic;
use crate::transport::Transport;
use crate::unit::ResumptionMetadata;

#[derive(Default)]
struct PartitionMark {
    lowest_outstanding: Option<u64>,
    highest_processed: Option<u64>,
}

impl PartitionMark {
    fn outstanding(&mut self, offset: u64) {
        self.lowest_outstanding = Some(self.lowest_outstanding.map_or(offset, |o| o.min(offset)));
    }
}

pub fn commit_positions(
    metadatas: &[ResumptionMetadata],
    open_assemblies: &[TransportPosition],
) -> Vec<TransportPosition> {
    let mut marks: BTreeMap<(&str, u32), PartitionMark> = BTreeMap::new();

    for meta in metadatas {
        let mark = marks
            .entry((meta.position.topic.as_str(), meta.position.partition))
            .or_default();
        if meta.processed {
            mark.highest_processed = mark.highest_processed.max(Some(meta.position.offset));
        } else {
            mark.outstanding(meta.position.offset);
        }
    }
    for position in open_assemblies {
        marks
            .entry((position.topic.as_str(), position.partition))
            .or_default()
            .outstanding(position.offset);
    }

    marks
        .into_iter()
        .filter_map(|((topic, partition), mark)| {
            let offset = match (mark.lowest_outstanding, mark.highest_processed) {
                (Some(low), _) => low,
                (None, Some(high)) => high + 1,
                (None, None) => return None,
            };
            Some(TransportPosition::new(topic, partition, offset))
        })
        .collect()
}

/// Resumption metadata and open assembly positions read as one snapshot.
///
/// A message completing between two unguarded reads would be in neither,
/// letting the commit skip it.
pub fn resumption_snapshot(
    manager: &ConflationManager,
    assembler: &MessageAssembler,
) -> (Vec<ResumptionMetadata>, Vec<TransportPosition>) {
    let _handoff = assembler.hand_off();
    (manager.metadatas(), assembler.open_positions())
}

/// Committed offsets per (topic, partition), persisted as JSON. Offsets
/// only move forward.
#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    offsets: Mutex<BTreeMap<(String, u32), u64>>,
}

impl OffsetStore {
    /// Open a store persisted at `path`, loading what a previous run left.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut offsets = BTreeMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let stored: Vec<TransportPosition> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse offsets: {}", path.display()))?;
                for p in stored {
                    offsets.insert((p.topic, p.partition), p.offset);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read offsets: {}", path.display()))
            }
        }
        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    pub fn get(&self, topic: &str, partition: u32) -> Option<u64> {
        self.offsets.lock().get(&(topic.to_string(), partition)).copied()
    }

    pub fn positions(&self) -> Vec<TransportPosition> {
        self.offsets
            .lock()
            .iter()
            .map(|((topic, partition), offset)| TransportPosition::new(topic.clone(), *partition, *offset))
            .collect()
    }

    /// Apply `positions`, ignoring any that would move an offset backwards.
    /// Persists when something moved. Returns the number of offsets advanced.
    pub fn advance(&self, positions: &[TransportPosition]) -> anyhow::Result<usize> {
        let advanced = {
            let mut offsets = self.offsets.lock();
            let mut advanced = 0;
            for p in positions {
                let current = offsets.entry((p.topic.clone(), p.partition)).or_insert(0);
                if p.offset > *current {
                    *current = p.offset;
                    advanced += 1;
                }
            }
            advanced
        };
        if advanced > 0 {
            self.persist()?;
        }
        Ok(advanced)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(&self.positions()).context("failed to encode offsets")?;
        write_atomic(&self.path, &body)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Periodically commits positions derived from the manager and assembler.
pub struct Committer {
    manager: Arc<ConflationManager>,
    assembler: Arc<MessageAssembler>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
    last: Vec<TransportPosition>,
}

impl Committer {
    pub fn new(
        manager: Arc<ConflationManager>,
        assembler: Arc<MessageAssembler>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            manager,
            assembler,
            transport,
            interval,
            shutdown,
            last: Vec::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    self.commit_once().await;
                    tracing::info!("committer shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    self.commit_once().await;
                }
            }
        }
    }

    /// Commit the current positions if they changed since the last commit.
    pub async fn commit_once(&mut self) {
        let (metadatas, open) = resumption_snapshot(&self.manager, &self.assembler);
        let positions = commit_positions(&metadatas, &open);
        if positions.is_empty() || positions == self.last {
            return;
        }
        match self.transport.commit(&positions).await {
            Ok(()) => {
                tracing::debug!(partitions = positions.len(), "offsets committed");
                self.last = positions;
            }
            Err(e) => tracing::warn!(error = %e, "offset commit failed"),
        }
    }
}
