//! Message assembler — turns transport fragments back into complete
//! `TransportMessage`s.
//!
//! One open record per (stream id, fragmentation timestamp), so messages of
//! the same stream whose fragments interleave all complete. Whether an
//! older one still matters is up to the conflation unit. Records that never
//! complete are evicted after a TTL and counted as expired.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};

use hubstat_core::wire::{self, ContentEncoding, Fragment};
use hubstat_core::{TransportMessage, TransportPosition, WireError};

use crate::dedup::DedupCache;
use crate::stats::PipelineStats;

/// A reassembled message and the span of transport offsets it used.
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    pub message: TransportMessage,
    /// Earliest fragment position.
    pub position: TransportPosition,
    /// Highest fragment offset on the same partition.
    pub last_offset: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("fragment declares total {declared} but the open record expects {expected}")]
    SizeConflict { declared: u32, expected: u32 },
    #[error("fragment at offset {offset} with {len} bytes overruns total {total}")]
    Overflow { offset: u32, len: usize, total: u32 },
    #[error("reassembled bytes have a gap at offset {0}")]
    Gap(usize),
    #[error("message already assembled")]
    AlreadyAssembled,
    #[error("stream id does not match the reassembled message key {0:?}")]
    StreamMismatch(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl AssemblyError {
    /// Repeated fragments are expected on an at-least-once transport and
    /// are not worth a warning.
    pub fn is_benign(&self) -> bool {
        matches!(self, AssemblyError::AlreadyAssembled)
    }
}

struct Assembly {
    total_size: u32,
    encoding: ContentEncoding,
    fragments: BTreeMap<u32, Bytes>,
    received: usize,
    position: TransportPosition,
    last_offset: u64,
    started_at: Instant,
}

/// (stream id, fragmentation timestamp).
type AssemblyKey = ([u8; 32], u64);

pub struct MessageAssembler {
    active: Mutex<HashMap<AssemblyKey, Assembly>>,
    completed: Mutex<DedupCache<AssemblyKey>>,
    /// Held from a message leaving `active` until it sits in the
    /// conflation manager, and by offset snapshots reading both.
    handoff: Mutex<()>,
    ttl: Duration,
    stats: PipelineStats,
}

impl MessageAssembler {
    pub fn new(ttl: Duration, dedup_capacity: usize, stats: PipelineStats) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(DedupCache::new(dedup_capacity)),
            handoff: Mutex::new(()),
            ttl,
            stats,
        }
    }

    /// Serialize message hand-off against readers of both the open records
    /// and the conflation state. Never held across an await.
    pub fn hand_off(&self) -> MutexGuard<'_, ()> {
        self.handoff.lock()
    }

    /// Feed one fragment. Returns the message once its last fragment
    /// arrives, `None` while fragments are still missing.
    pub fn add(
        &self,
        fragment: Fragment,
        position: TransportPosition,
    ) -> Result<Option<AssembledMessage>, AssemblyError> {
        let header = fragment.header;
        let key = (header.stream_id, header.fragmentation_timestamp());
        let total = header.total_size();
        let offset = header.offset();
        let encoding = header.content_encoding()?;

        if self.completed.lock().contains(&key) {
            return Err(AssemblyError::AlreadyAssembled);
        }
        if offset as usize + fragment.payload.len() > total as usize {
            return Err(AssemblyError::Overflow {
                offset,
                len: fragment.payload.len(),
                total,
            });
        }

        // Unfragmented message: skip the bookkeeping.
        if offset == 0 && fragment.payload.len() == total as usize {
            self.active.lock().remove(&key);
            return self
                .finish(key, encoding, fragment.payload, position)
                .map(Some);
        }

        let mut active = self.active.lock();
        self.evict_expired_locked(&mut active, Instant::now());

        if let Some(open) = active.get(&key) {
            if open.total_size != total {
                let expected = open.total_size;
                active.remove(&key);
                return Err(AssemblyError::SizeConflict {
                    declared: total,
                    expected,
                });
            }
        }
        let assembly = active.entry(key).or_insert_with(|| Assembly {
            total_size: total,
            encoding,
            fragments: BTreeMap::new(),
            received: 0,
            last_offset: position.offset,
            position: position.clone(),
            started_at: Instant::now(),
        });

        assembly.last_offset = assembly.last_offset.max(position.offset);
        if position < assembly.position {
            assembly.position = position;
        }
        if assembly.fragments.contains_key(&offset) {
            tracing::trace!(offset, "duplicate fragment ignored");
            return Ok(None);
        }
        assembly.received += fragment.payload.len();
        assembly.fragments.insert(offset, fragment.payload);

        if assembly.received < assembly.total_size as usize {
            return Ok(None);
        }

        let Some(assembly) = active.remove(&key) else {
            return Ok(None);
        };
        drop(active);

        let mut joined = BytesMut::with_capacity(assembly.total_size as usize);
        for (offset, bytes) in assembly.fragments {
            if offset as usize != joined.len() {
                return Err(AssemblyError::Gap(joined.len()));
            }
            joined.extend_from_slice(&bytes);
        }
        if joined.len() != assembly.total_size as usize {
            return Err(AssemblyError::Gap(joined.len()));
        }

        self.finish(key, assembly.encoding, joined.freeze(), assembly.position)
            .map(|mut assembled| {
                assembled.last_offset = assembly.last_offset;
                Some(assembled)
            })
    }

    fn finish(
        &self,
        key: AssemblyKey,
        encoding: ContentEncoding,
        encoded: Bytes,
        position: TransportPosition,
    ) -> Result<AssembledMessage, AssemblyError> {
        let decoded = encoding.decode(&encoded)?;
        let message = TransportMessage::from_json(&decoded)?;
        if wire::stream_id(&message.key) != key.0 {
            return Err(AssemblyError::StreamMismatch(message.key));
        }
        self.completed.lock().insert(key);
        Ok(AssembledMessage {
            message,
            last_offset: position.offset,
            position,
        })
    }

    /// Drop partial records older than the TTL. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let mut active = self.active.lock();
        self.evict_expired_locked(&mut active, Instant::now())
    }

    fn evict_expired_locked(
        &self,
        active: &mut HashMap<AssemblyKey, Assembly>,
        now: Instant,
    ) -> usize {
        let before = active.len();
        active.retain(|(stream_id, timestamp), assembly| {
            let expired = now.duration_since(assembly.started_at) > self.ttl;
            if expired {
                tracing::warn!(
                    stream = hex::encode(&stream_id[..8]),
                    timestamp,
                    received = assembly.received,
                    total = assembly.total_size,
                    "evicting abandoned partial assembly"
                );
            }
            !expired
        });
        let evicted = before - active.len();
        if evicted > 0 {
            self.stats.assemblies_expired(evicted);
        }
        evicted
    }

    /// Number of partial records currently open.
    pub fn in_progress(&self) -> usize {
        self.active.lock().len()
    }

    /// Earliest transport position held by each open record. The offset
    /// committer must not move past these.
    pub fn open_positions(&self) -> Vec<TransportPosition> {
        self.active
            .lock()
            .values()
            .map(|a| a.position.clone())
            .collect()
    }
}
