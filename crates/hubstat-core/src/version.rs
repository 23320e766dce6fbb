//! Bundle versions — the ordering stamp carried by every bundle.
//!
//! A version is a `(generation, value)` pair compared lexicographically.
//! `value` moves on every content change the producer detects; `generation`
//! catches up to `value` only after the bundle was handed to the transport.
//! A producer can therefore tell "changed but not yet sent" (`value >
//! generation`) apart from "sent" (`value == generation`).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BundleVersion {
    pub generation: u64,
    pub value: u64,
}

impl BundleVersion {
    pub const fn new(generation: u64, value: u64) -> Self {
        Self { generation, value }
    }

    /// Record a content change.
    pub fn incr(&mut self) {
        self.value += 1;
    }

    /// Record a successful send: the current value becomes the generation.
    pub fn next(&mut self) {
        self.generation = self.value;
    }

    /// True iff `self` is strictly greater in `(generation, value)` order.
    pub fn newer_than(&self, other: &BundleVersion) -> bool {
        self > other
    }

    /// True if content changed since the last `next()`.
    pub fn is_unsent(&self) -> bool {
        self.value > self.generation
    }
}

impl PartialOrd for BundleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BundleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.generation, self.value).cmp(&(other.generation, other.value))
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.generation, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("version {0:?} is not of the form <generation>.<value>")]
    Malformed(String),
    #[error("version {0:?} has a non-numeric component")]
    NotNumeric(String),
}

impl FromStr for BundleVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, value) = s
            .split_once('.')
            .ok_or_else(|| VersionError::Malformed(s.to_string()))?;
        let generation = generation
            .parse()
            .map_err(|_| VersionError::NotNumeric(s.to_string()))?;
        let value = value
            .parse()
            .map_err(|_| VersionError::NotNumeric(s.to_string()))?;
        Ok(Self { generation, value })
    }
}

// Versions travel as their string form in envelopes and metadata.
impl Serialize for BundleVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BundleVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Producer-side send bookkeeping for one (source, bundle-type) stream.
///
/// Tracks the live version alongside the last version the transport
/// accepted, so an emitter only sends when something actually changed.
#[derive(Debug, Clone, Default)]
pub struct SendState {
    current: BundleVersion,
    last_sent: Option<BundleVersion>,
}

impl SendState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> BundleVersion {
        self.current
    }

    pub fn last_sent(&self) -> Option<BundleVersion> {
        self.last_sent
    }

    pub fn mark_changed(&mut self) {
        self.current.incr();
    }

    /// The version that would go on the wire if sent now.
    pub fn pre_send(&self) -> BundleVersion {
        self.current
    }

    pub fn should_send(&self) -> bool {
        match self.last_sent {
            Some(sent) => self.current.newer_than(&sent),
            None => true,
        }
    }

    /// Call after the transport accepted the bundle.
    pub fn mark_sent(&mut self) {
        self.current.next();
        self.last_sent = Some(self.current);
    }
}
