//! Conflation registrations — the static per-bundle-type scheduling table.
//!
//! Every bundle type the aggregator accepts is registered once at startup
//! with a priority, an optional dependency on another bundle type, a sync
//! mode, and the handler that persists it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use hubstat_core::{BundleEnvelope, BundleVersion, TransportPosition};

/// What a handler gets besides the bundle itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMetadata {
    /// Earliest transport position whose content is part of this bundle.
    pub position: TransportPosition,
    pub version: BundleVersion,
    pub dependency_version: Option<BundleVersion>,
    /// 1 on the first try, incremented on every retry.
    pub attempt: u32,
}

/// The persistence side of the pipeline.
///
/// Called at most once per claimed ticket, never concurrently for the same
/// (source, bundle type). A crash between a call and its completion can
/// replay the same bundle after restart, so implementations must be
/// idempotent.
#[async_trait]
pub trait BundleHandler: Send + Sync {
    async fn handle(&self, bundle: &BundleEnvelope, metadata: &BundleMetadata)
        -> anyhow::Result<()>;
}

/// How buffered bundles of one type combine while waiting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Each bundle is a full snapshot; the newest replaces the buffered one.
    #[default]
    Complete,
    /// Each bundle is a change set; buffered changes are accumulated in
    /// version order. With `key_field`, a later record replaces an earlier
    /// one carrying the same value in that field.
    Delta { key_field: Option<String> },
}

impl SyncMode {
    /// Combine `incoming` on top of what is already buffered.
    pub(crate) fn merge(
        &self,
        buffered: Option<BundleEnvelope>,
        incoming: BundleEnvelope,
    ) -> BundleEnvelope {
        let Some(mut base) = buffered else {
            return incoming;
        };
        match self {
            SyncMode::Complete => incoming,
            SyncMode::Delta { key_field } => {
                if let Some(field) = key_field {
                    let replaced: Vec<&serde_json::Value> =
                        incoming.data.iter().filter_map(|r| r.get(field)).collect();
                    base.data.retain(|r| match r.get(field) {
                        Some(key) => !replaced.contains(&key),
                        None => true,
                    });
                }
                base.data.extend(incoming.data);
                BundleEnvelope {
                    data: base.data,
                    dependency_version: incoming.dependency_version.max(base.dependency_version),
                    ..incoming
                }
            }
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, SyncMode::Delta { .. })
    }
}

pub struct Registration {
    pub bundle_type: String,
    /// Lower is served first when several tickets are ready.
    pub priority: u32,
    pub depends_on: Option<String>,
    pub sync_mode: SyncMode,
    pub handler: Arc<dyn BundleHandler>,
}

impl Registration {
    pub fn new(bundle_type: impl Into<String>, priority: u32, handler: Arc<dyn BundleHandler>) -> Self {
        Self {
            bundle_type: bundle_type.into(),
            priority,
            depends_on: None,
            sync_mode: SyncMode::Complete,
            handler,
        }
    }

    pub fn depends_on(mut self, bundle_type: impl Into<String>) -> Self {
        self.depends_on = Some(bundle_type.into());
        self
    }

    pub fn delta(mut self, key_field: Option<&str>) -> Self {
        self.sync_mode = SyncMode::Delta {
            key_field: key_field.map(str::to_string),
        };
        self
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("bundle_type", &self.bundle_type)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .field("sync_mode", &self.sync_mode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("bundle type {0:?} is already registered")]
    Duplicate(String),
    #[error("bundle type {bundle_type:?} depends on unregistered {dependency:?}")]
    UnknownDependency {
        bundle_type: String,
        dependency: String,
    },
    #[error("bundle type {0:?} cannot depend on itself")]
    SelfDependency(String),
}

/// Registrations indexed by bundle type, plus the reverse dependency map.
#[derive(Default)]
pub struct Registry {
    by_type: HashMap<String, Arc<Registration>>,
    dependents: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dependencies must be registered before their dependents, which also
    /// rules out cycles.
    pub fn register(&mut self, registration: Registration) -> Result<(), RegistrationError> {
        let bundle_type = registration.bundle_type.clone();
        if self.by_type.contains_key(&bundle_type) {
            return Err(RegistrationError::Duplicate(bundle_type));
        }
        if let Some(dep) = &registration.depends_on {
            if *dep == bundle_type {
                return Err(RegistrationError::SelfDependency(bundle_type));
            }
            if !self.by_type.contains_key(dep) {
                return Err(RegistrationError::UnknownDependency {
                    bundle_type,
                    dependency: dep.clone(),
                });
            }
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(bundle_type.clone());
        }
        tracing::debug!(
            bundle_type,
            priority = registration.priority,
            depends_on = ?registration.depends_on,
            "bundle type registered"
        );
        self.by_type.insert(bundle_type, Arc::new(registration));
        Ok(())
    }

    pub fn get(&self, bundle_type: &str) -> Option<&Arc<Registration>> {
        self.by_type.get(bundle_type)
    }

    /// Types that declared a dependency on `bundle_type`.
    pub fn dependents(&self, bundle_type: &str) -> &[String] {
        self.dependents
            .get(bundle_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn bundle_types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }
}
