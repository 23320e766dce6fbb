//! File sink — persists the latest processed bundle per source and type.
//!
//! Layout: `<root>/<source>/<bundle type>.json`. Each write replaces the
//! previous file atomically, so a replayed bundle simply overwrites
//! itself.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use hubstat_core::{BundleEnvelope, BundleVersion, TransportPosition};

use crate::registration::{BundleHandler, BundleMetadata};

/// Write `data` to `path` via a temp file and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(data).context("failed to write data")?;
        file.sync_all().context("failed to sync to disk")?;
    }

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}

#[derive(Serialize)]
struct Stored<'a> {
    version: BundleVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    dependency_version: Option<BundleVersion>,
    position: &'a TransportPosition,
    bundle: &'a BundleEnvelope,
}

#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, source: &str, bundle_type: &str) -> PathBuf {
        self.root
            .join(sanitize(source))
            .join(format!("{}.json", sanitize(bundle_type)))
    }
}

/// Keep path components to a safe character set.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

#[async_trait]
impl BundleHandler for FileSink {
    async fn handle(&self, bundle: &BundleEnvelope, metadata: &BundleMetadata) -> Result<()> {
        let path = self.path_for(&bundle.source, &bundle.bundle_type);
        let body = serde_json::to_vec_pretty(&Stored {
            version: metadata.version,
            dependency_version: metadata.dependency_version,
            position: &metadata.position,
            bundle,
        })
        .context("failed to encode bundle")?;

        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .context("sink task failed")??;

        tracing::trace!(
            source = %bundle.source,
            bundle_type = %bundle.bundle_type,
            version = %metadata.version,
            records = bundle.data.len(),
            "bundle stored"
        );
        Ok(())
    }
}
