//! HTTP API handlers — exposes pipeline state as JSON.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, Json};
use serde::Serialize;

use hubstat_core::TransportPosition;
use hubstat_services::{
    commit_positions, resumption_snapshot, ConflationManager, MessageAssembler,
    ResumptionMetadata, StatsSnapshot, SyncMode,
};

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<ConflationManager>,
    pub assembler: Arc<MessageAssembler>,
    pub started: Instant,
}

impl ApiState {
    pub fn new(manager: Arc<ConflationManager>, assembler: Arc<MessageAssembler>) -> Self {
        Self {
            manager,
            assembler,
            started: Instant::now(),
        }
    }
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub sources: usize,
    pub ready_queue: usize,
    pub open_assemblies: usize,
    pub stats: StatsSnapshot,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        sources: state.manager.unit_count(),
        ready_queue: state.manager.queue().len(),
        open_assemblies: state.assembler.in_progress(),
        stats: state.manager.stats().snapshot(),
    })
}

// ── /metadata ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct MetadataResponse {
    pub entries: Vec<ResumptionMetadata>,
    /// Positions the committer would commit right now.
    pub commit: Vec<TransportPosition>,
}

pub async fn handle_metadata(State(state): State<ApiState>) -> Json<MetadataResponse> {
    let (mut entries, open) = resumption_snapshot(&state.manager, &state.assembler);
    entries.sort_by(|a, b| {
        (&a.source, &a.bundle_type, &a.position).cmp(&(&b.source, &b.bundle_type, &b.position))
    });
    let commit = commit_positions(&entries, &open);
    Json(MetadataResponse { entries, commit })
}

// ── /registrations ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RegistrationInfo {
    pub bundle_type: String,
    pub priority: u32,
    pub depends_on: Option<String>,
    pub sync_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
}

pub async fn handle_registrations(State(state): State<ApiState>) -> Json<Vec<RegistrationInfo>> {
    let registry = state.manager.registry();
    let mut infos: Vec<RegistrationInfo> = registry
        .bundle_types()
        .filter_map(|t| registry.get(t))
        .map(|r| {
            let (sync_mode, key_field) = match &r.sync_mode {
                SyncMode::Complete => ("complete", None),
                SyncMode::Delta { key_field } => ("delta", key_field.clone()),
            };
            RegistrationInfo {
                bundle_type: r.bundle_type.clone(),
                priority: r.priority,
                depends_on: r.depends_on.clone(),
                sync_mode,
                key_field,
            }
        })
        .collect();
    infos.sort_by(|a, b| (a.priority, &a.bundle_type).cmp(&(b.priority, &b.bundle_type)));
    Json(infos)
}
