//! Deployment state machine with an append-only history.
//!
//! Each deployment has a head record naming its latest history entry. An
//! append is one batch guarded on the head bytes the caller read, so two
//! racing status reports cannot both land on the same predecessor.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use registry_core::METRICS;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::access::{authorize_version, resolve_team, AccessContext, Action, Policy, Resource};
use crate::adapters::events::{EventBus, EventEnvelope};
use crate::error::{RegistryError, Result};
use crate::model::{canonical_version, version_key, ModelStatus};
use crate::store::{IndexEntry, KvStore, Scan, StoreError, WriteBatch};
use crate::versions::{self, VERSIONS_TABLE};

pub const HISTORY_TABLE: &str = "deployment_history";
pub const HEAD_TABLE: &str = "deployment_heads";

pub const EVENT_REQUESTED: &str = "DEPLOYMENT_REQUESTED";
pub const EVENT_CANCELLED: &str = "DEPLOYMENT_CANCELLED";

const UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus { Initiated, InProgress, Deploying, Deployed, Failed, RolledBack, Cancelled }

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 7] = [
        DeploymentStatus::Initiated,
        DeploymentStatus::InProgress,
        DeploymentStatus::Deploying,
        DeploymentStatus::Deployed,
        DeploymentStatus::Failed,
        DeploymentStatus::RolledBack,
        DeploymentStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Initiated => "INITIATED",
            DeploymentStatus::InProgress => "IN_PROGRESS",
            DeploymentStatus::Deploying => "DEPLOYING",
            DeploymentStatus::Deployed => "DEPLOYED",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::RolledBack => "ROLLED_BACK",
            DeploymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Deployed | DeploymentStatus::Failed | DeploymentStatus::RolledBack | DeploymentStatus::Cancelled)
    }

    /// INITIATED is only ever written by a trigger; terminal states accept nothing.
    /// Progress reports may repeat or skip straight to an outcome.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        !self.is_terminal() && next != DeploymentStatus::Initiated
    }

    /// Status the owning model version takes when this one is recorded.
    pub fn model_status(&self) -> ModelStatus {
        match self {
            DeploymentStatus::Deployed => ModelStatus::Deployed,
            DeploymentStatus::Failed | DeploymentStatus::Cancelled => ModelStatus::Failed,
            DeploymentStatus::RolledBack => ModelStatus::Registered,
            _ => ModelStatus::Deploying,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for DeploymentStatus {
    type Err = RegistryError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        DeploymentStatus::ALL.into_iter().find(|st| st.as_str() == wanted)
            .ok_or_else(|| RegistryError::validation("status", format!("unknown deployment status {s}")))
    }
}

/// One immutable event in a deployment's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentHistoryEntry {
    pub deployment_id: String,
    pub seq: u64,
    pub event_type: String,
    pub status: DeploymentStatus,
    pub model_id: String,
    pub version: String,
    pub target: String,
    pub team: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentHistoryEntry {
    fn key(&self) -> String { entry_key(&self.deployment_id, self.seq) }
}

// zero-padded so a prefix scan returns a deployment's entries in order
fn entry_key(deployment_id: &str, seq: u64) -> String { format!("{deployment_id}#{seq:08}") }

fn model_version_label(model_id: &str, version: &str) -> String { format!("{model_id}@{version}") }

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeploymentHead {
    seq: u64,
    status: DeploymentStatus,
    model_id: String,
    version: String,
    team: String,
    target: String,
}

/// `{modelId}-{version}-{millis}-{suffix}`
pub fn new_deployment_id(model_id: &str, version: &str) -> String {
    let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    format!("{model_id}-{version}-{}-{}", Utc::now().timestamp_millis(), suffix.to_ascii_lowercase())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Overrides the version's registered deployment target.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReceipt {
    pub deployment_id: String,
    pub status: DeploymentStatus,
}

/// Progress report from the deployment executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: DeploymentStatus,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// When set, the update only applies if this is still the current status.
    #[serde(default)]
    pub expected_status: Option<DeploymentStatus>,
}

impl StatusUpdate {
    pub fn new(status: DeploymentStatus) -> Self { Self { status, metadata: None, error: None, expected_status: None } }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub deployment_id: Option<String>,
    pub model_id: Option<String>,
    pub version: Option<String>,
    pub status: Option<DeploymentStatus>,
    pub team: Option<String>,
    pub target: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    fn matches(&self, e: &DeploymentHistoryEntry) -> bool {
        self.status.map_or(true, |s| e.status == s)
            && self.team.as_ref().map_or(true, |t| &e.team == t)
            && self.target.as_ref().map_or(true, |t| &e.target == t)
            && self.from.map_or(true, |from| e.timestamp >= from)
            && self.to.map_or(true, |to| e.timestamp <= to)
    }
}

pub struct DeploymentService {
    store: Arc<dyn KvStore>,
    bus: Arc<dyn EventBus>,
    subject: String,
}

impl DeploymentService {
    pub fn new(store: Arc<dyn KvStore>, bus: Arc<dyn EventBus>, subject: impl Into<String>) -> Self {
        Self { store, bus, subject: subject.into() }
    }

    /// Records intent and returns immediately; the executor reports back
    /// through [`DeploymentService::update_deployment_status`].
    pub async fn trigger_deployment(&self, ctx: &AccessContext, model_id: &str, version: &str, req: TriggerRequest) -> Result<DeploymentReceipt> {
        let res = self.trigger_inner(ctx, model_id, version, req).await;
        METRICS.record_op("trigger_deployment", res.is_ok());
        res
    }

    async fn trigger_inner(&self, ctx: &AccessContext, model_id: &str, version: &str, req: TriggerRequest) -> Result<DeploymentReceipt> {
        let (mut v, raw) = versions::load(self.store.as_ref(), model_id, version).await?
            .ok_or_else(|| RegistryError::NotFound(format!("model version {model_id}@{version}")))?;
        authorize_version(ctx, &v, Action::Deploy)?;

        let deployment_id = new_deployment_id(&v.model_id, &v.version);
        let target = req.target.unwrap_or_else(|| v.deployment_target.clone());
        let entry = DeploymentHistoryEntry {
            deployment_id: deployment_id.clone(),
            seq: 0,
            event_type: "DEPLOYMENT_INITIATED".into(),
            status: DeploymentStatus::Initiated,
            model_id: v.model_id.clone(),
            version: v.version.clone(),
            target: target.clone(),
            team: v.team.clone(),
            timestamp: Utc::now(),
            metadata: req.metadata.clone(),
            error: None,
        };
        v.status = ModelStatus::Deploying;
        v.updated_at = entry.timestamp;

        let batch = versions::rewrite(WriteBatch::new(), &raw, &v)?
            .require_absent(HEAD_TABLE, &deployment_id);
        let batch = self.append(batch, &entry)?;
        match self.store.commit(batch).await {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed(_)) => return Err(RegistryError::Conflict(format!("model version {}", v.label()))),
            Err(e) => return Err(e.into()),
        }
        METRICS.deployment_events_total.with_label_values(&[entry.status.as_str()]).inc();
        info!(%deployment_id, model_id=%v.model_id, version=%v.version, %target, "deployment_triggered");

        let event = EventEnvelope::new(EVENT_REQUESTED, json!({
            "deploymentId": deployment_id,
            "modelId": v.model_id,
            "version": v.version,
            "name": v.name,
            "framework": v.framework,
            "artifactUri": v.artifact_uri,
            "target": target,
            "team": v.team,
            "requestedBy": ctx.team,
            "metadata": req.metadata,
        }));
        self.publish(&event, &deployment_id).await;
        Ok(DeploymentReceipt { deployment_id, status: DeploymentStatus::Initiated })
    }

    /// Adds the entry and the matching head record to `batch`.
    fn append(&self, batch: WriteBatch, entry: &DeploymentHistoryEntry) -> Result<WriteBatch> {
        let head = DeploymentHead {
            seq: entry.seq,
            status: entry.status,
            model_id: entry.model_id.clone(),
            version: entry.version.clone(),
            team: entry.team.clone(),
            target: entry.target.clone(),
        };
        let indexes = vec![
            IndexEntry::new("model_version", model_version_label(&entry.model_id, &entry.version)),
            IndexEntry::new("team", &entry.team),
        ];
        Ok(batch
            .require_absent(HISTORY_TABLE, &entry.key())
            .put(HISTORY_TABLE, &entry.key(), serde_json::to_vec(entry)?, indexes)
            .put(HEAD_TABLE, &entry.deployment_id, serde_json::to_vec(&head)?, vec![]))
    }

    async fn publish(&self, event: &EventEnvelope, deployment_id: &str) {
        if let Err(e) = self.bus.publish(&self.subject, event).await {
            warn!(%deployment_id, event_type=%event.event_type, error=%e, "deployment_event_publish_failed");
        }
    }

    pub async fn update_deployment_status(&self, ctx: &AccessContext, deployment_id: &str, update: StatusUpdate) -> Result<DeploymentHistoryEntry> {
        let res = self.update_inner(ctx, deployment_id, update).await;
        METRICS.record_op("update_deployment_status", res.is_ok());
        res
    }

    /// The entry, the head and the version's status land in one batch. A
    /// guard failure on the head means another report won; one on the
    /// version alone is retried from a fresh read.
    async fn update_inner(&self, ctx: &AccessContext, deployment_id: &str, update: StatusUpdate) -> Result<DeploymentHistoryEntry> {
        let not_found = || RegistryError::NotFound(format!("deployment {deployment_id}"));
        let mut seen_head: Option<Vec<u8>> = None;
        for _ in 0..UPDATE_ATTEMPTS {
            let head_raw = self.store.get(HEAD_TABLE, deployment_id).await?.ok_or_else(not_found)?;
            if seen_head.as_ref().is_some_and(|seen| seen != &head_raw) {
                return Err(RegistryError::Conflict(format!("deployment {deployment_id}")));
            }
            let head: DeploymentHead = serde_json::from_slice(&head_raw)?;
            Policy::evaluate(ctx, Resource::Team(&head.team), Action::Deploy)
                .into_result()
                .map_err(|e| e.mask_as_not_found(&format!("deployment {deployment_id}")))?;

            if let Some(expected) = update.expected_status {
                if expected != head.status {
                    return Err(RegistryError::Conflict(format!("deployment {deployment_id} is {}, expected {expected}", head.status)));
                }
            }
            if !head.status.can_transition_to(update.status) {
                return Err(RegistryError::InvalidTransition { from: head.status, to: update.status });
            }

            let entry = DeploymentHistoryEntry {
                deployment_id: deployment_id.to_string(),
                seq: head.seq + 1,
                event_type: "STATUS_UPDATED".into(),
                status: update.status,
                model_id: head.model_id,
                version: head.version,
                target: head.target,
                team: head.team,
                timestamp: Utc::now(),
                metadata: update.metadata.clone(),
                error: update.error.clone(),
            };
            let batch = self.with_version_status(WriteBatch::new(), &entry).await?;
            let batch = self.append(batch.require_equals(HEAD_TABLE, deployment_id, head_raw.clone()), &entry)?;
            match self.store.commit(batch).await {
                Ok(()) => {
                    METRICS.deployment_events_total.with_label_values(&[entry.status.as_str()]).inc();
                    info!(%deployment_id, status=%entry.status, seq=entry.seq, "deployment_status_recorded");
                    return Ok(entry);
                }
                Err(StoreError::PreconditionFailed(_)) => seen_head = Some(head_raw),
                Err(e) => return Err(e.into()),
            }
        }
        Err(RegistryError::Conflict(format!("deployment {deployment_id}")))
    }

    /// Adds the version's status change to `batch`, guarded on the bytes read.
    /// A version deregistered mid-deployment is left alone, guarded on its
    /// absence.
    async fn with_version_status(&self, batch: WriteBatch, entry: &DeploymentHistoryEntry) -> Result<WriteBatch> {
        let wanted = entry.status.model_status();
        match versions::load(self.store.as_ref(), &entry.model_id, &entry.version).await? {
            Some((v, _)) if v.status == wanted => Ok(batch),
            Some((mut v, raw)) => {
                v.status = wanted;
                v.updated_at = entry.timestamp;
                versions::rewrite(batch, &raw, &v)
            }
            None => {
                warn!(deployment_id=%entry.deployment_id, model_id=%entry.model_id, version=%entry.version, "deployment_references_missing_version");
                Ok(batch.require_absent(VERSIONS_TABLE, &version_key(&entry.model_id, &entry.version)))
            }
        }
    }

    pub async fn cancel_deployment(&self, ctx: &AccessContext, deployment_id: &str, reason: Option<String>) -> Result<DeploymentHistoryEntry> {
        let mut update = StatusUpdate::new(DeploymentStatus::Cancelled);
        update.metadata = reason.as_ref().map(|r| json!({ "reason": r }));
        let entry = self.update_deployment_status(ctx, deployment_id, update).await?;
        let event = EventEnvelope::new(EVENT_CANCELLED, json!({
            "deploymentId": entry.deployment_id,
            "modelId": entry.model_id,
            "version": entry.version,
            "target": entry.target,
            "team": entry.team,
            "reason": reason,
            "cancelledBy": ctx.team,
        }));
        self.publish(&event, deployment_id).await;
        Ok(entry)
    }

    /// By deployment id (chronological) or by model version. Remaining
    /// filters are applied in memory; entries the caller may not read are
    /// dropped.
    pub async fn get_history(&self, ctx: &AccessContext, query: HistoryQuery) -> Result<Vec<DeploymentHistoryEntry>> {
        if let Some(team) = query.team.as_deref() { resolve_team(ctx, Some(team))?; }
        let rows = match (&query.deployment_id, &query.model_id, &query.version) {
            (Some(id), _, _) => self.store.scan(HISTORY_TABLE, Scan::prefix(&format!("{id}#"))).await?,
            (None, Some(model_id), Some(version)) => {
                self.store.query_index(HISTORY_TABLE, "model_version", &model_version_label(model_id, &canonical_version(version))).await?
            }
            _ => return Err(RegistryError::validation("query", "deploymentId or modelId with version is required")),
        };
        let mut out = Vec::with_capacity(rows.len());
        for (_, raw) in rows {
            let entry: DeploymentHistoryEntry = serde_json::from_slice(&raw)?;
            if !query.matches(&entry) { continue; }
            if !Policy::evaluate(ctx, Resource::Team(&entry.team), Action::Read).is_allowed() { continue; }
            out.push(entry);
        }
        if query.deployment_id.is_some() {
            out.sort_by_key(|e| e.seq);
        } else {
            out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.deployment_id.cmp(&b.deployment_id)).then(a.seq.cmp(&b.seq)));
        }
        Ok(out)
    }

    /// Current status of a deployment, from its head record.
    pub async fn current_status(&self, deployment_id: &str) -> Result<Option<DeploymentStatus>> {
        match self.store.get(HEAD_TABLE, deployment_id).await? {
            Some(raw) => Ok(Some(serde_json::from_slice::<DeploymentHead>(&raw)?.status)),
            None => Ok(None),
        }
    }
}
