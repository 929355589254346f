//! Model version store: at-most-once registration, team-filtered reads,
//! metadata replacement and hard deletes over the generic [`KvStore`].

use chrono::Utc;
use registry_core::METRICS;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::access::{authorize_version, can_access_version, require_permission, resolve_team, AccessContext, Action, Capability};
use crate::adapters::blob::{BlobPresence, BlobStore, ARTIFACT_SCHEMES};
use crate::error::{RegistryError, Result};
use crate::model::{self, canonical_version, slugify, version_key, ModelMetadata, ModelStatus, ModelVersion, SemVer, Visibility};
use crate::store::{IndexEntry, KvStore, Scan, StoreError, WriteBatch};

pub const VERSIONS_TABLE: &str = "model_versions";
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

pub(crate) fn index_entries(v: &ModelVersion) -> Vec<IndexEntry> {
    vec![IndexEntry::new("team", &v.team), IndexEntry::new("target", &v.deployment_target)]
}

fn decode(key: &str, raw: &[u8]) -> Result<ModelVersion> {
    serde_json::from_slice(raw).map_err(|e| RegistryError::Internal(format!("corrupt version record {key}: {e}")))
}

/// Current record plus the exact bytes read, for a guarded rewrite.
pub(crate) async fn load(store: &dyn KvStore, model_id: &str, version: &str) -> Result<Option<(ModelVersion, Vec<u8>)>> {
    let key = version_key(model_id, &canonical_version(version));
    match store.get(VERSIONS_TABLE, &key).await? {
        Some(raw) => Ok(Some((decode(&key, &raw)?, raw))),
        None => Ok(None),
    }
}

pub(crate) fn rewrite(batch: WriteBatch, previous: &[u8], v: &ModelVersion) -> Result<WriteBatch> {
    let key = v.key();
    Ok(batch.require_equals(VERSIONS_TABLE, &key, previous.to_vec()).put(VERSIONS_TABLE, &key, serde_json::to_vec(v)?, index_entries(v)))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub version: String,
    pub framework: String,
    pub artifact_uri: String,
    pub deployment_target: String,
    /// Owning team; defaults to the caller's.
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub metadata: ModelMetadata,
}

#[derive(Default)]
struct Violations(BTreeMap<String, String>);

impl Violations {
    fn check(&mut self, ok: bool, field: &str, problem: &str) {
        if !ok { self.0.entry(field.to_string()).or_insert_with(|| problem.to_string()); }
    }

    fn finish(self) -> Result<()> {
        if self.0.is_empty() { return Ok(()); }
        let message = self.0.iter().map(|(f, p)| format!("{f}: {p}")).collect::<Vec<_>>().join("; ");
        Err(RegistryError::Validation { message, details: self.0 })
    }
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<()> {
        let mut v = Violations::default();
        v.check(!slugify(&self.name).is_empty(), "name", "must contain at least one alphanumeric character");
        v.check(self.version.parse::<SemVer>().is_ok(), "version", "must be major.minor.patch");
        v.check(!self.framework.trim().is_empty(), "framework", "is required");
        v.check(!self.deployment_target.trim().is_empty(), "deploymentTarget", "is required");
        let scheme_ok = Url::parse(&self.artifact_uri).map(|u| ARTIFACT_SCHEMES.contains(&u.scheme())).unwrap_or(false);
        v.check(scheme_ok, "artifactUri", "must be an s3, gs, http(s) or file uri");
        if let Err(RegistryError::Validation { details, .. }) = self.metadata.validate() {
            for (field, problem) in details { v.check(false, &field, &problem); }
        }
        v.finish()
    }
}

/// Global listing filters. `team` and `target` use secondary indexes; the
/// rest are applied in memory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub team: Option<String>,
    pub target: Option<String>,
    pub name: Option<String>,
    pub framework: Option<String>,
    pub status: Option<ModelStatus>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl ListFilter {
    fn matches(&self, v: &ModelVersion) -> bool {
        if let Some(target) = &self.target { if &v.deployment_target != target { return false; } }
        if let Some(name) = &self.name {
            let needle = name.to_lowercase();
            if !v.name.to_lowercase().contains(&needle) && !v.model_id.contains(&needle) { return false; }
        }
        if let Some(fw) = &self.framework { if !v.framework.eq_ignore_ascii_case(fw) { return false; } }
        if let Some(status) = self.status { if v.status != status { return false; } }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub items: Vec<ModelVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub struct ModelVersionService {
    store: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    verify_artifacts: bool,
}

impl ModelVersionService {
    pub fn new(store: Arc<dyn KvStore>, blob: Arc<dyn BlobStore>, verify_artifacts: bool) -> Self {
        Self { store, blob, verify_artifacts }
    }

    pub async fn register(&self, ctx: &AccessContext, req: RegisterRequest) -> Result<ModelVersion> {
        let res = self.register_inner(ctx, req).await;
        METRICS.record_op("register", res.is_ok());
        res
    }

    async fn register_inner(&self, ctx: &AccessContext, req: RegisterRequest) -> Result<ModelVersion> {
        require_permission(ctx, Capability::Write)?;
        let team = resolve_team(ctx, req.team.as_deref())?;
        req.validate()?;
        let model_id = slugify(&req.name);
        if self.verify_artifacts { self.verify_artifact(&req.artifact_uri).await?; }

        let now = Utc::now();
        let v = ModelVersion {
            model_id,
            version: canonical_version(&req.version),
            name: req.name,
            framework: req.framework,
            artifact_uri: req.artifact_uri,
            deployment_target: req.deployment_target,
            status: ModelStatus::Registered,
            team,
            visibility: req.visibility,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        let key = v.key();
        let batch = WriteBatch::new().require_absent(VERSIONS_TABLE, &key).put(VERSIONS_TABLE, &key, serde_json::to_vec(&v)?, index_entries(&v));
        match self.store.commit(batch).await {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed(_)) => return Err(RegistryError::Duplicate(format!("model version {}", v.label()))),
            Err(e) => return Err(e.into()),
        }
        info!(model_id=%v.model_id, version=%v.version, team=%v.team, "model_registered");
        Ok(v)
    }

    /// Missing objects block registration; any other verification failure is
    /// only logged.
    async fn verify_artifact(&self, uri: &str) -> Result<()> {
        match self.blob.head(uri).await {
            Ok(BlobPresence::Present) => Ok(()),
            Ok(BlobPresence::Missing) => Err(RegistryError::validation("artifactUri", "artifact not found in blob storage")),
            Err(e) => {
                warn!(%uri, error=%e, "artifact_verification_skipped");
                Ok(())
            }
        }
    }

    /// Versions of one model the caller may read, in storage-key order.
    pub async fn list_versions(&self, ctx: &AccessContext, model_id: &str) -> Result<Vec<ModelVersion>> {
        let prefix = format!("{model_id}/");
        let rows = self.store.scan(VERSIONS_TABLE, Scan::prefix(&prefix)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, raw) in rows {
            let v = decode(&key, &raw)?;
            if can_access_version(ctx, &v, Action::Read) { out.push(v); }
        }
        Ok(out)
    }

    pub async fn get_version(&self, ctx: &AccessContext, model_id: &str, version: &str) -> Result<ModelVersion> {
        let (v, _) = load(self.store.as_ref(), model_id, version).await?
            .ok_or_else(|| RegistryError::NotFound(format!("model version {model_id}@{version}")))?;
        authorize_version(ctx, &v, Action::Read)?;
        Ok(v)
    }

    pub async fn get_latest(&self, ctx: &AccessContext, model_id: &str) -> Result<ModelVersion> {
        let versions = self.list_versions(ctx, model_id).await?;
        model::latest(&versions).cloned().ok_or_else(|| RegistryError::NotFound(format!("model {model_id}")))
    }

    /// Replaces the metadata bag wholesale.
    pub async fn update_metadata(&self, ctx: &AccessContext, model_id: &str, version: &str, metadata: ModelMetadata) -> Result<ModelVersion> {
        let res = self.update_metadata_inner(ctx, model_id, version, metadata).await;
        METRICS.record_op("update_metadata", res.is_ok());
        res
    }

    async fn update_metadata_inner(&self, ctx: &AccessContext, model_id: &str, version: &str, metadata: ModelMetadata) -> Result<ModelVersion> {
        metadata.validate()?;
        let (mut v, raw) = load(self.store.as_ref(), model_id, version).await?
            .ok_or_else(|| RegistryError::NotFound(format!("model version {model_id}@{version}")))?;
        authorize_version(ctx, &v, Action::Write)?;
        v.metadata = metadata;
        v.updated_at = Utc::now();
        self.store.commit(rewrite(WriteBatch::new(), &raw, &v)?).await?;
        info!(model_id=%v.model_id, version=%v.version, "model_metadata_replaced");
        Ok(v)
    }

    /// Hard delete. Deployment history referencing the version is kept.
    pub async fn deregister(&self, ctx: &AccessContext, model_id: &str, version: &str) -> Result<()> {
        let res = self.deregister_inner(ctx, model_id, version).await;
        METRICS.record_op("deregister", res.is_ok());
        res
    }

    async fn deregister_inner(&self, ctx: &AccessContext, model_id: &str, version: &str) -> Result<()> {
        let (v, raw) = load(self.store.as_ref(), model_id, version).await?
            .ok_or_else(|| RegistryError::NotFound(format!("model version {model_id}@{version}")))?;
        authorize_version(ctx, &v, Action::Write)?;
        let key = v.key();
        self.store.commit(WriteBatch::new().require_equals(VERSIONS_TABLE, &key, raw).delete(VERSIONS_TABLE, &key)).await?;
        info!(model_id=%v.model_id, version=%v.version, "model_deregistered");
        Ok(())
    }

    pub async fn list(&self, ctx: &AccessContext, filter: ListFilter) -> Result<ListPage> {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(RegistryError::validation("limit", format!("must be between 1 and {MAX_PAGE_SIZE}")));
        }
        let rows = if let Some(team) = filter.team.as_deref() {
            let team = resolve_team(ctx, Some(team))?;
            self.store.query_index(VERSIONS_TABLE, "team", &team).await?
        } else if let Some(target) = filter.target.as_deref() {
            self.store.query_index(VERSIONS_TABLE, "target", target).await?
        } else {
            // full scan; linear in the number of versions
            self.store.scan(VERSIONS_TABLE, Scan { prefix: "", start_after: filter.cursor.as_deref(), limit: None }).await?
        };

        let mut items = Vec::new();
        let mut next_cursor = None;
        for (key, raw) in rows {
            if let Some(cursor) = filter.cursor.as_deref() { if key.as_str() <= cursor { continue; } }
            let v = decode(&key, &raw)?;
            if !filter.matches(&v) || !can_access_version(ctx, &v, Action::Read) { continue; }
            if items.len() == limit {
                next_cursor = items.last().map(ModelVersion::key);
                break;
            }
            items.push(v);
        }
        Ok(ListPage { items, next_cursor })
    }
}
