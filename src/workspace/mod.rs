//! Workspace identity and persisted workspace records.
//!
//! A workspace is one persisted unit of work scoped to an organization,
//! repository and feature. Its canonical identifier is the string
//! `"{org}/{repo}/{feature}"`; the file-backed store lives in [`store`].

mod store;

pub use store::{ArchiveWorkspace, CreateWorkspace, WorkspaceStore};

use crate::errors::{OrchestratorError, Result};
use crate::pipeline::WorkspaceRunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Key of the flattened metadata map under which the hosting UI round-trips
/// serialized pipeline runner progress (see [`WorkspaceMetadata::set_run_state`]).
pub const RUN_STATE_METADATA_KEY: &str = "pipeline_run_state";

/// The `{org, repo, feature}` triple addressing one workspace.
///
/// All three segments are non-empty. `org` and `repo` must not contain `/`;
/// the identifier format reserves it as the segment separator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceKey {
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub feature: String,
}

impl WorkspaceKey {
    /// Builds a key, rejecting empty segments and a `/` in `org` or `repo`.
    /// Only the feature segment may contain the separator; anywhere else it
    /// would make the key's own identifier re-parse to a different key.
    pub fn new(
        org: impl Into<String>,
        repo: impl Into<String>,
        feature: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            org: org.into(),
            repo: repo.into(),
            feature: feature.into(),
        };
        if key.org.is_empty() || key.repo.is_empty() || key.feature.is_empty() {
            return Err(OrchestratorError::EmptyKeySegment);
        }
        for segment in [&key.org, &key.repo] {
            if segment.contains('/') {
                return Err(OrchestratorError::InvalidKeySegment {
                    segment: segment.clone(),
                });
            }
        }
        Ok(key)
    }

    /// Canonical identifier string: `"{org}/{repo}/{feature}"`.
    pub fn to_id(&self) -> WorkspaceId {
        WorkspaceId(format!("{}/{}/{}", self.org, self.repo, self.feature))
    }

    /// Parses an identifier back into a key.
    ///
    /// The split is greedy on the first two separators, so a feature segment
    /// containing `/` survives a `to_id`/`parse_id` round trip. Fails with
    /// [`OrchestratorError::MalformedIdentifier`] when fewer than three
    /// non-empty segments are present.
    pub fn parse_id(id: &str) -> Result<Self> {
        let malformed = || OrchestratorError::MalformedIdentifier { id: id.to_string() };
        let mut parts = id.splitn(3, '/');
        let org = parts.next().ok_or_else(malformed)?;
        let repo = parts.next().ok_or_else(malformed)?;
        let feature = parts.next().ok_or_else(malformed)?;
        if org.is_empty() || repo.is_empty() || feature.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            org: org.to_string(),
            repo: repo.to_string(),
            feature: feature.to_string(),
        })
    }

    fn is_unset(&self) -> bool {
        self.org.is_empty() && self.repo.is_empty() && self.feature.is_empty()
    }
}

/// Canonical workspace identifier, `"{org}/{repo}/{feature}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Parses and validates a raw identifier string.
    pub fn parse(id: &str) -> Result<Self> {
        WorkspaceKey::parse_id(id).map(|key| key.to_id())
    }

    /// Decomposes the identifier back into its key.
    pub fn key(&self) -> Result<WorkspaceKey> {
        WorkspaceKey::parse_id(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&WorkspaceKey> for WorkspaceId {
    fn from(key: &WorkspaceKey) -> Self {
        key.to_id()
    }
}

/// One prompt exchanged with the step executor, kept for workspace history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// A recorded revision of the workspace's specification document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRevision {
    pub revision: u32,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Pointer to a patch file generated by a pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchPointer {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Open-ended workspace metadata.
///
/// The three well-known arrays are always materialized (missing arrays in
/// older persisted files deserialize as empty, never as absent). Everything
/// else lives in the flattened `extra` map so hosts can attach their own
/// fields without a schema change. The store hands out owned clones only;
/// callers never observe store-internal buffers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    #[serde(default)]
    pub prompt_history: Vec<PromptMessage>,
    #[serde(default)]
    pub spec_revisions: Vec<SpecRevision>,
    #[serde(default)]
    pub generated_patch_pointers: Vec<PatchPointer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkspaceMetadata {
    /// Embeds serialized runner progress under [`RUN_STATE_METADATA_KEY`],
    /// letting the host persist it through the store without the store
    /// knowing runner types beyond JSON.
    pub fn set_run_state(&mut self, state: &WorkspaceRunState) {
        let value = serde_json::to_value(state).unwrap_or(Value::Null);
        self.extra.insert(RUN_STATE_METADATA_KEY.to_string(), value);
    }

    /// Extracts previously embedded runner progress, if any.
    pub fn run_state(&self) -> Option<WorkspaceRunState> {
        let value = self.extra.get(RUN_STATE_METADATA_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// A persisted workspace record.
///
/// Created by the store on first write and mutated only through store
/// operations. Never hard-deleted; `archived` is the soft-delete flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    #[serde(default)]
    pub key: WorkspaceKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub metadata: WorkspaceMetadata,
}

impl Workspace {
    /// Backfills fields that predate the current schema so older persisted
    /// files remain loadable. A record written before `key` existed derives
    /// it from `id`.
    pub(crate) fn normalize(&mut self) -> Result<()> {
        if self.key.is_unset() {
            self.key = self.id.key()?;
        }
        Ok(())
    }
}
