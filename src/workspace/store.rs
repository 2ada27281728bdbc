//! File-backed workspace repository.
//!
//! One pretty-printed JSON document per workspace, addressed by
//! `<base>/<org>/<repo>/<feature>.json`. Path separators inside any key
//! segment are replaced with `_` so a hostile segment cannot escape the
//! storage root or nest extra directories. Every write is a full-file
//! overwrite under an advisory exclusive lock.

use super::{Workspace, WorkspaceKey, WorkspaceMetadata};
use crate::errors::{OrchestratorError, Result};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Input for [`WorkspaceStore::create_workspace`].
#[derive(Debug, Clone)]
pub struct CreateWorkspace {
    pub key: WorkspaceKey,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Missing metadata is normalized to empty arrays, never left absent.
    pub metadata: Option<WorkspaceMetadata>,
}

impl CreateWorkspace {
    pub fn new(key: WorkspaceKey) -> Self {
        Self {
            key,
            title: None,
            description: None,
            metadata: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: WorkspaceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Input for [`WorkspaceStore::archive_workspace`].
#[derive(Debug, Clone)]
pub struct ArchiveWorkspace {
    pub key: WorkspaceKey,
    /// `None` defaults to `true` (archive).
    pub archived: Option<bool>,
}

/// Durable repository of [`Workspace`] records rooted at one base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    base_path: PathBuf,
}

impl WorkspaceStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Ensures the storage root exists. Idempotent.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).map_err(|source| {
            OrchestratorError::StorageUnavailable {
                path: self.base_path.clone(),
                source,
            }
        })
    }

    /// Walks the two-level directory tree and returns every parseable
    /// workspace, most recently touched first.
    ///
    /// A missing root is an empty listing, not an error. Records that fail
    /// to read or parse are logged and skipped so one corrupted file cannot
    /// hide the rest.
    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let orgs = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(OrchestratorError::StorageUnavailable {
                    path: self.base_path.clone(),
                    source,
                })
            }
        };

        let mut workspaces = Vec::new();
        for org_dir in subdirectories(orgs) {
            let repos = match fs::read_dir(&org_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %org_dir.display(), error = %e, "skipping unreadable org directory");
                    continue;
                }
            };
            for repo_dir in subdirectories(repos) {
                let files = match fs::read_dir(&repo_dir) {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!(path = %repo_dir.display(), error = %e, "skipping unreadable repo directory");
                        continue;
                    }
                };
                for entry in files.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        match self.read_record(&path) {
                            Ok(workspace) => workspaces.push(workspace),
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "skipping unparseable workspace record");
                            }
                        }
                    }
                }
            }
        }

        workspaces.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(workspaces)
    }

    /// Direct lookup; `Ok(None)` when no record exists for the key.
    pub fn get_workspace(&self, key: &WorkspaceKey) -> Result<Option<Workspace>> {
        let path = self.record_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(OrchestratorError::ReadRecord { path, source }),
        };
        let mut workspace: Workspace = serde_json::from_str(&content)
            .map_err(|source| OrchestratorError::ParseRecord { path, source })?;
        workspace.normalize()?;
        Ok(Some(workspace))
    }

    /// Like [`get_workspace`](Self::get_workspace) but keyed by the canonical
    /// identifier string. Fails with `MalformedIdentifier` when the string
    /// cannot be decomposed into a key.
    pub fn get_workspace_by_id(&self, id: &str) -> Result<Option<Workspace>> {
        let key = WorkspaceKey::parse_id(id)?;
        self.get_workspace(&key)
    }

    /// Creates and persists a new workspace record.
    ///
    /// `created_at == updated_at` on the stored record. Fails with
    /// `WorkspaceAlreadyExists` when a record for the key is already present.
    pub fn create_workspace(&self, input: CreateWorkspace) -> Result<Workspace> {
        let id = input.key.to_id();
        if self.record_path(&input.key).exists() {
            return Err(OrchestratorError::WorkspaceAlreadyExists {
                id: id.to_string(),
            });
        }

        let now = Utc::now();
        let workspace = Workspace {
            id,
            key: input.key,
            title: input.title,
            description: input.description,
            created_at: now,
            updated_at: now,
            archived: false,
            metadata: input.metadata.unwrap_or_default(),
        };
        self.persist(&workspace)?;
        Ok(workspace)
    }

    /// Replaces the record's metadata wholesale (not a merge) and bumps
    /// `updated_at`. Fails with `WorkspaceNotFound` when absent.
    pub fn update_metadata(
        &self,
        key: &WorkspaceKey,
        metadata: WorkspaceMetadata,
    ) -> Result<Workspace> {
        let mut workspace = self.require_workspace(key)?;
        workspace.metadata = metadata;
        workspace.updated_at = Utc::now();
        self.persist(&workspace)?;
        Ok(workspace)
    }

    /// Sets the soft-delete flag (default `true`) and bumps `updated_at`.
    /// Fails with `WorkspaceNotFound` when absent.
    pub fn archive_workspace(&self, input: ArchiveWorkspace) -> Result<Workspace> {
        let mut workspace = self.require_workspace(&input.key)?;
        workspace.archived = input.archived.unwrap_or(true);
        workspace.updated_at = Utc::now();
        self.persist(&workspace)?;
        Ok(workspace)
    }

    fn require_workspace(&self, key: &WorkspaceKey) -> Result<Workspace> {
        self.get_workspace(key)?
            .ok_or_else(|| OrchestratorError::WorkspaceNotFound {
                id: key.to_id().to_string(),
            })
    }

    fn read_record(&self, path: &Path) -> Result<Workspace> {
        let content =
            fs::read_to_string(path).map_err(|source| OrchestratorError::ReadRecord {
                path: path.to_path_buf(),
                source,
            })?;
        let mut workspace: Workspace =
            serde_json::from_str(&content).map_err(|source| OrchestratorError::ParseRecord {
                path: path.to_path_buf(),
                source,
            })?;
        workspace.normalize()?;
        Ok(workspace)
    }

    fn record_path(&self, key: &WorkspaceKey) -> PathBuf {
        self.base_path
            .join(sanitize_segment(&key.org))
            .join(sanitize_segment(&key.repo))
            .join(format!("{}.json", sanitize_segment(&key.feature)))
    }

    /// Serializes the full record and overwrites the target file, creating
    /// parent directories on demand. The write happens under an advisory
    /// exclusive lock; the lock is released when the handle closes.
    fn persist(&self, workspace: &Workspace) -> Result<()> {
        let path = self.record_path(&workspace.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| OrchestratorError::StorageUnavailable {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(workspace).map_err(|source| {
            OrchestratorError::EncodeRecord {
                path: path.clone(),
                source,
            }
        })?;

        let write_err = |source| OrchestratorError::WriteRecord {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(write_err)?;
        file.lock_exclusive().map_err(write_err)?;
        file.set_len(0).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        Ok(())
    }
}

/// Replaces path separators so a key segment maps to exactly one path
/// component under the storage root.
fn sanitize_segment(segment: &str) -> String {
    segment.replace(['/', '\\'], "_")
}

fn subdirectories(entries: fs::ReadDir) -> Vec<PathBuf> {
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect()
}
