//! Deployment creation workflow.
//!
//! Coordinates the relational store and the object store without a
//! cross-system transaction: forward steps push a compensating action onto
//! a step log, and on failure the log is unwound in reverse. Compensation
//! failures are collected (all of them, not just the first) into a
//! `PartialFailure` that names whatever was left inconsistent.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{opts, IntCounter, IntCounterVec};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::deployments::{DeploymentRepository, NewDeployment};
use super::files::{FileRecordRepository, NewFileRecord};
use super::RepoError;
use crate::keys::derive_storage_key;
use crate::models::{DeploymentDetail, FileRecord};
use crate::storage::{ArtifactStore, StorageError};
use crate::telemetry::REGISTRY;

/// Extensions the intake accepts, matching the release-document policy.
const ALLOWED_FILE_TYPES: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx"];

static WORKFLOW_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        opts!("deployment_workflow_total", "Deployment workflow outcomes"),
        &["entry", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
static COMPENSATION_RUNS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("deployment_compensation_runs_total", "Compensation unwinds started").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
static COMPENSATION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "deployment_compensation_failures_total",
        "Compensation unwinds that left inconsistent state",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
static ARTIFACT_UPLOAD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("artifact_upload_bytes_total", "Total artifact bytes uploaded").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("an artifact file is required for deployment creation")]
    MissingArtifact,
    #[error("{0}")]
    Validation(String),
    #[error("unsupported file type .{0}: only PDF, Word, Excel and PowerPoint files are allowed")]
    UnsupportedFileType(String),
    #[error("version {version} already exists for service {service_id}")]
    DuplicateVersion { service_id: Uuid, version: String },
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),
    #[error("artifact staging failed: {0}")]
    Staging(#[from] io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("compensation failed after error ({cause}); deployment={deployment_id:?} storage_key={storage_key:?}: {}", compensation_errors.join("; "))]
    PartialFailure {
        deployment_id: Option<Uuid>,
        storage_key: Option<String>,
        compensation_errors: Vec<String>,
        cause: String,
    },
}

/// Temporary on-disk spool for an uploaded artifact. The file is removed on
/// drop, so every workflow branch releases the staging copy.
pub struct TempSpool {
    path: PathBuf,
}

impl TempSpool {
    pub fn create(dir: &Path) -> io::Result<(Self, fs::File)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("upload-{}.part", Uuid::new_v4()));
        let file = fs::File::create(&path)?;
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

impl Drop for TempSpool {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// An uploaded artifact staged on local disk, awaiting the object-store put.
pub struct StagedArtifact {
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub spool: TempSpool,
}

impl StagedArtifact {
    /// Extension without the dot, lowercased. Empty when the name has none.
    pub fn file_type(&self) -> String {
        match self.original_name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext.to_ascii_lowercase(),
            _ => String::new(),
        }
    }

    pub fn spool_bytes(data: &[u8], name: &str, content_type: &str, dir: &Path) -> io::Result<Self> {
        let (spool, mut file) = TempSpool::create(dir)?;
        file.write_all(data)?;
        Ok(Self {
            original_name: name.to_string(),
            content_type: content_type.to_string(),
            size_bytes: data.len() as i64,
            spool,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateDeployment {
    pub service_id: Uuid,
    pub version: String,
    pub changes: Option<String>,
    pub branch_name: Option<String>,
    pub created_by: Uuid,
}

/// Step log entry: the action that undoes an already-committed step.
enum Compensation {
    DeleteObject { key: String },
    DeleteDeployment { id: Uuid },
}

#[derive(Clone)]
pub struct DeploymentWorkflow {
    deployments: Arc<dyn DeploymentRepository>,
    files: Arc<dyn FileRecordRepository>,
    store: Arc<dyn ArtifactStore>,
    bucket: String,
}

impl DeploymentWorkflow {
    pub fn new(
        deployments: Arc<dyn DeploymentRepository>,
        files: Arc<dyn FileRecordRepository>,
        store: Arc<dyn ArtifactStore>,
        bucket: String,
    ) -> Self {
        Self { deployments, files, store, bucket }
    }

    /// Create a deployment together with its mandatory artifact.
    ///
    /// Duplicate-version failures are reported before anything is written to
    /// the object store. Later failures unwind the step log; if the unwind
    /// itself fails the caller gets `PartialFailure` naming the orphaned
    /// deployment so an operator can reconcile.
    pub async fn create_with_artifact(
        &self,
        input: CreateDeployment,
        artifact: StagedArtifact,
    ) -> Result<(DeploymentDetail, FileRecord), WorkflowError> {
        let outcome = self.create_inner(input, artifact).await;
        let label = if outcome.is_ok() { "ok" } else { "error" };
        WORKFLOW_OUTCOMES.with_label_values(&["create", label]).inc();
        outcome
    }

    async fn create_inner(
        &self,
        input: CreateDeployment,
        artifact: StagedArtifact,
    ) -> Result<(DeploymentDetail, FileRecord), WorkflowError> {
        // Validating
        if input.version.trim().is_empty() {
            return Err(WorkflowError::Validation("version is required".into()));
        }
        validate_artifact(&artifact)?;
        let service_name = self
            .deployments
            .service_name(input.service_id)
            .await?
            .ok_or(WorkflowError::ServiceNotFound(input.service_id))?;
        let key = derive_storage_key(&service_name, &input.version, &artifact.original_name)
            .map_err(|e| WorkflowError::Validation(e.to_string()))?;
        // Read the staging copy up front so local IO failures need no
        // compensation.
        let bytes = artifact.spool.read()?;

        // CreatingDeployment: fast-path probe, then insert backed by the
        // UNIQUE constraint. Either way nothing has touched storage yet.
        if self
            .deployments
            .version_exists(input.service_id, &input.version)
            .await?
        {
            return Err(WorkflowError::DuplicateVersion {
                service_id: input.service_id,
                version: input.version,
            });
        }
        let deployment = self
            .deployments
            .create(NewDeployment {
                service_id: input.service_id,
                version: input.version.clone(),
                changes: input.changes.clone(),
                created_by: input.created_by,
                branch_name: input.branch_name.clone(),
            })
            .await
            .map_err(|e| match e {
                RepoError::UniqueViolation => WorkflowError::DuplicateVersion {
                    service_id: input.service_id,
                    version: input.version.clone(),
                },
                other => WorkflowError::Repo(other),
            })?;
        let mut log = vec![Compensation::DeleteDeployment { id: deployment.id }];

        // UploadingArtifact
        if let Err(e) = self
            .store
            .put(&self.bucket, &key, bytes, &artifact.content_type)
            .await
        {
            return self
                .fail(log, Some(deployment.id), Some(key), e.into())
                .await;
        }
        ARTIFACT_UPLOAD_BYTES.inc_by(artifact.size_bytes.max(0) as u64);
        log.push(Compensation::DeleteObject { key: key.clone() });

        // LinkingFile
        match self
            .files
            .create(NewFileRecord {
                deployment_id: deployment.id,
                original_name: artifact.original_name.clone(),
                storage_key: key.clone(),
                file_type: artifact.file_type(),
                size_bytes: artifact.size_bytes,
                uploaded_by: input.created_by,
            })
            .await
        {
            Ok(file) => {
                info!(deployment_id=%deployment.id, storage_key=%key, size_bytes=artifact.size_bytes,
                    "deployment created with artifact");
                Ok((deployment, file))
            }
            Err(e) => {
                self.fail(log, Some(deployment.id), Some(key), e.into())
                    .await
            }
        }
    }

    /// Attach an additional artifact to an existing deployment, reusing the
    /// same key derivation and the upload/link compensation of the creation
    /// workflow. The pre-existing deployment row is never compensated away.
    pub async fn attach_artifact(
        &self,
        deployment_id: Uuid,
        uploaded_by: Uuid,
        artifact: StagedArtifact,
    ) -> Result<FileRecord, WorkflowError> {
        let outcome = self.attach_inner(deployment_id, uploaded_by, artifact).await;
        let label = if outcome.is_ok() { "ok" } else { "error" };
        WORKFLOW_OUTCOMES.with_label_values(&["attach", label]).inc();
        outcome
    }

    async fn attach_inner(
        &self,
        deployment_id: Uuid,
        uploaded_by: Uuid,
        artifact: StagedArtifact,
    ) -> Result<FileRecord, WorkflowError> {
        validate_artifact(&artifact)?;
        let deployment = self
            .deployments
            .find_by_id(deployment_id)
            .await?
            .ok_or(WorkflowError::DeploymentNotFound(deployment_id))?;
        let service_name = match deployment.service_name.clone() {
            Some(name) => name,
            None => self
                .deployments
                .service_name(deployment.service_id)
                .await?
                .ok_or(WorkflowError::ServiceNotFound(deployment.service_id))?,
        };
        let key = derive_storage_key(&service_name, &deployment.version, &artifact.original_name)
            .map_err(|e| WorkflowError::Validation(e.to_string()))?;
        let bytes = artifact.spool.read()?;

        let mut log = Vec::new();
        self.store
            .put(&self.bucket, &key, bytes, &artifact.content_type)
            .await?;
        ARTIFACT_UPLOAD_BYTES.inc_by(artifact.size_bytes.max(0) as u64);
        log.push(Compensation::DeleteObject { key: key.clone() });

        match self
            .files
            .create(NewFileRecord {
                deployment_id,
                original_name: artifact.original_name.clone(),
                storage_key: key.clone(),
                file_type: artifact.file_type(),
                size_bytes: artifact.size_bytes,
                uploaded_by,
            })
            .await
        {
            Ok(file) => {
                info!(deployment_id=%deployment_id, storage_key=%key, "artifact attached");
                Ok(file)
            }
            Err(e) => self.fail(log, None, Some(key), e.into()).await,
        }
    }

    /// Unwind the step log in reverse. Returns the original error when every
    /// compensating action succeeds, otherwise a `PartialFailure` carrying
    /// all collected compensation errors and the ids left inconsistent.
    async fn fail<T>(
        &self,
        log: Vec<Compensation>,
        deployment_id: Option<Uuid>,
        storage_key: Option<String>,
        cause: WorkflowError,
    ) -> Result<T, WorkflowError> {
        COMPENSATION_RUNS.inc();
        let mut errors = Vec::new();
        for step in log.into_iter().rev() {
            match step {
                Compensation::DeleteObject { key } => {
                    if let Err(e) = self.store.delete(&self.bucket, &key).await {
                        errors.push(format!("delete object {key}: {e}"));
                    }
                }
                Compensation::DeleteDeployment { id } => {
                    if let Err(e) = self.deployments.delete(id).await {
                        errors.push(format!("delete deployment {id}: {e}"));
                    }
                }
            }
        }
        if errors.is_empty() {
            warn!(?deployment_id, ?storage_key, error=%cause,
                "workflow failed, compensation restored consistency");
            Err(cause)
        } else {
            COMPENSATION_FAILURES.inc();
            error!(?deployment_id, ?storage_key, compensation_errors=?errors, error=%cause,
                "compensation failed, state requires manual reconciliation");
            Err(WorkflowError::PartialFailure {
                deployment_id,
                storage_key,
                compensation_errors: errors,
                cause: cause.to_string(),
            })
        }
    }
}

fn validate_artifact(artifact: &StagedArtifact) -> Result<(), WorkflowError> {
    if artifact.size_bytes <= 0 {
        return Err(WorkflowError::MissingArtifact);
    }
    let file_type = artifact.file_type();
    if !ALLOWED_FILE_TYPES.contains(&file_type.as_str()) {
        return Err(WorkflowError::UnsupportedFileType(file_type));
    }
    Ok(())
}
