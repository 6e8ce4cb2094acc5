//! Export job types and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispatch_core::{
    DocumentId, DomainError, DomainResult, ExportJobId, FileId, FrameworkId, OrganizationId,
};

/// Which payload schema an export job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportJobType {
    Document,
    Framework,
}

impl ExportJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportJobType::Document => "DOCUMENT",
            ExportJobType::Framework => "FRAMEWORK",
        }
    }
}

impl core::str::FromStr for ExportJobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DOCUMENT" => Ok(Self::Document),
            "FRAMEWORK" => Ok(Self::Framework),
            other => Err(DomainError::validation(format!(
                "unknown export job type: {other}"
            ))),
        }
    }
}

/// Arguments of a document bundle export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentExportArguments {
    pub document_ids: Vec<DocumentId>,
    #[serde(default)]
    pub with_watermark: bool,
    #[serde(default)]
    pub with_signatures: bool,
}

/// Arguments of a framework export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkExportArguments {
    pub framework_id: FrameworkId,
}

/// Typed export payload. The variant decides the job's `type` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportArguments {
    Document(DocumentExportArguments),
    Framework(FrameworkExportArguments),
}

impl ExportArguments {
    pub fn job_type(&self) -> ExportJobType {
        match self {
            ExportArguments::Document(_) => ExportJobType::Document,
            ExportArguments::Framework(_) => ExportJobType::Framework,
        }
    }

    /// JSON payload as stored in the `arguments` column.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ExportArguments::Document(args) => serde_json::to_value(args),
            ExportArguments::Framework(args) => serde_json::to_value(args),
        }
    }

    /// Decode a stored payload using the schema selected by `job_type`.
    pub fn from_json(
        job_type: ExportJobType,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match job_type {
            ExportJobType::Document => ExportArguments::Document(serde_json::from_value(value)?),
            ExportJobType::Framework => ExportArguments::Framework(serde_json::from_value(value)?),
        })
    }
}

/// Export job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportJobStatus {
    /// Queued, eligible for claim
    Pending,
    /// Claimed and being produced
    Processing,
    /// Bundle produced and delivered
    Completed,
    /// Terminal failure, `error` holds the detail
    Failed,
}

impl ExportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportJobStatus::Pending => "PENDING",
            ExportJobStatus::Processing => "PROCESSING",
            ExportJobStatus::Completed => "COMPLETED",
            ExportJobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportJobStatus::Completed | ExportJobStatus::Failed)
    }
}

impl core::str::FromStr for ExportJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!(
                "unknown export job status: {other}"
            ))),
        }
    }
}

/// Request to create an export job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExportJob {
    pub id: ExportJobId,
    pub organization_id: OrganizationId,
    pub arguments: ExportArguments,
    pub recipient_email: String,
    pub recipient_name: String,
}

impl NewExportJob {
    pub fn new(
        organization_id: OrganizationId,
        arguments: ExportArguments,
        recipient_email: impl Into<String>,
        recipient_name: impl Into<String>,
    ) -> Self {
        Self {
            id: ExportJobId::new(),
            organization_id,
            arguments,
            recipient_email: recipient_email.into(),
            recipient_name: recipient_name.into(),
        }
    }

    /// Materialize the PENDING row.
    pub fn into_job(self, now: DateTime<Utc>) -> ExportJob {
        ExportJob {
            id: self.id,
            organization_id: self.organization_id,
            arguments: self.arguments,
            status: ExportJobStatus::Pending,
            error: None,
            file_id: None,
            recipient_email: self.recipient_email,
            recipient_name: self.recipient_name,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// How a processed export ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The bundle was produced; the file is attached to the job.
    Succeeded { file_id: Option<FileId> },
    Failed { error: String },
}

/// One-shot export job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJob {
    pub id: ExportJobId,
    pub organization_id: OrganizationId,
    pub arguments: ExportArguments,
    pub status: ExportJobStatus,
    pub error: Option<String>,
    pub file_id: Option<FileId>,
    pub recipient_email: String,
    pub recipient_name: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn job_type(&self) -> ExportJobType {
        self.arguments.job_type()
    }

    /// PENDING -> PROCESSING.
    pub fn start(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != ExportJobStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "export job {} cannot start from {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = ExportJobStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// PROCESSING -> COMPLETED | FAILED.
    pub fn complete(&mut self, outcome: ExportOutcome, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != ExportJobStatus::Processing {
            return Err(DomainError::invalid_transition(format!(
                "export job {} cannot complete from {}",
                self.id,
                self.status.as_str()
            )));
        }
        match outcome {
            ExportOutcome::Succeeded { file_id } => {
                self.status = ExportJobStatus::Completed;
                self.file_id = file_id;
                self.error = None;
            }
            ExportOutcome::Failed { error } => {
                self.status = ExportJobStatus::Failed;
                self.error = Some(error);
            }
        }
        self.completed_at = Some(now);
        Ok(())
    }
}
