//! The job record and its state machine.
//!
//! Job state is a tagged union carrying only the fields valid for each
//! status, so "a complete job with no result" cannot be constructed. All
//! transitions go through the methods here; anything outside the transition
//! table fails with `QueueError::InvalidTransition` and leaves the record
//! unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{AnalysisResult, AttachmentRef, JobKind};
use crate::db::job_repo::JobRow;
use crate::error::QueueError;

/// Number of characters of input kept as the immutable preview.
pub const PREVIEW_CHARS: usize = 50;

/// Opaque unique job identifier, assigned at submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status-dependent job state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum JobState {
    Queued,
    Processing {
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step: Option<String>,
    },
    Complete {
        result: AnalysisResult,
        completed_at: DateTime<Utc>,
    },
    Error {
        #[serde(rename = "errorMessage")]
        message: String,
        completed_at: DateTime<Utc>,
    },
}

/// One unit of user-submitted content awaiting or undergoing analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    /// Full user-submitted content.
    pub input: String,
    /// First `PREVIEW_CHARS` characters of the input, derived at submission.
    pub input_preview: String,
    /// Phase labels seen so far, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    /// Attachment references carried through unmodified.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobRecord {
    /// Creates a freshly submitted (queued) job.
    pub(crate) fn new(kind: JobKind, input: &str, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            input: input.to_string(),
            input_preview: input.chars().take(PREVIEW_CHARS).collect(),
            steps: Vec::new(),
            attachments,
            created_at: Utc::now(),
            state: JobState::Queued,
        }
    }

    /// Short status name, as persisted and shown in errors.
    pub fn status_str(&self) -> &'static str {
        match self.state {
            JobState::Queued => "queued",
            JobState::Processing { .. } => "processing",
            JobState::Complete { .. } => "complete",
            JobState::Error { .. } => "error",
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.state, JobState::Queued)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.state, JobState::Processing { .. })
    }

    /// Returns true once the job has reached `complete` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Complete { .. } | JobState::Error { .. }
        )
    }

    /// Progress percentage; defined only while processing or complete.
    pub fn progress(&self) -> Option<u8> {
        match self.state {
            JobState::Processing { progress, .. } => Some(progress),
            JobState::Complete { .. } => Some(100),
            _ => None,
        }
    }

    pub fn current_step(&self) -> Option<&str> {
        match &self.state {
            JobState::Processing { current_step, .. } => current_step.as_deref(),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match &self.state {
            JobState::Complete { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            JobState::Error { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Complete { completed_at, .. } | JobState::Error { completed_at, .. } => {
                Some(completed_at)
            }
            _ => None,
        }
    }

    fn invalid(&self, operation: &'static str) -> QueueError {
        QueueError::InvalidTransition {
            id: self.id.to_string(),
            operation,
            reason: format!("status is {}", self.status_str()),
        }
    }

    /// queued -> processing.
    pub(crate) fn begin_processing(&mut self) -> Result<(), QueueError> {
        match self.state {
            JobState::Queued => {
                self.state = JobState::Processing {
                    progress: 0,
                    current_step: None,
                };
                Ok(())
            }
            _ => Err(self.invalid("mark_processing")),
        }
    }

    /// processing -> processing. Progress never decreases; the step label is
    /// appended to the log unless it repeats the previous entry.
    pub(crate) fn record_progress(&mut self, percent: u8, step: &str) -> Result<(), QueueError> {
        match &mut self.state {
            JobState::Processing {
                progress,
                current_step,
            } => {
                *progress = (*progress).max(percent.min(100));
                *current_step = Some(step.to_string());
                if self.steps.last().map(String::as_str) != Some(step) {
                    self.steps.push(step.to_string());
                }
                Ok(())
            }
            _ => Err(self.invalid("apply_progress")),
        }
    }

    /// processing -> complete.
    pub(crate) fn finish(&mut self, result: AnalysisResult) -> Result<(), QueueError> {
        match self.state {
            JobState::Processing { .. } => {
                self.state = JobState::Complete {
                    result,
                    completed_at: Utc::now(),
                };
                Ok(())
            }
            _ => Err(self.invalid("mark_complete")),
        }
    }

    /// processing -> error.
    pub(crate) fn fail(&mut self, message: &str) -> Result<(), QueueError> {
        match self.state {
            JobState::Processing { .. } => {
                self.state = JobState::Error {
                    message: message.to_string(),
                    completed_at: Utc::now(),
                };
                Ok(())
            }
            _ => Err(self.invalid("mark_error")),
        }
    }

    /// error -> queued. The sole user-facing recovery action for failed
    /// jobs: id, input and created_at are kept, everything run-specific is
    /// cleared.
    pub(crate) fn reset_for_retry(&mut self) -> Result<(), QueueError> {
        match self.state {
            JobState::Error { .. } => {
                self.state = JobState::Queued;
                self.steps.clear();
                Ok(())
            }
            _ => Err(self.invalid("retry")),
        }
    }

    /// Startup recovery: a job persisted as `processing` cannot have a live
    /// worker, so it is requeued as if freshly submitted (original
    /// `created_at` kept, so it resumes ahead of strictly newer jobs).
    /// Returns whether the record changed.
    pub(crate) fn recover_orphaned(&mut self) -> bool {
        match self.state {
            JobState::Processing { .. } => {
                self.state = JobState::Queued;
                self.steps.clear();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn to_row(&self) -> JobRow {
        let (progress, current_step, result, error, completed_at) = match &self.state {
            JobState::Queued => (0, None, None, None, None),
            JobState::Processing {
                progress,
                current_step,
            } => (i64::from(*progress), current_step.clone(), None, None, None),
            JobState::Complete {
                result,
                completed_at,
            } => (
                100,
                None,
                Some(result.0.to_string()),
                None,
                Some(completed_at.to_rfc3339()),
            ),
            JobState::Error {
                message,
                completed_at,
            } => (
                0,
                None,
                None,
                Some(message.clone()),
                Some(completed_at.to_rfc3339()),
            ),
        };

        JobRow {
            id: self.id.to_string(),
            kind: self.kind.to_string(),
            input: self.input.clone(),
            input_preview: self.input_preview.clone(),
            status: self.status_str().to_string(),
            progress,
            current_step,
            steps: serde_json::to_string(&self.steps).unwrap_or_else(|_| "[]".to_string()),
            result,
            error,
            attachments: serde_json::to_string(&self.attachments)
                .unwrap_or_else(|_| "[]".to_string()),
            created_at: self.created_at.to_rfc3339(),
            completed_at,
        }
    }

    pub(crate) fn from_row(row: &JobRow) -> Result<Self, RowParseError> {
        let kind = match row.kind.as_str() {
            "note" => JobKind::Note,
            "task" => JobKind::Task,
            other => return Err(RowParseError::UnknownKind(other.to_string())),
        };

        let created_at = parse_timestamp(&row.created_at)?;
        let steps: Vec<String> = serde_json::from_str(&row.steps)?;
        let attachments: Vec<AttachmentRef> = serde_json::from_str(&row.attachments)?;

        let state = match row.status.as_str() {
            "queued" => JobState::Queued,
            "processing" => JobState::Processing {
                progress: row.progress.clamp(0, 100) as u8,
                current_step: row.current_step.clone(),
            },
            "complete" => JobState::Complete {
                result: AnalysisResult(serde_json::from_str(
                    row.result
                        .as_deref()
                        .ok_or(RowParseError::MissingField("result"))?,
                )?),
                completed_at: parse_timestamp(
                    row.completed_at
                        .as_deref()
                        .ok_or(RowParseError::MissingField("completed_at"))?,
                )?,
            },
            "error" => JobState::Error {
                message: row
                    .error
                    .clone()
                    .ok_or(RowParseError::MissingField("error"))?,
                completed_at: parse_timestamp(
                    row.completed_at
                        .as_deref()
                        .ok_or(RowParseError::MissingField("completed_at"))?,
                )?,
            },
            other => return Err(RowParseError::UnknownStatus(other.to_string())),
        };

        Ok(Self {
            id: JobId(row.id.clone()),
            kind,
            input: row.input.clone(),
            input_preview: row.input_preview.clone(),
            steps,
            attachments,
            created_at,
            state,
        })
    }
}

/// A persisted row that violates the record invariants.
#[derive(Error, Debug)]
pub enum RowParseError {
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("unknown kind '{0}'")]
    UnknownKind(String),

    #[error("missing field '{0}' for this status")]
    MissingField(&'static str),

    #[error("bad timestamp '{0}'")]
    BadTimestamp(String),

    #[error("bad JSON column: {0}")]
    BadJson(#[from] serde_json::Error),
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RowParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RowParseError::BadTimestamp(s.to_string()))
}
