//! Contract with the external AI analysis capability.
//!
//! The queue core drives analysis but knows nothing about prompts or
//! response schemas: results and attachment references pass through as
//! opaque JSON values. Implementations live with the host application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of content a job carries; selects which analysis is invoked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Note,
    Task,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Note => write!(f, "note"),
            JobKind::Task => write!(f, "task"),
        }
    }
}

/// Opaque reference to an attachment carried through the queue unmodified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AttachmentRef(pub serde_json::Value);

/// Opaque analysis output, set only on completed jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AnalysisResult(pub serde_json::Value);

/// Failure of the analysis capability. Expected and user-recoverable:
/// the processor absorbs it into job state instead of propagating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisFailure {
    #[error("analysis failed: {0}")]
    Failed(String),

    #[error("analysis cancelled")]
    Cancelled,
}

/// Receives progress callbacks while an analysis runs.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, step: &str);
}

/// No-op sink for unit tests.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _percent: u8, _step: &str) {}
}

/// The external analysis capability.
///
/// `analyze` may emit zero or more progress callbacks (percent 0-100 plus a
/// human-readable step label) before resolving. Cancellation is cooperative:
/// the processor drops the future when the job is dismissed.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        kind: JobKind,
        input: &str,
        attachments: &[AttachmentRef],
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisResult, AnalysisFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&JobKind::Note).unwrap(), "\"note\"");
        assert_eq!(serde_json::to_string(&JobKind::Task).unwrap(), "\"task\"");
        let kind: JobKind = serde_json::from_str("\"task\"").unwrap();
        assert_eq!(kind, JobKind::Task);
    }

    #[test]
    fn test_result_is_transparent_json() {
        let result = AnalysisResult(serde_json::json!({"entities": ["John", "Sarah"]}));
        let text = serde_json::to_string(&result).unwrap();
        assert_eq!(text, r#"{"entities":["John","Sarah"]}"#);
        let back: AnalysisResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_cancelled_message_is_distinguished() {
        assert_eq!(AnalysisFailure::Cancelled.to_string(), "analysis cancelled");
        assert_eq!(
            AnalysisFailure::Failed("rate limit exceeded".into()).to_string(),
            "analysis failed: rate limit exceeded"
        );
    }
}
