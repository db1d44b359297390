pub mod analysis;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod queue;
pub mod worker;

pub use analysis::{AnalysisFailure, AnalysisResult, Analyzer, AttachmentRef, JobKind, ProgressSink};
pub use broadcast::{JobEvent, JobEventBroadcaster};
pub use config::{load_config, QueueConfig};
pub use db::Database;
pub use error::{ConfigError, JotflowError, QueueError, Result};
pub use queue::{JobId, JobQueue, JobRecord, JobState, QueueCounts};
pub use worker::Processor;
