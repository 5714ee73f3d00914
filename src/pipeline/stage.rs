//! Stage abstraction driven by the generic task worker

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::{RequestRecord, Timestamp};

/// The pipeline stages, in topology order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum StageKind {
    Ingress,
    Dispatch,
    Transcription,
    Tagging,
    TaggingQa,
    Completion,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        Self::Ingress,
        Self::Dispatch,
        Self::Transcription,
        Self::Tagging,
        Self::TaggingQa,
        Self::Completion,
    ];

    /// Service name used in configuration and routing
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Dispatch => "dispatch",
            Self::Transcription => "transcription",
            Self::Tagging => "tagging",
            Self::TaggingQa => "tagging-qa",
            Self::Completion => "completion",
        }
    }

    /// Suffix of the `Begin<label>` / `End<label>` timestamp keys
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ingress => "Ingress",
            Self::Dispatch => "Dispatch",
            Self::Transcription => "Transcription",
            Self::Tagging => "Tagging",
            Self::TaggingQa => "TaggingQA",
            Self::Completion => "Completion",
        }
    }

    /// Prefix of the per-stage environment variables
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Ingress => "INGRESS",
            Self::Dispatch => "DISPATCH",
            Self::Transcription => "TRANSCRIPTION",
            Self::Tagging => "TAGGING",
            Self::TaggingQa => "TAGGING_QA",
            Self::Completion => "COMPLETION",
        }
    }

    pub fn begin_key(&self) -> String {
        format!("Begin{}", self.label())
    }

    pub fn end_key(&self) -> String {
        format!("End{}", self.label())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal response emitted by the completion stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRequest {
    pub request_id: Uuid,
    pub customer_id: Option<i64>,
    pub media_uri: Option<String>,
    pub accepted_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub transcript: String,
}

/// What the worker does with the record once the stage succeeded
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Enqueue the record to the next stage
    Forward,
    /// Terminal state reached; reply with this body
    Complete(CompletedRequest),
}

/// Stage-specific work applied to a decoded, validated record
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn process(&self, record: &mut RequestRecord) -> Result<StageOutput>;
}
