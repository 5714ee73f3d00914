//! Speech-to-text stage
//!
//! Validates the media reference, runs a long-running recognition bounded by
//! the task deadline and turns the results into the speaker-attributed
//! working transcript.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::{RequestRecord, Stage, StageKind, StageOutput, Transcript};
use crate::recognition::{RecognitionRequest, Recognizer};

const MEDIA_SCHEME: &str = "gs://";
const SUPPORTED_EXTENSION: &str = ".mp3";

/// Accept only `gs://` references to MP3 files
pub fn validate_media_uri(uri: &str) -> Result<()> {
    if uri.len() < 5 || !uri.starts_with(MEDIA_SCHEME) {
        return Err(PipelineError::media_unsupported(format!(
            "media uri must start with {}: {}",
            MEDIA_SCHEME, uri
        )));
    }

    let has_supported_extension = uri
        .rfind('.')
        .map(|dot| uri[dot..].eq_ignore_ascii_case(SUPPORTED_EXTENSION))
        .unwrap_or(false);
    if !has_supported_extension {
        return Err(PipelineError::media_unsupported(format!(
            "media must be {}: {}",
            SUPPORTED_EXTENSION, uri
        )));
    }

    Ok(())
}

pub struct TranscriptionStage {
    recognizer: Arc<dyn Recognizer>,
    deadline: Duration,
}

impl TranscriptionStage {
    pub fn new(recognizer: Arc<dyn Recognizer>, deadline: Duration) -> Self {
        Self {
            recognizer,
            deadline,
        }
    }
}

#[async_trait]
impl Stage for TranscriptionStage {
    fn kind(&self) -> StageKind {
        StageKind::Transcription
    }

    async fn process(&self, record: &mut RequestRecord) -> Result<StageOutput> {
        let uri = record
            .media_uri
            .as_deref()
            .ok_or_else(|| PipelineError::validation("media_uri is required"))?;
        validate_media_uri(uri)?;

        let request = RecognitionRequest::phone_call(uri);
        let results = tokio::time::timeout(self.deadline, self.recognizer.recognize(&request))
            .await
            .map_err(|_| PipelineError::DeadlineExceeded {
                action: format!("waiting for {} recognition", self.recognizer.name()),
                after: self.deadline,
            })??;

        let transcript = Transcript::from_results(&results);
        if transcript.word_count() == 0 {
            return Err(PipelineError::permanent(format!(
                "recognition returned no words for {}",
                uri
            )));
        }

        record.working_transcript = Some(transcript.working_transcript());
        info!(
            request_id = %record.request_id,
            words = transcript.word_count(),
            confidence = transcript.raw_confidence[0],
            transcript = %record.transcript_preview(120),
            "Transcription complete"
        );

        Ok(StageOutput::Forward)
    }
}
