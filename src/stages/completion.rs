use async_trait::async_trait;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::{
    CompletedRequest, RequestRecord, RequestStatus, Stage, StageKind, StageOutput, Timestamp,
    SOFT_SEPARATOR,
};

/// Turn the working transcript into the final, newline-separated text and
/// mark the request completed.
pub fn finalize(record: &mut RequestRecord) -> Result<CompletedRequest> {
    let working = record
        .working_transcript
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PipelineError::permanent("working_transcript is required for completion"))?;

    let final_transcript = working.replace(SOFT_SEPARATOR, "\n");
    let completed_at = Timestamp::now();

    record.final_transcript = Some(final_transcript.clone());
    record.completed_at = Some(completed_at);
    record.status = Some(RequestStatus::Completed);

    Ok(CompletedRequest {
        request_id: record.request_id,
        customer_id: record.customer_id,
        media_uri: record.media_uri.clone(),
        accepted_at: record.accepted_at,
        completed_at: Some(completed_at),
        transcript: final_transcript,
    })
}

pub struct CompletionStage;

#[async_trait]
impl Stage for CompletionStage {
    fn kind(&self) -> StageKind {
        StageKind::Completion
    }

    async fn process(&self, record: &mut RequestRecord) -> Result<StageOutput> {
        let completed = finalize(record)?;
        info!(
            request_id = %record.request_id,
            customer_id = ?record.customer_id,
            "Request completed"
        );
        Ok(StageOutput::Complete(completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_separators_become_newlines() {
        let mut record = RequestRecord::accept(1, "gs://b/a.mp3".to_string());
        record.working_transcript = Some("A|B|C\n".to_string());

        let completed = finalize(&mut record).unwrap();

        assert_eq!(record.final_transcript.as_deref(), Some("A\nB\nC\n"));
        assert_eq!(record.status, Some(RequestStatus::Completed));
        assert!(record.completed_at.is_some());
        assert_eq!(completed.transcript, "A\nB\nC\n");
        assert_eq!(completed.completed_at, record.completed_at);
        assert_eq!(completed.accepted_at, record.accepted_at);
    }

    #[test]
    fn final_transcript_matches_working_transcript_rewrite() {
        let working = "[Speaker 1] Thank you|[Speaker 2] Hey Michael|[Speaker 1] Good\n";
        let mut record = RequestRecord::accept(1, "gs://b/a.mp3".to_string());
        record.working_transcript = Some(working.to_string());

        finalize(&mut record).unwrap();

        let final_transcript = record.final_transcript.unwrap();
        assert!(!final_transcript.contains('|'));
        assert_eq!(final_transcript, working.replace('|', "\n"));
    }

    #[test]
    fn nothing_to_finalize_is_rejected() {
        let mut record = RequestRecord::accept(1, "gs://b/a.mp3".to_string());
        let err = finalize(&mut record).unwrap_err();
        assert!(err.terminates_request());
        assert_eq!(record.status, Some(RequestStatus::Pending));
    }
}
