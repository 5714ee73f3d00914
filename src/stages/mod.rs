//! Stage implementations
//!
//! Every internal stage implements [`Stage`] and is driven by the generic
//! task worker. Ingress is the exception: it serves the client API.

pub mod completion;
pub mod dispatch;
pub mod ingress;
pub mod tagging;
pub mod tagging_qa;
pub mod transcription;

use std::sync::Arc;

use anyhow::Result;

use crate::config::Settings;
use crate::pipeline::{Stage, StageKind};
use crate::recognition::build_recognizer;
use crate::tagging::build_classifier;

pub use completion::{finalize, CompletionStage};
pub use dispatch::DispatchStage;
pub use ingress::{IngressService, SubmitRequest, SubmitResponse};
pub use tagging::TaggingStage;
pub use tagging_qa::TaggingQaStage;
pub use transcription::{validate_media_uri, TranscriptionStage};

/// Build the stage-specific work for a task worker
pub fn build_stage(kind: StageKind, settings: &Settings) -> Result<Arc<dyn Stage>> {
    let stage: Arc<dyn Stage> = match kind {
        StageKind::Ingress => {
            anyhow::bail!("The ingress stage serves the request API, not a task handler")
        }
        StageKind::Dispatch => Arc::new(DispatchStage),
        StageKind::Transcription => Arc::new(TranscriptionStage::new(
            build_recognizer(settings)?,
            settings.recognition_deadline(),
        )),
        StageKind::Tagging => Arc::new(TaggingStage::new(build_classifier(settings)?)),
        StageKind::TaggingQa => Arc::new(TaggingQaStage),
        StageKind::Completion => Arc::new(CompletionStage),
    };
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_report_their_kind() {
        let mut settings = Settings::default();
        settings.tagging.provider = "none".to_string();

        for kind in [
            StageKind::Dispatch,
            StageKind::Tagging,
            StageKind::TaggingQa,
            StageKind::Completion,
        ] {
            assert_eq!(build_stage(kind, &settings).unwrap().kind(), kind);
        }
        assert!(build_stage(StageKind::Ingress, &settings).is_err());
    }
}
