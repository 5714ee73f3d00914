use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::{RequestRecord, Stage, StageKind, StageOutput};
use crate::tagging::TagClassifier;

/// Attaches quote-keyed sensitive-information findings to the record
pub struct TaggingStage {
    classifier: Arc<dyn TagClassifier>,
}

impl TaggingStage {
    pub fn new(classifier: Arc<dyn TagClassifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl Stage for TaggingStage {
    fn kind(&self) -> StageKind {
        StageKind::Tagging
    }

    async fn process(&self, record: &mut RequestRecord) -> Result<StageOutput> {
        let text = record
            .working_transcript
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PipelineError::permanent("working_transcript is required for tagging"))?;

        let tags = self.classifier.classify(text).await?;
        info!(
            request_id = %record.request_id,
            classifier = self.classifier.name(),
            findings = tags.len(),
            "Tagging complete"
        );

        record.matched_tags = tags;
        Ok(StageOutput::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MatchedTag;
    use std::collections::BTreeMap;

    struct StreetFinder;

    #[async_trait]
    impl TagClassifier for StreetFinder {
        fn name(&self) -> &'static str {
            "street"
        }

        async fn classify(&self, text: &str) -> Result<BTreeMap<String, MatchedTag>> {
            let mut tags = BTreeMap::new();
            if let Some(start) = text.find("123 Main Street") {
                tags.insert(
                    "123 Main Street".to_string(),
                    MatchedTag {
                        quote: "123 Main Street".to_string(),
                        info_type: "STREET_ADDRESS".to_string(),
                        likelihood: 4,
                        begin_byte_offset: start as i64,
                        end_byte_offset: (start + 15) as i64,
                    },
                );
            }
            Ok(tags)
        }
    }

    #[tokio::test]
    async fn findings_are_attached_by_quote() {
        let stage = TaggingStage::new(Arc::new(StreetFinder));
        let mut record = RequestRecord::accept(1, "gs://b/a.mp3".to_string());
        record.working_transcript = Some("[Speaker 1] I live at 123 Main Street\n".to_string());

        stage.process(&mut record).await.unwrap();

        let tag = &record.matched_tags["123 Main Street"];
        assert_eq!(tag.info_type, "STREET_ADDRESS");
        assert_eq!(tag.begin_byte_offset, 22);
    }

    #[tokio::test]
    async fn missing_transcript_is_rejected() {
        let stage = TaggingStage::new(Arc::new(StreetFinder));
        let mut record = RequestRecord::accept(1, "gs://b/a.mp3".to_string());

        let err = stage.process(&mut record).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(err.terminates_request());
    }
}
