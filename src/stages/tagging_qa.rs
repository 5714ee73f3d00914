use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::pipeline::{reorg_matched_tags, RequestRecord, Stage, StageKind, StageOutput};

/// Collapses quote-keyed findings to the best tag per info type
pub struct TaggingQaStage;

#[async_trait]
impl Stage for TaggingQaStage {
    fn kind(&self) -> StageKind {
        StageKind::TaggingQa
    }

    async fn process(&self, record: &mut RequestRecord) -> Result<StageOutput> {
        let before = record.matched_tags.len();
        reorg_matched_tags(record);
        info!(
            request_id = %record.request_id,
            candidates = before,
            kept = record.matched_tags.len(),
            "Tags reorganized"
        );
        Ok(StageOutput::Forward)
    }
}
