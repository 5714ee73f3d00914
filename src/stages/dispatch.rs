use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::pipeline::{RequestRecord, Stage, StageKind, StageOutput};

/// First internal hop. Forwards the record unchanged; where it goes next is
/// decided by the stage's configured route.
pub struct DispatchStage;

#[async_trait]
impl Stage for DispatchStage {
    fn kind(&self) -> StageKind {
        StageKind::Dispatch
    }

    async fn process(&self, record: &mut RequestRecord) -> Result<StageOutput> {
        debug!(
            request_id = %record.request_id,
            customer_id = ?record.customer_id,
            "Dispatching request"
        );
        Ok(StageOutput::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_passes_through_untouched() {
        let original = RequestRecord::accept(5, "gs://b/a.mp3".to_string());
        let mut record = original.clone();

        let output = DispatchStage.process(&mut record).await.unwrap();

        assert_eq!(output, StageOutput::Forward);
        assert_eq!(record, original);
    }
}
