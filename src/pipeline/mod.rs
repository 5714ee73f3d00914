//! Pipeline domain model
//!
//! The request record that travels between stages, the transcript and tag
//! transformations applied to it, and the stage abstraction the HTTP worker
//! drives.

mod record;
mod stage;
mod tags;
mod transcript;

pub use record::{MatchedTag, RequestRecord, RequestStatus, Timestamp, MAX_CUSTOMER_ID};
pub use stage::{CompletedRequest, Stage, StageKind, StageOutput};
pub use tags::reorg_matched_tags;
pub use transcript::{
    words_to_attributed_strings, RecognitionAlternative, RecognitionResult, Transcript, WordInfo,
    MAX_ALTERNATIVES, SOFT_SEPARATOR,
};
