//! Request record carried between stages and persisted per request

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;
use validator::Validate;

use crate::error::{PipelineError, Result};

/// Exclusive upper bound for customer identifiers.
pub const MAX_CUSTOMER_ID: i64 = 10_000_000;

/// Status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Accepted and moving through the stages
    Pending,
    /// Terminated by a permanent failure
    Error,
    /// Final transcript written
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UTC instant serialized as RFC3339 with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn parse(s: &str) -> std::result::Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| Self(dt.with_timezone(&Utc)))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A sensitive-information finding attached to the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchedTag {
    /// Literal substring of the transcript
    pub quote: String,

    /// Category, e.g. `STREET_ADDRESS`
    pub info_type: String,

    /// Confidence level 1 (very unlikely) to 5 (very likely)
    pub likelihood: u8,

    pub begin_byte_offset: i64,

    pub end_byte_offset: i64,
}

/// A transcription request as it travels through the pipeline.
///
/// Every field except `request_id` is optional on the wire so a stage can
/// persist only the fields it owns; absent fields are preserved by the
/// repository's merge-write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RequestRecord {
    /// Assigned once at ingress; the nil UUID is never persisted
    #[serde(default)]
    pub request_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(required, range(min = 1, max = 9_999_999))]
    pub customer_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(required, url)]
    pub media_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,

    /// Upstream HTTP-like status code, set when the request fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_status: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,

    /// Speaker-attributed utterances joined by the `|` soft separator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_transcript: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,

    /// Stage-phase label (`BeginTranscription`, ...) to instant; write-once
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timestamps: BTreeMap<String, Timestamp>,

    /// Quote-keyed after tagging, info-type-keyed after tagging QA
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub matched_tags: BTreeMap<String, MatchedTag>,
}

impl RequestRecord {
    /// Create a freshly accepted request with a new identity
    pub fn accept(customer_id: i64, media_uri: String) -> Self {
        let now = Timestamp::now();
        Self {
            request_id: Uuid::new_v4(),
            customer_id: Some(customer_id),
            media_uri: Some(media_uri),
            status: Some(RequestStatus::Pending),
            accepted_at: Some(now),
            updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn has_zero_id(&self) -> bool {
        self.request_id.is_nil()
    }

    /// Record a stage-phase instant. Keys are write-once.
    pub fn set_timestamp(&mut self, key: impl Into<String>, at: Timestamp) -> Result<()> {
        let key = key.into();
        if self.timestamps.contains_key(&key) {
            return Err(PipelineError::TimestampKeyExists { key });
        }
        self.timestamps.insert(key, at);
        Ok(())
    }

    /// Check the record against its declared schema (customer range, URI form).
    pub fn validate_schema(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| PipelineError::validation(format!("invalid request record: {}", errors)))
    }

    /// Working transcript in single-line form, for log records.
    pub fn transcript_preview(&self, max_chars: usize) -> String {
        self.working_transcript
            .as_deref()
            .unwrap_or_default()
            .replace('\n', "|")
            .chars()
            .take(max_chars)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> RequestRecord {
        RequestRecord::accept(1_234_567, "gs://bucket/audio-01.mp3".to_string())
    }

    #[test]
    fn accepted_record_has_identity_and_pending_status() {
        let record = valid_record();
        assert!(!record.has_zero_id());
        assert_eq!(record.status, Some(RequestStatus::Pending));
        assert!(record.accepted_at.is_some());
        assert!(record.validate_schema().is_ok());
    }

    #[test]
    fn timestamp_keys_are_write_once() {
        let mut record = valid_record();
        record
            .set_timestamp("BeginTranscription", Timestamp::now())
            .unwrap();

        let err = record
            .set_timestamp("BeginTranscription", Timestamp::now())
            .unwrap_err();
        assert!(matches!(err, PipelineError::TimestampKeyExists { ref key } if key == "BeginTranscription"));
    }

    #[test]
    fn customer_id_range_is_enforced() {
        let mut record = valid_record();
        record.customer_id = Some(0);
        assert!(record.validate_schema().is_err());

        record.customer_id = Some(MAX_CUSTOMER_ID);
        assert!(record.validate_schema().is_err());

        record.customer_id = Some(MAX_CUSTOMER_ID - 1);
        assert!(record.validate_schema().is_ok());
    }

    #[test]
    fn media_uri_must_be_present_and_well_formed() {
        let mut record = valid_record();
        record.media_uri = Some("not a uri".to_string());
        assert!(record.validate_schema().is_err());

        record.media_uri = None;
        assert!(record.validate_schema().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{"request_id":"9b2f0a44-3c55-4b43-9d8e-2d0c6a0f1e11","customer_id":12,"priority":"high"}"#;
        let err = serde_json::from_str::<RequestRecord>(json).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn wire_format_uses_documented_field_names() {
        let mut record = valid_record();
        record.working_transcript = Some("[Speaker 1] hi\n".to_string());
        record
            .set_timestamp("BeginDispatch", Timestamp::now())
            .unwrap();

        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        for field in [
            "request_id",
            "customer_id",
            "media_uri",
            "status",
            "accepted_at",
            "updated_at",
            "working_transcript",
            "timestamps",
        ] {
            assert!(object.contains_key(field), "missing {}", field);
        }
        assert_eq!(object["status"], "PENDING");
        assert!(!object.contains_key("final_transcript"));
    }

    #[test]
    fn timestamps_serialize_with_nanoseconds() {
        let ts = Timestamp::parse("2024-03-01T10:15:30.5Z").unwrap();
        assert_eq!(ts.to_string(), "2024-03-01T10:15:30.500000000Z");

        let round: Timestamp = serde_json::from_str(&format!("\"{}\"", ts)).unwrap();
        assert_eq!(round, ts);
    }

    #[test]
    fn transcript_preview_stays_on_one_line() {
        let mut record = valid_record();
        record.working_transcript = Some("[Speaker 1] a|[Speaker 2] b\n".to_string());
        assert_eq!(record.transcript_preview(100), "[Speaker 1] a|[Speaker 2] b|");
        assert_eq!(record.transcript_preview(3), "[Sp");
    }
}
