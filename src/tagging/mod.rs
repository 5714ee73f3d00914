//! Sensitive-information tagging
//!
//! A classifier inspects the working transcript and returns candidate tags
//! keyed by the quoted substring.

mod dlp;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Settings;
use crate::error::Result;
use crate::pipeline::MatchedTag;

pub use dlp::{likelihood_level, DlpClient};

#[async_trait]
pub trait TagClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote-keyed findings for `text`
    async fn classify(&self, text: &str) -> Result<BTreeMap<String, MatchedTag>>;
}

/// Classifier that never finds anything
pub struct NoopClassifier;

#[async_trait]
impl TagClassifier for NoopClassifier {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn classify(&self, _text: &str) -> Result<BTreeMap<String, MatchedTag>> {
        Ok(BTreeMap::new())
    }
}

/// Insert a finding, keeping the more likely tag when a quote repeats
pub fn insert_finding(tags: &mut BTreeMap<String, MatchedTag>, tag: MatchedTag) {
    match tags.get(&tag.quote) {
        Some(existing) if existing.likelihood >= tag.likelihood => {}
        _ => {
            tags.insert(tag.quote.clone(), tag);
        }
    }
}

/// Build a classifier from runtime settings.
pub fn build_classifier(settings: &Settings) -> anyhow::Result<Arc<dyn TagClassifier>> {
    match settings.tagging.provider.to_lowercase().as_str() {
        "dlp" => Ok(Arc::new(DlpClient::from_settings(settings)?)),
        "none" => Ok(Arc::new(NoopClassifier)),
        other => anyhow::bail!(
            "Unsupported tagging.provider '{}'. Supported providers: dlp, none",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(quote: &str, likelihood: u8) -> MatchedTag {
        MatchedTag {
            quote: quote.to_string(),
            info_type: "PERSON_NAME".to_string(),
            likelihood,
            begin_byte_offset: 0,
            end_byte_offset: quote.len() as i64,
        }
    }

    #[test]
    fn repeated_quote_keeps_most_likely() {
        let mut tags = BTreeMap::new();
        insert_finding(&mut tags, tag("Michael", 3));
        insert_finding(&mut tags, tag("Michael", 5));
        insert_finding(&mut tags, tag("Michael", 4));

        assert_eq!(tags.len(), 1);
        assert_eq!(tags["Michael"].likelihood, 5);
    }

    #[tokio::test]
    async fn none_provider_finds_nothing() {
        let mut settings = Settings::default();
        settings.tagging.provider = "none".to_string();

        let classifier = build_classifier(&settings).unwrap();
        assert!(classifier.classify("call me at 555").await.unwrap().is_empty());
    }

    #[test]
    fn unsupported_provider_returns_error() {
        let mut settings = Settings::default();
        settings.tagging.provider = "regex".to_string();

        let err = match build_classifier(&settings) {
            Ok(_) => panic!("expected classifier creation to fail"),
            Err(e) => e.to_string(),
        };
        assert!(err.contains("Unsupported tagging.provider"));
    }
}
