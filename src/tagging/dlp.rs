use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::pipeline::MatchedTag;
use crate::tagging::{insert_finding, TagClassifier};

const DEFAULT_DLP_ENDPOINT: &str = "https://dlp.googleapis.com/v2";

/// Likelihood name to level 1 (very unlikely) through 5 (very likely)
pub fn likelihood_level(name: &str) -> Option<u8> {
    match name {
        "VERY_UNLIKELY" => Some(1),
        "UNLIKELY" => Some(2),
        "POSSIBLE" => Some(3),
        "LIKELY" => Some(4),
        "VERY_LIKELY" => Some(5),
        _ => None,
    }
}

/// REST client for content inspection
pub struct DlpClient {
    http: Client,
    api_key: String,
    endpoint: String,
    parent: String,
    info_types: Vec<String>,
    min_likelihood: String,
    min_level: u8,
}

impl DlpClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let tagging = &settings.tagging;
        let api_key = tagging.api_key.trim().to_string();
        let endpoint = if tagging.endpoint.trim().is_empty() {
            DEFAULT_DLP_ENDPOINT.to_string()
        } else {
            tagging.endpoint.trim().trim_end_matches('/').to_string()
        };

        if api_key.is_empty() && endpoint == DEFAULT_DLP_ENDPOINT {
            anyhow::bail!(
                "DLP API key is missing. Set tagging.api_key in config or CALLSCRIBE_DLP_API_KEY."
            );
        }
        if settings.general.project_id.trim().is_empty() {
            anyhow::bail!(
                "Cloud project is missing. Set general.project_id in config or CALLSCRIBE_PROJECT_ID."
            );
        }

        let min_likelihood = tagging.min_likelihood.trim().to_uppercase();
        let min_level = likelihood_level(&min_likelihood).with_context(|| {
            format!(
                "Invalid tagging.min_likelihood '{}'. Use VERY_UNLIKELY, UNLIKELY, POSSIBLE, LIKELY or VERY_LIKELY",
                tagging.min_likelihood
            )
        })?;

        Ok(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(45))
                .build()
                .context("Failed to build DLP HTTP client")?,
            api_key,
            endpoint,
            parent: format!(
                "projects/{}/locations/{}",
                settings.general.project_id.trim(),
                settings.general.region.trim()
            ),
            info_types: tagging.info_types.clone(),
            min_likelihood,
            min_level,
        })
    }

    fn request_url(&self) -> String {
        let url = format!("{}/{}/content:inspect", self.endpoint, self.parent);
        if self.api_key.is_empty() {
            url
        } else {
            format!("{}?key={}", url, self.api_key)
        }
    }
}

#[async_trait]
impl TagClassifier for DlpClient {
    fn name(&self) -> &'static str {
        "dlp"
    }

    async fn classify(&self, text: &str) -> Result<BTreeMap<String, MatchedTag>> {
        let body = InspectContentRequest {
            item: ContentItem {
                value: text.to_string(),
            },
            inspect_config: InspectConfig {
                info_types: self
                    .info_types
                    .iter()
                    .map(|name| InfoType { name: name.clone() })
                    .collect(),
                min_likelihood: self.min_likelihood.clone(),
                include_quote: true,
            },
        };

        let response = self
            .http
            .post(self.request_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transient("DLP request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("DLP returned {}: {}", status, body.trim());
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => PipelineError::permanent(message),
                _ => PipelineError::ExternalTransient {
                    message,
                    cause: None,
                },
            });
        }

        let payload: InspectContentResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::transient("failed to parse DLP response", e))?;

        let mut tags = BTreeMap::new();
        for finding in payload.result.findings {
            let Some(level) = likelihood_level(&finding.likelihood) else {
                continue;
            };
            if level < self.min_level || finding.quote.is_empty() {
                continue;
            }
            let range = finding.location.byte_range;
            insert_finding(
                &mut tags,
                MatchedTag {
                    quote: finding.quote,
                    info_type: finding.info_type.name,
                    likelihood: level,
                    begin_byte_offset: range.start,
                    end_byte_offset: range.end,
                },
            );
        }

        Ok(tags)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectContentRequest {
    item: ContentItem,
    inspect_config: InspectConfig,
}

#[derive(Debug, Serialize)]
struct ContentItem {
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectConfig {
    info_types: Vec<InfoType>,
    min_likelihood: String,
    include_quote: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InfoType {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectContentResponse {
    #[serde(default)]
    result: InspectResult,
}

#[derive(Debug, Default, Deserialize)]
struct InspectResult {
    #[serde(default)]
    findings: Vec<Finding>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Finding {
    #[serde(default)]
    quote: String,
    #[serde(default)]
    info_type: InfoType,
    #[serde(default)]
    likelihood: String,
    #[serde(default)]
    location: Location,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Location {
    #[serde(default)]
    byte_range: ByteRange,
}

/// int64 fields arrive as JSON strings; zero values are omitted.
#[derive(Debug, Default, Deserialize)]
struct ByteRange {
    #[serde(default, deserialize_with = "int64")]
    start: i64,
    #[serde(default, deserialize_with = "int64")]
    end: i64,
}

fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(i64),
        Text(String),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Number(n) => Ok(n),
        Wire::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
