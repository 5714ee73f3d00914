use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::pipeline::{RecognitionAlternative, RecognitionResult, WordInfo};
use crate::recognition::{RecognitionRequest, Recognizer};

const DEFAULT_SPEECH_ENDPOINT: &str = "https://speech.googleapis.com/v1";

/// REST client for long-running speech recognition
pub struct SpeechClient {
    http: Client,
    api_key: String,
    endpoint: String,
    poll_interval: Duration,
}

impl SpeechClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.recognition.api_key.trim().to_string();
        let endpoint = if settings.recognition.endpoint.trim().is_empty() {
            DEFAULT_SPEECH_ENDPOINT.to_string()
        } else {
            settings
                .recognition
                .endpoint
                .trim()
                .trim_end_matches('/')
                .to_string()
        };

        if api_key.is_empty() && endpoint == DEFAULT_SPEECH_ENDPOINT {
            anyhow::bail!(
                "Speech API key is missing. Set recognition.api_key in config or CALLSCRIBE_SPEECH_API_KEY."
            );
        }

        Ok(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .context("Failed to build speech HTTP client")?,
            api_key,
            endpoint,
            poll_interval: Duration::from_millis(settings.recognition.poll_interval_ms.max(10)),
        })
    }

    fn url(&self, path: &str) -> String {
        if self.api_key.is_empty() {
            format!("{}/{}", self.endpoint, path)
        } else {
            format!("{}/{}?key={}", self.endpoint, path, self.api_key)
        }
    }

    async fn submit(&self, request: &RecognitionRequest) -> Result<Operation> {
        let response = self
            .http
            .post(self.url("speech:longrunningrecognize"))
            .json(request)
            .send()
            .await
            .map_err(|e| PipelineError::transient("speech request failed", e))?;

        read_operation(response).await
    }

    async fn poll(&self, name: &str) -> Result<Operation> {
        let response = self
            .http
            .get(self.url(&format!("operations/{}", name)))
            .send()
            .await
            .map_err(|e| PipelineError::transient("speech operation poll failed", e))?;

        read_operation(response).await
    }
}

async fn read_operation(response: reqwest::Response) -> Result<Operation> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(http_error(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| PipelineError::transient("failed to parse speech response", e))
}

/// Rejections of the request itself are permanent; auth, quota and server
/// faults are retried.
fn http_error(status: StatusCode, body: &str) -> PipelineError {
    let message = format!("speech service returned {}: {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => PipelineError::ExternalTransient {
            message,
            cause: None,
        },
        s if s.is_client_error() => PipelineError::permanent(message),
        _ => PipelineError::ExternalTransient {
            message,
            cause: None,
        },
    }
}

/// Canonical status codes that mean the request can never succeed
fn operation_error(status: &OperationStatus) -> PipelineError {
    let message = format!(
        "recognition failed with code {}: {}",
        status.code, status.message
    );
    match status.code {
        // INVALID_ARGUMENT, NOT_FOUND, FAILED_PRECONDITION, OUT_OF_RANGE
        3 | 5 | 9 | 11 => PipelineError::permanent(message),
        _ => PipelineError::ExternalTransient {
            message,
            cause: None,
        },
    }
}

#[async_trait]
impl Recognizer for SpeechClient {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn recognize(&self, request: &RecognitionRequest) -> Result<Vec<RecognitionResult>> {
        let mut operation = self.submit(request).await?;
        tracing::debug!(operation = %operation.name, uri = %request.audio.uri, "Recognition submitted");

        while !operation.done {
            tokio::time::sleep(self.poll_interval).await;
            operation = self.poll(&operation.name).await?;
        }

        if let Some(error) = &operation.error {
            return Err(operation_error(error));
        }

        let results = operation
            .response
            .map(|response| response.results)
            .unwrap_or_default();

        Ok(results.into_iter().map(RecognitionResult::from).collect())
    }
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationStatus>,
    #[serde(default)]
    response: Option<RecognizeResponse>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<SpeechResult>,
}

#[derive(Debug, Deserialize)]
struct SpeechResult {
    #[serde(default)]
    alternatives: Vec<SpeechAlternative>,
}

#[derive(Debug, Deserialize)]
struct SpeechAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<SpeechWord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeechWord {
    word: String,
    #[serde(default)]
    speaker_tag: u32,
}

impl From<SpeechResult> for RecognitionResult {
    fn from(result: SpeechResult) -> Self {
        Self {
            alternatives: result
                .alternatives
                .into_iter()
                .map(|alt| RecognitionAlternative {
                    transcript: alt.transcript,
                    confidence: alt.confidence,
                    words: alt
                        .words
                        .into_iter()
                        .map(|w| WordInfo::new(w.word, w.speaker_tag))
                        .collect(),
                })
                .collect(),
        }
    }
}
