//! Speech recognition
//!
//! The transcription stage submits a long-running recognition request built
//! from a fixed phone-call policy and waits for its results.

mod speech;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Settings;
use crate::error::Result;
use crate::pipeline::{RecognitionResult, MAX_ALTERNATIVES};

pub use speech::SpeechClient;

/// Class tokens that bias recognition towards call-centre vocabulary
pub const PHONE_CALL_PHRASES: [&str; 4] = ["$MONEY", "$MONTH", "$POSTALCODE", "$FULLPHONENUM"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionConfig {
    pub language_code: String,
    pub use_enhanced: bool,
    pub model: String,
    pub enable_automatic_punctuation: bool,
    pub diarization_config: DiarizationConfig,
    pub max_alternatives: u32,
    pub speech_contexts: Vec<SpeechContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiarizationConfig {
    pub enable_speaker_diarization: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechContext {
    pub phrases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionAudio {
    pub uri: String,
}

/// Long-running recognition request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionRequest {
    pub config: RecognitionConfig,
    pub audio: RecognitionAudio,
}

impl RecognitionRequest {
    /// Policy for recorded phone calls. Encoding and sample rate are left
    /// for the service to infer from the MP3 container.
    pub fn phone_call(uri: &str) -> Self {
        Self {
            config: RecognitionConfig {
                language_code: "en-US".to_string(),
                use_enhanced: true,
                model: "phone_call".to_string(),
                enable_automatic_punctuation: true,
                diarization_config: DiarizationConfig {
                    enable_speaker_diarization: true,
                },
                max_alternatives: MAX_ALTERNATIVES as u32,
                speech_contexts: vec![SpeechContext {
                    phrases: PHONE_CALL_PHRASES.iter().map(|p| p.to_string()).collect(),
                }],
            },
            audio: RecognitionAudio {
                uri: uri.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit the request and wait for the operation to finish
    async fn recognize(&self, request: &RecognitionRequest) -> Result<Vec<RecognitionResult>>;
}

/// Build a recognizer from runtime settings.
pub fn build_recognizer(settings: &Settings) -> anyhow::Result<Arc<dyn Recognizer>> {
    match settings.recognition.provider.to_lowercase().as_str() {
        "google" => Ok(Arc::new(SpeechClient::from_settings(settings)?)),
        other => anyhow::bail!(
            "Unsupported recognition.provider '{}'. Supported providers: google",
            other
        ),
    }
}
