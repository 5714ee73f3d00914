//! Word stream to speaker-attributed transcript

use serde::{Deserialize, Serialize};

/// Number of alternatives requested beyond the primary one.
pub const MAX_ALTERNATIVES: usize = 2;

/// Separator between utterances inside a working transcript.
pub const SOFT_SEPARATOR: char = '|';

/// A recognized word with its diarization tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordInfo {
    pub word: String,

    /// 1-based speaker number; 0 when the recognizer did not attribute the word
    pub speaker_tag: u32,
}

impl WordInfo {
    pub fn new(word: impl Into<String>, speaker_tag: u32) -> Self {
        Self {
            word: word.into(),
            speaker_tag,
        }
    }
}

/// One candidate transcription for a result segment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionAlternative {
    pub transcript: String,
    pub confidence: f32,
    pub words: Vec<WordInfo>,
}

/// One recognized segment with its ranked alternatives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub alternatives: Vec<RecognitionAlternative>,
}

/// Group a word stream into one line per speaker run.
///
/// Each line starts with `[Speaker <n>]`. A line closed by a speaker change
/// ends with the soft separator; the last line ends with `\n`. No words, no
/// lines. Unattributed words (tag 0) stay with the current speaker.
pub fn words_to_attributed_strings(words: &[WordInfo]) -> Vec<String> {
    let mut lines = Vec::new();
    if words.is_empty() {
        return lines;
    }

    let mut speaker = 1;
    let mut current = format!("[Speaker {}]", speaker);

    for word in words {
        if word.speaker_tag != 0 && word.speaker_tag != speaker {
            current.push(SOFT_SEPARATOR);
            lines.push(current);
            speaker = word.speaker_tag;
            current = format!("[Speaker {}]", speaker);
        }
        current.push(' ');
        current.push_str(&word.word);
    }

    current.push('\n');
    lines.push(current);
    lines
}

/// Per-alternative transcript assembled from recognition results.
///
/// Index `a` of every vector holds alternative `a` accumulated across all
/// results; only indices `0..=MAX_ALTERNATIVES` exist. Words of a diarized
/// response come from its trailing speaker-tagged result alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub raw_transcript: Vec<String>,
    pub raw_confidence: Vec<f32>,
    pub raw_words: Vec<Vec<WordInfo>>,
    pub attributed_strings: Vec<Vec<String>>,
}

fn has_speaker_tags(result: &RecognitionResult) -> bool {
    result
        .alternatives
        .iter()
        .flat_map(|alternative| &alternative.words)
        .any(|word| word.speaker_tag != 0)
}

/// Split off the trailing diarization result, if the response has one.
///
/// With diarization enabled the recognizer answers with untagged per-segment
/// results followed by one result repeating every word with its speaker tag.
fn split_diarized(results: &[RecognitionResult]) -> (&[RecognitionResult], &[RecognitionResult]) {
    match results.split_last() {
        Some((last, segments))
            if !segments.is_empty()
                && has_speaker_tags(last)
                && !segments.iter().any(has_speaker_tags) =>
        {
            (segments, std::slice::from_ref(last))
        }
        _ => (results, results),
    }
}

impl Transcript {
    pub fn from_results(results: &[RecognitionResult]) -> Self {
        let slots = MAX_ALTERNATIVES + 1;
        let mut raw_transcript = vec![String::new(); slots];
        let mut confidence_sum = vec![0.0f32; slots];
        let mut confidence_count = vec![0u32; slots];
        let mut raw_words: Vec<Vec<WordInfo>> = vec![Vec::new(); slots];

        let (segments, word_source) = split_diarized(results);

        for result in segments {
            for (index, alternative) in result.alternatives.iter().take(slots).enumerate() {
                raw_transcript[index].push_str(&alternative.transcript);
                confidence_sum[index] += alternative.confidence;
                confidence_count[index] += 1;
            }
        }

        for result in word_source {
            for (index, alternative) in result.alternatives.iter().take(slots).enumerate() {
                raw_words[index].extend(alternative.words.iter().cloned());
            }
        }

        let raw_confidence = confidence_sum
            .iter()
            .zip(&confidence_count)
            .map(|(sum, count)| if *count == 0 { 0.0 } else { sum / *count as f32 })
            .collect();

        let attributed_strings = raw_words
            .iter()
            .map(|words| words_to_attributed_strings(words))
            .collect();

        Self {
            raw_transcript,
            raw_confidence,
            raw_words,
            attributed_strings,
        }
    }

    /// Primary alternative's utterances concatenated without separator.
    pub fn working_transcript(&self) -> String {
        self.attributed_strings
            .first()
            .map(|lines| lines.concat())
            .unwrap_or_default()
    }

    pub fn word_count(&self) -> usize {
        self.raw_words.first().map(Vec::len).unwrap_or(0)
    }
}
