//! ============================================================================
//! Fact Extractor - Turns user utterances into canonical facts
//! ============================================================================
//! Classification sits behind the `FactClassifier` port:
//! - `LlmClassifier`: fixed instruction template sent to the chat API
//! - `HeuristicClassifier`: local sentence patterns, no network call
//!
//! The extractor never fails the turn. Timeouts, unreachable services and
//! unparsable answers all come back as `Extraction::Unavailable`.
//! ============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::canonical::{is_canonical, normalize, split_sentences, third_person, MAX_FACT_LEN};
use super::embeddings::Embedder;
use super::types::{Extraction, Fact};
use crate::config::{ClassifierKind, MemoryConfig};
use crate::llm::{GenerationOptions, TextGenerator};
use crate::types::{ChatMessage, MemoryError};

/// Sentinel the classifier answers with when no fact is present
pub const NO_FACT_SENTINEL: &str = "NONE";

const CLASSIFIER_PROMPT: &str = r#"You maintain a long-term memory of durable facts about the user.

Decide whether the user's message states a durable preference or attribute about themselves: their name, likes, dislikes, habits, tools or languages they use, dietary needs, or long-term goals.

If it does, reduce it to ONE short canonical sentence in the third person that starts with "User", for example:
User prefers Python language
User's name is Alice
User dislikes seafood

If it does not (questions, requests, small talk, temporary moods), respond with exactly NONE.

Respond with the sentence or NONE and nothing else."#;

/// Decides whether an utterance holds a durable fact and reduces it
#[async_trait]
pub trait FactClassifier: Send + Sync {
    /// `Ok(Some(sentence))` with a canonical sentence, `Ok(None)` for no fact
    async fn classify(&self, utterance: &str) -> Result<Option<String>, MemoryError>;
}

// ============================================================================
// LLM-backed classifier
// ============================================================================

pub struct LlmClassifier {
    generator: Arc<dyn TextGenerator>,
}

impl LlmClassifier {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl FactClassifier for LlmClassifier {
    async fn classify(&self, utterance: &str) -> Result<Option<String>, MemoryError> {
        let messages = [
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(utterance),
        ];
        let options = GenerationOptions {
            temperature: Some(0.0),
            max_tokens: Some(64),
        };

        let response = self
            .generator
            .generate(&messages, options)
            .await
            .map_err(|e| MemoryError::ExtractionUnavailable(e.to_string()))?;

        parse_classification(&response)
    }
}

/// Parse the classifier's answer into "no fact" or one canonical sentence
pub fn parse_classification(response: &str) -> Result<Option<String>, MemoryError> {
    let lines: Vec<&str> = response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .collect();

    let line = match lines.as_slice() {
        [single] => *single,
        [] => {
            return Err(MemoryError::MalformedExtraction(
                "empty classifier response".into(),
            ))
        }
        _ => {
            return Err(MemoryError::MalformedExtraction(format!(
                "expected one line, got {}",
                lines.len()
            )))
        }
    };

    let sentence = normalize(line);
    if sentence.eq_ignore_ascii_case(NO_FACT_SENTINEL) {
        return Ok(None);
    }
    if is_canonical(&sentence) {
        return Ok(Some(sentence));
    }

    Err(MemoryError::MalformedExtraction(format!(
        "not a canonical fact: {}",
        preview(line)
    )))
}

// ============================================================================
// Local pattern classifier
// ============================================================================

/// Pattern classifier for durable self-descriptions.
///
/// Only sentence-initial statements count, so "what should I use?" or
/// "can you tell me what I like" never produce a fact.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

/// (sentence prefix, canonical verb phrase)
const STATEMENT_PATTERNS: &[(&str, &str)] = &[
    ("my name is ", "User's name is"),
    ("call me ", "User's name is"),
    ("i prefer ", "User prefers"),
    ("i really like ", "User likes"),
    ("i like ", "User likes"),
    ("i love ", "User loves"),
    ("i enjoy ", "User enjoys"),
    ("i hate ", "User hates"),
    ("i dislike ", "User dislikes"),
    ("i don't like ", "User dislikes"),
    ("i do not like ", "User dislikes"),
    ("i'm allergic to ", "User is allergic to"),
    ("i am allergic to ", "User is allergic to"),
    ("i'm vegetarian", "User is vegetarian"),
    ("i am vegetarian", "User is vegetarian"),
    ("i'm vegan", "User is vegan"),
    ("i am vegan", "User is vegan"),
    ("i always use ", "User always uses"),
    ("i use ", "User uses"),
    ("i work as ", "User works as"),
    ("i live in ", "User lives in"),
];

const FILLERS: &[&str] = &[
    "just so you know",
    "please remember that",
    "remember that",
    "by the way",
    "actually",
    "also",
    "and",
    "btw",
    "fyi",
    "note that",
    "well",
    "oh",
    "so",
];

const FAVORITE_MARKERS: &[&str] = &[" is my favorite ", " is my favourite "];
const MY_FAVORITE: &[&str] = &["my favorite ", "my favourite "];

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Reduce the first self-descriptive sentence of `content`
    pub fn reduce(&self, content: &str) -> Option<String> {
        split_sentences(content)
            .into_iter()
            .filter(|s| !s.ends_with('?'))
            .find_map(reduce_sentence)
    }
}

#[async_trait]
impl FactClassifier for HeuristicClassifier {
    async fn classify(&self, utterance: &str) -> Result<Option<String>, MemoryError> {
        Ok(self.reduce(utterance))
    }
}

fn reduce_sentence(sentence: &str) -> Option<String> {
    let trimmed = sentence
        .trim()
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '\n'));
    let sentence = strip_fillers(trimmed);
    if sentence.is_empty() {
        return None;
    }
    // ASCII lowercasing keeps byte offsets aligned with `sentence`
    let lower = sentence.to_ascii_lowercase();

    for (pattern, verb) in STATEMENT_PATTERNS {
        if let Some(rest) = lower.strip_prefix(pattern) {
            let object = &sentence[sentence.len() - rest.len()..];
            if pattern.ends_with(' ') {
                return finish(verb, object);
            }
            // Complete statements ("i'm vegan") must end there
            if rest.trim().is_empty() {
                return Some(verb.to_string());
            }
        }
    }

    // "Python is my favorite language"
    for marker in FAVORITE_MARKERS {
        if let Some(pos) = lower.find(marker) {
            let subject = sentence[..pos].trim();
            let category = sentence[pos + marker.len()..].trim();
            if is_object(subject) && is_object(category) && !subject.contains(' ') {
                return finish(&format!("User's favorite {} is", third_person(category)), subject);
            }
        }
    }

    // "My favorite language is Python"
    for prefix in MY_FAVORITE {
        if let Some(rest) = lower.strip_prefix(prefix) {
            if let Some(pos) = rest.find(" is ") {
                let offset = sentence.len() - rest.len();
                let category = &sentence[offset..offset + pos];
                let object = &sentence[offset + pos + 4..];
                return finish(&format!("User's favorite {} is", category.trim()), object);
            }
        }
    }

    None
}

fn strip_fillers(mut sentence: &str) -> &str {
    'outer: loop {
        let lower = sentence.to_ascii_lowercase();
        for filler in FILLERS {
            let Some(rest) = lower.strip_prefix(filler) else {
                continue;
            };
            // Whole word only
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with(',') {
                sentence = sentence[filler.len()..].trim_start_matches(|c: char| c == ',' || c == ' ');
                continue 'outer;
            }
        }
        return sentence;
    }
}

fn is_object(text: &str) -> bool {
    !text.is_empty() && text.len() < MAX_FACT_LEN / 2 && text.chars().any(|c| c.is_alphanumeric())
}

fn finish(verb: &str, object: &str) -> Option<String> {
    let object = normalize(object);
    if !is_object(&object) {
        return None;
    }
    let sentence = format!("{} {}", verb, third_person(&object));
    is_canonical(&sentence).then_some(sentence)
}

/// Classifier selected by `FACT_CLASSIFIER`; the LLM one runs on `generator`
pub fn create_classifier(
    config: &MemoryConfig,
    generator: Arc<dyn TextGenerator>,
) -> Arc<dyn FactClassifier> {
    match config.classifier {
        ClassifierKind::Llm => Arc::new(LlmClassifier::new(generator)),
        ClassifierKind::Heuristic => {
            info!("Using local heuristic fact classifier");
            Arc::new(HeuristicClassifier)
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

// ============================================================================
// Extractor
// ============================================================================

/// Runs classification + embedding for one utterance, bounded by a timeout
pub struct FactExtractor {
    classifier: Arc<dyn FactClassifier>,
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl FactExtractor {
    pub fn new(
        classifier: Arc<dyn FactClassifier>,
        embedder: Arc<dyn Embedder>,
        timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            embedder,
            timeout,
        }
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model()
    }

    /// Classify `utterance` and, when it states a fact, embed the reduction.
    ///
    /// Does not write to any store.
    pub async fn extract(&self, scope: &str, utterance: &str) -> Extraction {
        if utterance.trim().is_empty() {
            return Extraction::NoFact;
        }

        let classified =
            match tokio::time::timeout(self.timeout, self.classifier.classify(utterance)).await {
                Ok(result) => result,
                Err(_) => Err(MemoryError::ExtractionUnavailable(format!(
                    "classification timed out after {:?}",
                    self.timeout
                ))),
            };

        let text = match classified {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!("No durable fact in utterance");
                return Extraction::NoFact;
            }
            Err(e) => {
                warn!("Fact extraction degraded: {}", e);
                return Extraction::Unavailable(e);
            }
        };

        // Any classifier behind the port must hand back a canonical reduction
        let text = normalize(&text);
        if !is_canonical(&text) {
            let e = MemoryError::MalformedExtraction(format!(
                "classifier returned a non-canonical fact: {}",
                preview(&text)
            ));
            warn!("Fact extraction degraded: {}", e);
            return Extraction::Unavailable(e);
        }

        let embedding =
            match tokio::time::timeout(self.timeout, self.embedder.embed_single(&text)).await {
                Ok(Ok(embedding)) if !embedding.is_empty() => embedding,
                Ok(Ok(_)) => {
                    return self.unavailable("embedding service returned an empty vector".into())
                }
                Ok(Err(e)) => return self.unavailable(e.to_string()),
                Err(_) => {
                    return self.unavailable(format!(
                        "embedding timed out after {:?}",
                        self.timeout
                    ))
                }
            };

        info!("Extracted fact for scope {}: {}", scope, text);
        Extraction::Fact(
            Fact::new(scope, text, utterance).with_embedding(embedding, self.embedder.model()),
        )
    }

    fn unavailable(&self, reason: String) -> Extraction {
        let e = MemoryError::ExtractionUnavailable(reason);
        warn!("Fact extraction degraded: {}", e);
        Extraction::Unavailable(e)
    }
}
