//! ============================================================================
//! Session - One conversation with memory around every turn
//! ============================================================================
//! Before each model call the session recalls relevant facts and injects
//! them as a "Relevant memories" message. After the user's message is
//! recorded, extraction runs in the background; the reply never waits on it.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::llm::{GenerationOptions, TextGenerator};
use crate::memory::{
    format_memories_for_prompt, Fact, FactQuery, MemoryManager, RememberOutcome,
};
use crate::types::{ChatMessage, LlmError};

pub const SYSTEM_PROMPT: &str = "You are AICOOK, a personal AI assistant with memory capabilities. \
When a message starts with \"Relevant memories:\", it lists facts you learned about the user in \
earlier conversations. Use them to personalize your answer without repeating them back verbatim.";

pub const GREETING: &str =
    "I am AICOOK, your personal AI assistant. I can learn from our interactions. How can I help you today?";

/// The assistant's answer to one turn
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    /// Facts injected before the user's message, best first
    pub recalled: Vec<String>,
}

pub struct Session {
    generator: Arc<dyn TextGenerator>,
    memory: Option<Arc<MemoryManager>>,
    scope: String,
    history: Vec<ChatMessage>,
    options: GenerationOptions,
    recall_k: usize,
    pending: JoinSet<RememberOutcome>,
}

impl Session {
    /// `memory: None` runs the conversation without recall or extraction
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        memory: Option<Arc<MemoryManager>>,
        scope: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        let recall_k = memory.as_ref().map(|m| m.default_k()).unwrap_or(0);
        Self {
            generator,
            memory,
            scope: scope.into(),
            history: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::assistant(GREETING),
            ],
            options,
            recall_k,
            pending: JoinSet::new(),
        }
    }

    /// Session for the configured scope; memory is dropped when disabled
    pub fn from_config(
        config: &MemoryConfig,
        generator: Arc<dyn TextGenerator>,
        memory: Option<Arc<MemoryManager>>,
    ) -> Self {
        let options = GenerationOptions {
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
        };
        let memory = memory.filter(|_| config.enable_memory);
        Self::new(generator, memory, config.scope.clone(), options)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Extractions still running
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Answer one user message.
    ///
    /// Memory problems never fail the turn; only the reply generation can.
    /// On failure the history is left as it was before the call.
    pub async fn turn(&mut self, input: &str) -> Result<TurnReply, LlmError> {
        self.reap();
        let rollback = self.history.len();

        let recalled = self.recall(input).await;
        let texts: Vec<String> = recalled.iter().map(|f| f.text.clone()).collect();
        if let Some(block) = format_memories_for_prompt(&recalled) {
            debug!("Injecting {} memories", recalled.len());
            self.history.push(ChatMessage::user(block));
        }
        self.history.push(ChatMessage::user(input));

        if let Some(memory) = &self.memory {
            let memory = memory.clone();
            let scope = self.scope.clone();
            let utterance = input.to_string();
            self.pending
                .spawn(async move { memory.observe(&scope, &utterance).await });
        }

        match self.generator.generate(&self.history, self.options).await {
            Ok(text) => {
                self.history.push(ChatMessage::assistant(text.as_str()));
                Ok(TurnReply {
                    text,
                    recalled: texts,
                })
            }
            Err(e) => {
                self.history.truncate(rollback);
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for pending extractions, then abandon the rest.
    /// Returns how many finished.
    pub async fn drain(&mut self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut finished = 0;

        loop {
            match tokio::time::timeout_at(deadline, self.pending.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    log_outcome(&outcome);
                    finished += 1;
                }
                Ok(Some(Err(e))) => warn!("Extraction task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Abandoning {} pending extractions after {:?}",
                        self.pending.len(),
                        timeout
                    );
                    self.pending.shutdown().await;
                    break;
                }
            }
        }
        finished
    }

    async fn recall(&self, input: &str) -> Vec<Fact> {
        let Some(memory) = &self.memory else {
            return vec![];
        };
        match memory
            .recall_scored(&self.scope, &FactQuery::new(input, self.recall_k))
            .await
        {
            Ok(results) => results.into_iter().map(|r| r.fact).collect(),
            Err(e) => {
                warn!("Recall degraded to no memories: {}", e);
                vec![]
            }
        }
    }

    /// Collect extractions that already finished
    fn reap(&mut self) {
        while let Some(result) = self.pending.try_join_next() {
            match result {
                Ok(outcome) => log_outcome(&outcome),
                Err(e) => warn!("Extraction task failed: {}", e),
            }
        }
    }
}

fn log_outcome(outcome: &RememberOutcome) {
    match outcome {
        RememberOutcome::Stored(id) => info!("Remembered new fact {}", id),
        RememberOutcome::Duplicate(id) => debug!("Fact already known as {}", id),
        RememberOutcome::NoFact => {}
        RememberOutcome::Degraded(e) => warn!("Extraction skipped: {}", e),
    }
}
