//! ============================================================================
//! AICOOK-CORE: Preference memory for a personal assistant
//! ============================================================================
//! This crate handles all backend logic for the AICOOK assistant:
//! - Chat completions over an OpenAI-compatible API (Gemini by default)
//! - Fact extraction, dedup and storage in an embedded redb store or Qdrant
//! - Semantic recall injected before every model call
//! - Session orchestration with background extraction
//! ============================================================================

pub mod config;
pub mod llm;
pub mod memory;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::MemoryConfig;
pub use llm::{ChatClient, GenerationOptions, TextGenerator};
pub use memory::MemoryManager;
pub use session::{Session, TurnReply};
pub use types::*;
