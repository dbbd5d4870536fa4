//! Conversation context management: token estimation, window trimming,
//! compression into summaries and follow-up resolution.

pub mod resolver;
pub mod summarizer;
pub mod tokens;
pub mod window;

pub use resolver::{ReferenceResolver, ResolvedQuery, needs_resolution};
pub use summarizer::{ContextSummarizer, ContextSummary};
pub use tokens::estimate_tokens;
pub use window::{Compression, ContextWindowManager, TrimmedHistory};
