//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use adaptrag_core::config::{ContextConfig, ContextStrategy};
use adaptrag_core::context::window::total_tokens;
use adaptrag_core::context::{ContextWindowManager, estimate_tokens};
use adaptrag_core::grading::should_rewrite;
use adaptrag_core::retrieval::{RrfConfig, reciprocal_rank_fusion};
use adaptrag_core::types::{
    ConversationMessage, DocumentSource, RetrievalGrade, RetrievedDocument, Role,
};

fn message(role: u8, content: String) -> ConversationMessage {
    match role % 3 {
        0 => ConversationMessage::user(content),
        1 => ConversationMessage::assistant(content),
        _ => ConversationMessage::system(content),
    }
}

fn history_strategy() -> impl Strategy<Value = Vec<ConversationMessage>> {
    prop::collection::vec((0u8..3, "[a-z 你好]{0,80}"), 0..40)
        .prop_map(|items| items.into_iter().map(|(r, c)| message(r, c)).collect())
}

fn strategy_strategy() -> impl Strategy<Value = ContextStrategy> {
    prop_oneof![
        Just(ContextStrategy::SlidingWindow),
        Just(ContextStrategy::TokenLimit),
        Just(ContextStrategy::Hybrid),
    ]
}

// --- Context window properties ---

proptest! {
    #[test]
    fn trimmed_conversation_never_starts_with_assistant(
        history in history_strategy(),
        strategy in strategy_strategy(),
        max_rounds in 1usize..8,
        max_tokens in 1usize..300,
        preserve in any::<bool>(),
    ) {
        let manager = ContextWindowManager::new(ContextConfig {
            strategy,
            max_rounds,
            max_tokens,
            preserve_system_prompt: preserve,
            ..Default::default()
        });
        let trimmed = manager.trim(&history);

        let first_conversational = trimmed
            .messages
            .iter()
            .find(|m| !(preserve && m.role == Role::System));
        if let Some(first) = first_conversational {
            prop_assert_ne!(first.role, Role::Assistant);
        }
        prop_assert!(trimmed.messages.len() <= history.len());
        prop_assert_eq!(trimmed.removed, history.len() - trimmed.messages.len());
    }

    #[test]
    fn token_bounded_strategies_respect_budget(
        history in history_strategy(),
        hybrid in any::<bool>(),
        max_tokens in 1usize..300,
    ) {
        let manager = ContextWindowManager::new(ContextConfig {
            strategy: if hybrid { ContextStrategy::Hybrid } else { ContextStrategy::TokenLimit },
            max_rounds: 10,
            max_tokens,
            ..Default::default()
        });
        let trimmed = manager.trim(&history);
        prop_assert!(trimmed.total_tokens <= max_tokens);
        prop_assert_eq!(trimmed.total_tokens, total_tokens(&trimmed.messages));
    }

    #[test]
    fn sliding_window_keeps_at_most_two_messages_per_round(
        history in history_strategy(),
        max_rounds in 1usize..8,
    ) {
        let manager = ContextWindowManager::new(ContextConfig {
            strategy: ContextStrategy::SlidingWindow,
            max_rounds,
            ..Default::default()
        });
        let kept = manager.sliding_window(&history);
        let conversation = kept.iter().filter(|m| m.role != Role::System).count();
        prop_assert!(conversation <= max_rounds * 2);
        let system_in = history.iter().filter(|m| m.role == Role::System).count();
        let system_out = kept.iter().filter(|m| m.role == Role::System).count();
        prop_assert_eq!(system_in, system_out);
    }
}

// --- Token estimator properties ---

proptest! {
    #[test]
    fn estimate_is_monotonic_under_append(a in "\\PC{0,200}", b in "\\PC{0,200}") {
        let combined = format!("{a}{b}");
        prop_assert!(estimate_tokens(&combined) >= estimate_tokens(&a));
    }

    #[test]
    fn non_empty_text_costs_at_least_one_token(s in "\\PC{1,50}") {
        prop_assert!(estimate_tokens(&s) >= 1);
    }
}

// --- Fusion properties ---

fn dense_ranking(len: usize) -> Vec<RetrievedDocument> {
    (0..len)
        .map(|i| {
            RetrievedDocument::new(
                format!("doc-{i}"),
                format!("content {i}"),
                1.0 - i as f32 * 0.01,
                DocumentSource::Dense,
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn dense_only_fusion_preserves_order(
        len in 0usize..30,
        top_k in 1usize..30,
        k in 1.0f32..100.0,
        dense_weight in 0.1f32..1.0,
    ) {
        let dense = dense_ranking(len);
        let config = RrfConfig { k, dense_weight, sparse_weight: 0.4 };
        let fused = reciprocal_rank_fusion(&dense, &[], &config, top_k);

        let expected: Vec<&str> = dense.iter().take(top_k).map(|d| d.id.as_str()).collect();
        let actual: Vec<&str> = fused.iter().map(|d| d.id.as_str()).collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn fused_scores_are_non_increasing(len in 1usize..30, top_k in 1usize..30) {
        let dense = dense_ranking(len);
        let mut sparse = dense.clone();
        sparse.reverse();
        let fused = reciprocal_rank_fusion(&dense, &sparse, &RrfConfig::default(), top_k);
        prop_assert!(fused.len() <= top_k);
        prop_assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
    }
}

// --- Retry bound ---

proptest! {
    #[test]
    fn at_most_one_rewrite_per_turn(
        scores in prop::collection::vec(0.0f32..1.0, 1..10),
        max_retries in 0u32..10,
        threshold in 0.0f32..1.0,
    ) {
        let mut retry_count = 0;
        for score in scores {
            let grade = RetrievalGrade {
                is_relevant: score >= threshold,
                score,
                reasoning: String::new(),
                per_document_grades: Vec::new(),
            };
            if !should_rewrite(&grade, retry_count, max_retries) {
                break;
            }
            retry_count += 1;
        }
        prop_assert!(retry_count <= 1);
        prop_assert!(retry_count <= max_retries);
    }
}
