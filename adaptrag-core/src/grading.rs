//! Retrieval grading and the rewrite-retry controller.
//!
//! The grader turns an evidence set into one pass/fail judgment. When the
//! evidence fails, the rewriter asks a fast model for a better search query.
//! A turn rewrites at most once, whatever `max_retries` says.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::GradingConfig;
use crate::llm_json::{clean_line, parse_json, truncate_chars};
use crate::provider::CompletionProvider;
use crate::retrieval::lexical::tokenize;
use crate::types::{DocumentGrade, RetrievalGrade, RetrievedDocument};

/// Opening line of the grading prompt.
pub const GRADE_PROMPT_HEADER: &str =
    "You grade whether retrieved documents can answer a question.";
/// Opening line of the rewrite prompt.
pub const REWRITE_PROMPT_HEADER: &str =
    "You rewrite search queries so a retrieval system finds better evidence.";

/// Hard ceiling on query rewrites per turn.
pub const MAX_REWRITES_PER_TURN: u32 = 1;

/// Rewrites longer than this multiple of the original are rejected.
const MAX_REWRITE_GROWTH: usize = 3;

/// Whether the controller should rewrite and retry.
///
/// The configured `max_retries` can only lower the ceiling, never raise it.
pub fn should_rewrite(grade: &RetrievalGrade, retry_count: u32, max_retries: u32) -> bool {
    !grade.is_relevant && retry_count < max_retries.min(MAX_REWRITES_PER_TURN)
}

/// How a grade was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeMethod {
    Judge,
    /// Judge unavailable or unparseable; mean raw similarity used instead.
    SimilarityFallback,
    EmptyEvidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeOutcome {
    pub grade: RetrievalGrade,
    pub method: GradeMethod,
}

#[derive(Debug, Deserialize)]
struct JudgeDocument {
    id: String,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    score: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    documents: Vec<JudgeDocument>,
}

/// Grades an evidence set with a fast judge model.
pub struct RetrievalGrader {
    judge: Arc<dyn CompletionProvider>,
    temperature: f32,
    max_documents: usize,
    document_char_limit: usize,
}

impl RetrievalGrader {
    pub fn new(judge: Arc<dyn CompletionProvider>, config: &GradingConfig) -> Self {
        Self {
            judge,
            temperature: 0.0,
            max_documents: config.max_documents.max(1),
            document_char_limit: config.document_char_limit.max(1),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_prompt(&self, query: &str, documents: &[RetrievedDocument]) -> String {
        let mut prompt = format!(
            "{GRADE_PROMPT_HEADER}\n\
             Score how well the documents, taken together, answer the question on a \
             scale from 0 to 1. Respond with JSON only:\n\
             {{\"score\": <0-1>, \"reasoning\": \"<one sentence>\", \
             \"documents\": [{{\"id\": \"<id>\", \"score\": <0-1>}}]}}\n\n\
             <question>{query}</question>\n\n<documents>\n"
        );
        for doc in documents.iter().take(self.max_documents) {
            prompt.push_str(&format!(
                "[{}] {}\n",
                doc.id,
                truncate_chars(&doc.content, self.document_char_limit)
            ));
        }
        prompt.push_str("</documents>");
        prompt
    }

    /// Grade `documents` against `query`. Never fails: empty evidence grades
    /// as 0 and judge failures fall back to the mean raw similarity.
    pub async fn grade(
        &self,
        query: &str,
        documents: &[RetrievedDocument],
        pass_threshold: f32,
    ) -> GradeOutcome {
        if documents.is_empty() {
            return GradeOutcome {
                grade: RetrievalGrade::empty(),
                method: GradeMethod::EmptyEvidence,
            };
        }

        let prompt = self.build_prompt(query, documents);
        let verdict = match self.judge.complete(&prompt, self.temperature).await {
            Ok(raw) => {
                let parsed = parse_json::<JudgeVerdict>(&raw)
                    .filter(|v| v.score.is_finite() && (0.0..=1.0).contains(&v.score));
                if parsed.is_none() {
                    warn!("Unparseable grading response, falling back to mean similarity");
                }
                parsed
            }
            Err(e) => {
                warn!(error = %e, "Grading call failed, falling back to mean similarity");
                None
            }
        };

        let outcome = match verdict {
            Some(v) => {
                let per_document_grades = if v.documents.is_empty() {
                    similarity_grades(documents)
                } else {
                    v.documents
                        .into_iter()
                        .map(|d| DocumentGrade {
                            document_id: d.id,
                            score: d.score.clamp(0.0, 1.0),
                        })
                        .collect()
                };
                GradeOutcome {
                    grade: RetrievalGrade {
                        is_relevant: v.score >= pass_threshold,
                        score: v.score,
                        reasoning: v.reasoning,
                        per_document_grades,
                    },
                    method: GradeMethod::Judge,
                }
            }
            None => {
                let score = mean_similarity(documents);
                GradeOutcome {
                    grade: RetrievalGrade {
                        is_relevant: score >= pass_threshold,
                        score,
                        reasoning: "Judge unavailable; graded by mean retrieval similarity"
                            .to_string(),
                        per_document_grades: similarity_grades(documents),
                    },
                    method: GradeMethod::SimilarityFallback,
                }
            }
        };

        debug!(
            score = outcome.grade.score,
            relevant = outcome.grade.is_relevant,
            method = ?outcome.method,
            "Retrieval graded"
        );
        outcome
    }
}

/// Mean of the documents' raw similarities, clamped to `[0, 1]`.
pub fn mean_similarity(documents: &[RetrievedDocument]) -> f32 {
    if documents.is_empty() {
        return 0.0;
    }
    let sum: f32 = documents.iter().map(|d| d.similarity()).sum();
    (sum / documents.len() as f32).clamp(0.0, 1.0)
}

fn similarity_grades(documents: &[RetrievedDocument]) -> Vec<DocumentGrade> {
    documents
        .iter()
        .map(|d| DocumentGrade {
            document_id: d.id.clone(),
            score: d.similarity().clamp(0.0, 1.0),
        })
        .collect()
}

/// Words that never count as keyword anchors.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "me", "of", "on", "or", "tell", "that", "the", "this", "to", "was",
    "what", "when", "where", "which", "who", "why", "with", "you", "的", "是", "了", "吗", "呢",
    "什", "么", "在", "和", "有", "我", "你", "怎", "样", "请", "问",
];

/// Content-bearing tokens of a query.
pub fn keyword_anchors(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Why a proposed rewrite was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRejection {
    Empty,
    Unchanged,
    TooLong { original: usize, rewritten: usize },
    LostAnchors,
}

impl std::fmt::Display for RewriteRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteRejection::Empty => write!(f, "rewrite was empty"),
            RewriteRejection::Unchanged => write!(f, "rewrite repeated the original query"),
            RewriteRejection::TooLong {
                original,
                rewritten,
            } => write!(
                f,
                "rewrite grew from {original} to {rewritten} characters"
            ),
            RewriteRejection::LostAnchors => {
                write!(f, "rewrite dropped every keyword of the original query")
            }
        }
    }
}

/// Check a proposed rewrite against the original query.
pub fn validate_rewrite(original: &str, rewritten: &str) -> Result<(), RewriteRejection> {
    let rewritten = rewritten.trim();
    if rewritten.is_empty() {
        return Err(RewriteRejection::Empty);
    }
    if rewritten.eq_ignore_ascii_case(original.trim()) {
        return Err(RewriteRejection::Unchanged);
    }
    let original_len = original.trim().chars().count().max(1);
    let rewritten_len = rewritten.chars().count();
    if rewritten_len > original_len * MAX_REWRITE_GROWTH {
        return Err(RewriteRejection::TooLong {
            original: original_len,
            rewritten: rewritten_len,
        });
    }
    let anchors = keyword_anchors(original);
    if !anchors.is_empty() && keyword_anchors(rewritten).is_disjoint(&anchors) {
        return Err(RewriteRejection::LostAnchors);
    }
    Ok(())
}

/// Result of a rewrite attempt. When `accepted` is false `query` is the
/// query that was passed in and the controller must stop retrying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteOutcome {
    pub query: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    /// The model call itself failed, as opposed to a refused rewrite.
    #[serde(default)]
    pub failed: bool,
}

impl RewriteOutcome {
    fn rejected(query: &str, reason: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            accepted: false,
            rejection: Some(reason.into()),
            failed: false,
        }
    }

    fn failed(query: &str, reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            ..Self::rejected(query, reason)
        }
    }
}

/// Reformulates a failed query using the grader's feedback.
pub struct QueryRewriter {
    llm: Arc<dyn CompletionProvider>,
    temperature: f32,
}

impl QueryRewriter {
    pub fn new(llm: Arc<dyn CompletionProvider>) -> Self {
        Self {
            llm,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_prompt(original: &str, current: &str, feedback: &str) -> String {
        format!(
            "{REWRITE_PROMPT_HEADER}\n\
             The previous search did not return useful documents. Write one improved \
             search query that keeps the key terms of the original question. \
             Reply with the query only.\n\n\
             <original>{original}</original>\n\
             <previous_query>{current}</previous_query>\n\
             <feedback>{feedback}</feedback>"
        )
    }

    /// Propose a better query. Model failures and invalid rewrites keep
    /// `current` and report `accepted = false`.
    pub async fn rewrite(&self, original: &str, current: &str, feedback: &str) -> RewriteOutcome {
        let prompt = Self::build_prompt(original, current, feedback);
        let raw = match self.llm.complete(&prompt, self.temperature).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Query rewrite failed, keeping original query");
                return RewriteOutcome::failed(current, e.to_string());
            }
        };

        let candidate = clean_line(&raw);
        match validate_rewrite(original, &candidate) {
            Ok(()) => {
                debug!(from = current, to = %candidate, "Query rewritten");
                RewriteOutcome {
                    query: candidate,
                    accepted: true,
                    rejection: None,
                    failed: false,
                }
            }
            Err(reason) => {
                warn!(%reason, candidate = %candidate, "Rewrite rejected");
                RewriteOutcome::rejected(current, reason.to_string())
            }
        }
    }
}
