//! Loading a directory of text files into the in-memory vector store.

use adaptrag_core::provider::EmbeddingProvider;
use adaptrag_core::store::{InMemoryVectorStore, VectorRecord};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

const EXTENSIONS: &[&str] = &["txt", "md"];

/// Passages shorter than this are merged into the next one.
const MIN_PASSAGE_CHARS: usize = 40;

/// One indexable passage of a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub id: String,
    pub source: String,
    pub content: String,
}

/// Split text into passages on blank lines, folding very short blocks
/// (headings, single words) into the following passage.
pub fn split_passages(text: &str) -> Vec<String> {
    let mut passages = Vec::new();
    let mut pending = String::new();
    for block in text.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if !pending.is_empty() {
            pending.push('\n');
        }
        pending.push_str(block);
        if pending.chars().count() >= MIN_PASSAGE_CHARS {
            passages.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        passages.push(pending);
    }
    passages
}

/// Read every `.txt` / `.md` file under `dir`, in path order.
pub fn load_passages(dir: &Path) -> anyhow::Result<Vec<Passage>> {
    if !dir.is_dir() {
        anyhow::bail!("Corpus path '{}' is not a directory", dir.display());
    }
    let mut passages = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()));
        if !entry.file_type().is_file() || !supported {
            continue;
        }
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let source = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        for (i, content) in split_passages(&text).into_iter().enumerate() {
            passages.push(Passage {
                id: format!("{}#{}", source, i),
                source: source.clone(),
                content,
            });
        }
    }
    Ok(passages)
}

/// Embed passages and insert them into `store`. Returns the number indexed.
pub async fn index_passages(
    passages: &[Passage],
    embedder: &dyn EmbeddingProvider,
    store: &InMemoryVectorStore,
) -> anyhow::Result<usize> {
    let texts: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await?;
    for (passage, vector) in passages.iter().zip(vectors) {
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), serde_json::json!(passage.source));
        store.insert(VectorRecord {
            id: passage.id.clone(),
            vector,
            content: passage.content.clone(),
            metadata,
        })?;
    }
    tracing::info!(passages = passages.len(), "Corpus indexed");
    Ok(passages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptrag_core::provider::LocalEmbeddingProvider;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_on_blank_lines() {
        let text = "First paragraph is long enough to stand alone here.\n\n\
                    Second paragraph is also long enough to stand alone.";
        let passages = split_passages(text);
        assert_eq!(passages.len(), 2);
        assert!(passages[1].starts_with("Second"));
    }

    #[test]
    fn test_short_blocks_merge_forward() {
        let text = "# Title\n\nThe body paragraph that follows the heading is long.";
        let passages = split_passages(text);
        assert_eq!(passages.len(), 1);
        assert!(passages[0].starts_with("# Title\nThe body"));
    }

    #[test]
    fn test_trailing_short_block_is_kept() {
        let passages = split_passages("A long enough paragraph to be its own passage.\n\nEnd.");
        assert_eq!(passages, vec![
            "A long enough paragraph to be its own passage.".to_string(),
            "End.".to_string(),
        ]);
    }

    #[test]
    fn test_load_passages_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.md"),
            "Markdown passage that is comfortably longer than forty chars.",
        )
        .unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn main() {}").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested/c.txt"),
            "Plain text passage that is comfortably longer than forty chars.",
        )
        .unwrap();

        let passages = load_passages(dir.path()).unwrap();
        let ids: Vec<&str> = passages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a.md#0", "nested/c.txt#0"]);
    }

    #[test]
    fn test_load_passages_rejects_missing_dir() {
        assert!(load_passages(Path::new("/definitely/not/here")).is_err());
    }

    #[tokio::test]
    async fn test_index_passages() {
        let store = InMemoryVectorStore::new(32);
        let embedder = LocalEmbeddingProvider::new(32);
        let passages = vec![Passage {
            id: "doc#0".into(),
            source: "doc".into(),
            content: "Rust ownership rules".into(),
        }];
        let count = index_passages(&passages, &embedder, &store).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.len(), 1);
    }
}
