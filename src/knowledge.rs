use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;

/// Supplies background knowledge for an objective.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    async fn retrieve(&self, objective: &str) -> anyhow::Result<String>;
}

const MAX_PASSAGES: usize = 3;
const MIN_WORD_LEN: usize = 3;

/// Passages from a local text file, ranked by words shared with the objective.
pub struct FileKnowledge {
    path: PathBuf,
}

impl FileKnowledge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Pick the passages of `document` most relevant to `objective`.
pub fn rank_passages(document: &str, objective: &str) -> Vec<String> {
    let wanted = words(objective);
    let mut scored: Vec<(usize, usize, &str)> = document
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(pos, passage)| (words(passage).intersection(&wanted).count(), pos, passage))
        .filter(|(score, _, _)| *score > 0)
        .collect();
    // Highest score first, document order breaks ties.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(MAX_PASSAGES)
        .map(|(_, _, p)| p.to_string())
        .collect()
}

#[async_trait]
impl KnowledgeSource for FileKnowledge {
    async fn retrieve(&self, objective: &str) -> anyhow::Result<String> {
        let document = tokio::fs::read_to_string(&self.path).await?;
        Ok(rank_passages(&document, objective).join("\n\n"))
    }
}
