/// Summary artifacts for the maintenance pipeline.
///
/// A [`Summarizer`] turns a record (and the records it is paired with) into a
/// short text plus keywords. Real deployments plug in a model-backed
/// summarizer; [`ExtractiveSummarizer`] is the built-in fallback that keeps
/// leading sentences and picks the most frequent content words.
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::types::MemoryRecord;

static SENTENCE_END: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[.!?]+(\s+|$)").ok());

static WORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'_-]*").ok());

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have",
    "he", "her", "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "like",
    "me", "my", "no", "not", "of", "on", "or", "our", "out", "she", "so", "some", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "to", "up", "us", "was", "we",
    "were", "what", "when", "which", "who", "will", "with", "would", "you", "your",
];

/// Output of a summarizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub keywords: Vec<String>,
}

/// Produces the summary artifact for a record.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `record`; `related` are the records it is paired with, in
    /// conversation order.
    async fn summarize(
        &self,
        record: &MemoryRecord,
        related: &[MemoryRecord],
    ) -> anyhow::Result<Summary>;
}

/// Leading-sentence summarizer with frequency keywords.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_chars: usize,
    max_keywords: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new(280)
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            max_keywords: 5,
        }
    }

    pub fn max_keywords(mut self, max_keywords: usize) -> Self {
        self.max_keywords = max_keywords;
        self
    }

    /// Whole sentences from the start of `text` that fit in `max_chars`.
    /// A first sentence that is already too long is cut at a word boundary.
    pub fn extract(&self, text: &str) -> String {
        let text = text.trim();
        let mut summary = String::new();
        let mut start = 0;

        let boundaries: Vec<usize> = SENTENCE_END
            .as_ref()
            .map(|re| re.find_iter(text).map(|m| m.end()).collect())
            .unwrap_or_default();
        for end in boundaries.into_iter().chain(std::iter::once(text.len())) {
            if end <= start {
                continue;
            }
            let sentence = text[start..end].trim();
            start = end;
            if sentence.is_empty() {
                continue;
            }
            let needed = if summary.is_empty() {
                sentence.chars().count()
            } else {
                summary.chars().count() + 1 + sentence.chars().count()
            };
            if needed > self.max_chars {
                break;
            }
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(sentence);
        }

        if summary.is_empty() {
            summary = truncate_words(text, self.max_chars);
        }
        summary
    }

    /// Most frequent non-stopword terms, ties in order of first appearance.
    pub fn keywords(&self, text: &str) -> Vec<String> {
        let Some(word_pattern) = WORD.as_ref() else {
            return Vec::new();
        };
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (position, word) in word_pattern.find_iter(text).enumerate() {
            let word = word.as_str().to_lowercase();
            if word.chars().count() < 3 || STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            counts.entry(word).or_insert((0, position)).0 += 1;
        }

        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
        ranked
            .into_iter()
            .take(self.max_keywords)
            .map(|(word, _)| word)
            .collect()
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(
        &self,
        record: &MemoryRecord,
        related: &[MemoryRecord],
    ) -> anyhow::Result<Summary> {
        let mut combined = String::new();
        for turn in related.iter().chain(std::iter::once(record)) {
            let content = turn.content.trim();
            if content.is_empty() {
                continue;
            }
            if !combined.is_empty() {
                combined.push(' ');
            }
            combined.push_str(content);
        }
        if combined.is_empty() {
            anyhow::bail!("record {} has no content to summarize", record.id);
        }

        Ok(Summary {
            text: self.extract(&combined),
            keywords: self.keywords(&combined),
        })
    }
}

fn truncate_words(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(boundary) if boundary > 0 => cut[..boundary].trim_end().to_string(),
        _ => cut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_extract_keeps_whole_sentences() {
        let summarizer = ExtractiveSummarizer::new(40);
        let text = "The cache is warm. Rust is fast! This sentence will not fit at all.";
        assert_eq!(summarizer.extract(text), "The cache is warm. Rust is fast!");
    }

    #[test]
    fn test_extract_cuts_long_first_sentence() {
        let summarizer = ExtractiveSummarizer::new(12);
        assert_eq!(summarizer.extract("alpha beta gamma delta epsilon"), "alpha beta");
    }

    #[test]
    fn test_keywords_by_frequency() {
        let summarizer = ExtractiveSummarizer::default().max_keywords(2);
        let keywords = summarizer.keywords("Tokio runs tasks. The tokio runtime schedules tasks, tasks!");
        assert_eq!(keywords, vec!["tasks", "tokio"]);
    }

    #[tokio::test]
    async fn test_summarize_includes_related_turns() {
        let summarizer = ExtractiveSummarizer::default();
        let question = MemoryRecord::new("How do I pin a memory?", Role::User);
        let answer = MemoryRecord::new("Pass pinned metadata when you store it.", Role::Assistant);

        let summary = summarizer.summarize(&answer, &[question]).await.unwrap();
        assert!(summary.text.starts_with("How do I pin a memory?"));
        assert!(summary.keywords.contains(&"pinned".to_string()));
    }

    #[tokio::test]
    async fn test_summarize_empty_fails() {
        let summarizer = ExtractiveSummarizer::default();
        let record = MemoryRecord::new("   ", Role::User);
        assert!(summarizer.summarize(&record, &[]).await.is_err());
    }
}
