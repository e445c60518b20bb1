//! 本地敏感词检查，与外部内容审查相互独立。

use std::collections::BTreeSet;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use crate::config::SensitiveConfig;

#[derive(Debug, Clone)]
pub struct SensitiveFilter {
    words: Vec<String>,
    matcher: Option<AhoCorasick>,
}

impl SensitiveFilter {
    pub fn new(words: &[String]) -> Self {
        let words: Vec<String> = words
            .iter()
            .map(|word| word.trim().to_string())
            .filter(|word| !word.is_empty())
            .collect();
        let matcher = if words.is_empty() {
            None
        } else {
            match AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostLongest)
                .build(&words)
            {
                Ok(matcher) => Some(matcher),
                Err(err) => {
                    tracing::error!(error = %err, "failed to build sensitive word matcher");
                    None
                }
            }
        };
        Self { words, matcher }
    }

    pub fn from_config(config: &SensitiveConfig) -> Option<Self> {
        config.check_prompt.then(|| Self::new(&config.words))
    }

    /// 返回命中的敏感词（去重、排序）；未命中返回空。
    pub fn find(&self, text: &str) -> Vec<String> {
        let Some(matcher) = self.matcher.as_ref() else {
            return Vec::new();
        };
        matcher
            .find_iter(text)
            .map(|found| self.words[found.pattern().as_usize()].clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
