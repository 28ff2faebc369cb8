//! Text analysis

use serde::{Deserialize, Serialize};

/// How a field's text becomes terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analyzer {
    /// Whole value as one term, unchanged
    #[default]
    Keyword,
    /// Split on anything that is not alphanumeric, lowercased
    Standard,
}

impl Analyzer {
    pub fn analyze(&self, text: &str) -> Vec<String> {
        match self {
            Analyzer::Keyword => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![text.to_string()]
                }
            }
            Analyzer::Standard => text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|token| !token.is_empty())
                .map(str::to_lowercase)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_keeps_value() {
        assert_eq!(Analyzer::Keyword.analyze("A@b.com"), vec!["A@b.com"]);
        assert!(Analyzer::Keyword.analyze("").is_empty());
    }

    #[test]
    fn test_standard_tokenizes() {
        assert_eq!(Analyzer::Standard.analyze("Hello, World-42!"), vec!["hello", "world", "42"]);
    }
}
