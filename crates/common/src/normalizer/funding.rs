//! Funding classification for organizations

use crate::errors::{AppError, Result};
use regex_lite::Regex;
use std::collections::HashMap;

/// Words that mark an organization as a likely funder
pub const DEFAULT_FUNDER_KEYWORDS: &[&str] = &[
    "foundation",
    "foundations",
    "institute",
    "institutes",
    "council",
    "agency",
    "ministry",
    "fund",
    "trust",
    "endowment",
    "charity",
    "society",
    "nih",
    "nsf",
];

/// Decides whether an organization funds research
pub trait FundingLookup: Send + Sync {
    fn is_funded(&self, org_name: &str) -> bool;
}

/// Deterministic keyword match with exact-name overrides
pub struct KeywordFundingLookup {
    pattern: Regex,
    overrides: HashMap<String, bool>,
}

impl KeywordFundingLookup {
    /// Lookup using [`DEFAULT_FUNDER_KEYWORDS`]
    pub fn standard() -> Result<Self> {
        Self::with_keywords(DEFAULT_FUNDER_KEYWORDS)
    }

    /// Lookup matching any of `keywords` as a whole word, case-insensitively
    pub fn with_keywords(keywords: &[&str]) -> Result<Self> {
        let alternatives: Vec<String> = keywords.iter().map(|k| regex_lite::escape(k)).collect();
        let source = if alternatives.is_empty() {
            // Matches nothing
            r"[^\s\S]".to_string()
        } else {
            format!(r"(?i)\b(?:{})\b", alternatives.join("|"))
        };

        let pattern = Regex::new(&source).map_err(|e| AppError::Configuration {
            message: format!("Invalid funder keyword pattern: {}", e),
        })?;

        Ok(Self {
            pattern,
            overrides: HashMap::new(),
        })
    }

    /// Force the answer for one organization name (case-insensitive)
    pub fn with_override(mut self, org_name: &str, funded: bool) -> Self {
        self.overrides.insert(org_name.trim().to_lowercase(), funded);
        self
    }
}

impl FundingLookup for KeywordFundingLookup {
    fn is_funded(&self, org_name: &str) -> bool {
        if let Some(&funded) = self.overrides.get(&org_name.trim().to_lowercase()) {
            return funded;
        }
        self.pattern.is_match(org_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_match_whole_words() {
        let lookup = KeywordFundingLookup::standard().unwrap();
        assert!(lookup.is_funded("National Cancer Institute"));
        assert!(lookup.is_funded("Bill & Melinda Gates FOUNDATION"));
        assert!(lookup.is_funded("NIH"));
        assert!(!lookup.is_funded("Pfizer"));
        assert!(!lookup.is_funded("Refunds Inc"));
    }

    #[test]
    fn test_override_wins() {
        let lookup = KeywordFundingLookup::standard()
            .unwrap()
            .with_override("Pfizer", true)
            .with_override("Karolinska Institute", false);
        assert!(lookup.is_funded("pfizer"));
        assert!(!lookup.is_funded("Karolinska Institute"));
    }

    #[test]
    fn test_empty_keyword_list_matches_nothing() {
        let lookup = KeywordFundingLookup::with_keywords(&[]).unwrap();
        assert!(!lookup.is_funded("Wellcome Trust"));
    }
}
