//! Token canonicalization ("entropy reduction") for prefix lookups.
//!
//! A canonicalizer must be deterministic and idempotent, and must map the
//! empty sentinel to itself. Distinct surface forms that canonicalize the
//! same become indistinguishable as prefixes; suffixes are never
//! canonicalized.

use serde::Deserialize;

pub trait Canonicalizer: Send + Sync {
    fn canonicalize(&self, token: &str) -> String;
}

/// Built-in canonicalization rule sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonPolicy {
    /// Tokens are used as-is.
    Identity,
    /// Unicode lowercase.
    #[default]
    Lowercase,
    /// Lowercase with trailing ASCII punctuation removed. Tokens made only of
    /// punctuation keep it, so no ordinary token becomes the sentinel.
    Folded,
}

impl Canonicalizer for CanonPolicy {
    fn canonicalize(&self, token: &str) -> String {
        match self {
            CanonPolicy::Identity => token.to_string(),
            CanonPolicy::Lowercase => token.to_lowercase(),
            CanonPolicy::Folded => {
                let lower = token.to_lowercase();
                let trimmed = lower.trim_end_matches(|c: char| c.is_ascii_punctuation());
                if trimmed.is_empty() {
                    lower
                } else {
                    trimmed.to_string()
                }
            }
        }
    }
}
