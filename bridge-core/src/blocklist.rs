//! Domain block-list matching.
//!
//! The block-list maps a domain pattern to a bitmask of restrictions. A
//! pattern is either an exact domain or `*.suffix`, which matches the
//! suffix itself and any subdomain of it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A restriction kind; the value is its bit in the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Restriction {
    /// Blocked from the hosted signing service.
    RestPki = 1,
    /// Every agent call must be licensed.
    ForceRequireLicense = 2,
    /// Blocked from the bridge entirely.
    Forbidden = 4,
}

impl Restriction {
    /// The bit for this restriction.
    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// Pattern to restriction mask, as served by the block-list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList {
    #[serde(default, rename = "bl")]
    entries: BTreeMap<String, u32>,
}

impl BlockList {
    /// An empty list that restricts nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(pattern, mask)` pairs.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(p, m)| (p.into().to_lowercase(), m))
                .collect(),
        }
    }

    /// Whether any pattern matching `domain` carries `restriction`.
    pub fn is_restricted(&self, domain: &str, restriction: Restriction) -> bool {
        let domain = domain.to_lowercase();
        self.entries
            .iter()
            .any(|(pattern, mask)| pattern_matches(pattern, &domain) && mask & restriction.bit() != 0)
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn pattern_matches(pattern: &str, domain: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            domain == suffix
                || (domain.len() > suffix.len()
                    && domain.ends_with(suffix)
                    && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
        }
        None => domain == pattern,
    }
}
