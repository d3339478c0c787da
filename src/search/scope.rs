//! Scope: the set of field categories a search draws on.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{SearchError, SearchResult};

/// Sorted, de-duplicated category names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    categories: Vec<String>,
}

impl Scope {
    /// Validate `requested` against `known`. Names are trimmed and lowercased.
    pub fn new<I, S>(requested: I, known: &[String]) -> SearchResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known_set: BTreeSet<String> = known.iter().map(|c| normalize(c)).collect();
        let mut categories = BTreeSet::new();
        for raw in requested {
            let category = normalize(raw.as_ref());
            if !known_set.contains(&category) {
                return Err(SearchError::UnknownScope {
                    category: raw.as_ref().to_string(),
                    known: known_set.iter().cloned().collect::<Vec<_>>().join(", "),
                });
            }
            categories.insert(category);
        }
        Ok(Self {
            categories: categories.into_iter().collect(),
        })
    }

    /// Every known category.
    pub fn all(known: &[String]) -> Self {
        let categories: BTreeSet<String> = known
            .iter()
            .map(|c| normalize(c))
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            categories: categories.into_iter().collect(),
        }
    }

    /// `None` or an empty list selects every known category.
    pub fn resolve<S: AsRef<str>>(requested: Option<&[S]>, known: &[String]) -> SearchResult<Self> {
        match requested {
            Some(list) if !list.is_empty() => {
                Self::new(list.iter().map(|c| -> &str { c.as_ref() }), known)
            }
            _ => Ok(Self::all(known)),
        }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories
            .binary_search_by(|c| c.as_str().cmp(normalize(category).as_str()))
            .is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Canonical cache key; equal for any ordering of the same categories.
    pub fn cache_key(&self) -> String {
        format!("semantic_index:{}", self.categories.join(","))
    }
}

fn normalize(category: &str) -> String {
    category.trim().to_lowercase()
}
