//! Query term expansion for fallback keyword retrieval.
//!
//! Widens recall by appending configured related terms to a query, e.g.
//! `"k8s rollout"` → `"k8s rollout kubernetes deployment"`. Only the
//! keyword query of a fallback attempt is expanded; the vector query is
//! left as the caller wrote it.

use std::collections::{HashMap, HashSet};

use crate::text::tokenize;

#[derive(Debug, Clone, Default)]
pub struct TermExpander {
    synonyms: HashMap<String, Vec<String>>,
}

impl TermExpander {
    /// Keys are matched case-insensitively.
    pub fn new(synonyms: &HashMap<String, Vec<String>>) -> Self {
        let synonyms = synonyms
            .iter()
            .map(|(term, related)| (term.to_lowercase(), related.clone()))
            .collect();
        Self { synonyms }
    }

    pub fn is_empty(&self) -> bool {
        self.synonyms.is_empty()
    }

    /// The query with related terms appended. Terms already present in the
    /// query, or already appended, are not repeated.
    pub fn expand(&self, query: &str) -> String {
        let terms = tokenize(query);
        let mut seen: HashSet<String> = terms.iter().cloned().collect();
        let mut expansions: Vec<&str> = Vec::new();

        for term in &terms {
            let Some(related) = self.synonyms.get(term) else {
                continue;
            };
            for syn in related {
                if seen.insert(syn.to_lowercase()) {
                    expansions.push(syn);
                }
            }
        }

        if expansions.is_empty() {
            query.to_string()
        } else {
            format!("{} {}", query, expansions.join(" "))
        }
    }
}
