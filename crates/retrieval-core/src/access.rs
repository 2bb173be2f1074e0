//! Project access control.
//!
//! The engine evaluates an [`AccessPolicy`] before any ingestion or
//! retrieval call reaches a store. Policies are passed in at construction;
//! there is no global registry.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Predicate deciding whether `principal` may touch `project_id`.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, project_id: &str, principal: &str) -> bool;
}

/// Grants every principal access to every project.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _project_id: &str, _principal: &str) -> bool {
        true
    }
}

/// Explicit per-project grants.
#[derive(Default)]
pub struct ProjectGrants {
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl ProjectGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, project_id: &str, principal: &str) {
        let mut grants = self
            .grants
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        grants
            .entry(project_id.to_string())
            .or_default()
            .insert(principal.to_string());
    }

    pub fn revoke(&self, project_id: &str, principal: &str) {
        let mut grants = self
            .grants
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(members) = grants.get_mut(project_id) {
            members.remove(principal);
        }
    }
}

impl AccessPolicy for ProjectGrants {
    fn allows(&self, project_id: &str, principal: &str) -> bool {
        let grants = self
            .grants
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        grants
            .get(project_id)
            .is_some_and(|members| members.contains(principal))
    }
}
