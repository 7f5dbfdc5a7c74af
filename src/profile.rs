// =============================================================================
// Client Profiles — flow-quality scores driving default routing splits
// =============================================================================
//
// Analytics outside the engine score each account's historical flow and push
// updates here. The router consumes profiles when no routing rule matches:
// the a-book/b-book percentages split flow, a manual override pins the path,
// and sufficiently toxic flow is hedged out entirely.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExecutionPath;

/// Routing profile for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub account_id: String,
    /// 0 (benign) ..= 100 (maximally adverse flow).
    pub toxicity_score: u8,
    pub a_book_pct: u8,
    pub b_book_pct: u8,
    /// When set, wins over the percentage split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ExecutionPath>,
}

impl ClientProfile {
    /// A neutral profile: everything internalized, no override.
    pub fn neutral(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            toxicity_score: 0,
            a_book_pct: 0,
            b_book_pct: 100,
            manual_override: None,
        }
    }

    /// Percentages must sum to 100 and the score must be a percentage.
    pub fn is_valid(&self) -> bool {
        self.a_book_pct as u16 + self.b_book_pct as u16 == 100 && self.toxicity_score <= 100
    }
}

/// Store of client profiles, updated periodically by analytics.
pub struct ClientProfileStore {
    profiles: RwLock<HashMap<String, ClientProfile>>,
}

impl ClientProfileStore {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a profile. Invalid profiles are dropped.
    pub fn upsert(&self, profile: ClientProfile) -> bool {
        if !profile.is_valid() {
            return false;
        }
        info!(
            account_id = %profile.account_id,
            toxicity = profile.toxicity_score,
            a_book_pct = profile.a_book_pct,
            "client profile updated"
        );
        self.profiles
            .write()
            .insert(profile.account_id.clone(), profile);
        true
    }

    /// Profile for an account, falling back to the neutral default.
    pub fn get(&self, account_id: &str) -> ClientProfile {
        self.profiles
            .read()
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| ClientProfile::neutral(account_id))
    }
}

impl Default for ClientProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProfileStore")
            .field("profiles", &self.profiles.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_profile_is_valid() {
        let p = ClientProfile::neutral("A");
        assert!(p.is_valid());
        assert_eq!(p.b_book_pct, 100);
    }

    #[test]
    fn invalid_split_is_rejected() {
        let store = ClientProfileStore::new();
        let mut p = ClientProfile::neutral("A");
        p.a_book_pct = 60; // 60 + 100 != 100
        assert!(!store.upsert(p));
        assert_eq!(store.get("A").a_book_pct, 0);
    }

    #[test]
    fn lookup_falls_back_to_neutral() {
        let store = ClientProfileStore::new();
        let p = store.get("unseen");
        assert_eq!(p.account_id, "unseen");
        assert_eq!(p.b_book_pct, 100);
    }

    #[test]
    fn upsert_and_override() {
        let store = ClientProfileStore::new();
        let p = ClientProfile {
            account_id: "A".to_string(),
            toxicity_score: 80,
            a_book_pct: 70,
            b_book_pct: 30,
            manual_override: Some(ExecutionPath::ABook),
        };
        assert!(store.upsert(p));
        let got = store.get("A");
        assert_eq!(got.toxicity_score, 80);
        assert_eq!(got.manual_override, Some(ExecutionPath::ABook));
    }
}
