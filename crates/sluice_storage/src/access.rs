//! Access control consulted before reusing another principal's results.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A user or service on whose behalf runs execute
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    /// Create a principal
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Principal name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether a principal may see a resource owned by another
pub trait AccessPolicy: Send + Sync {
    /// Whether `principal` may use data owned by `owner`
    fn user_can_access(&self, principal: &Principal, owner: &Principal) -> bool;
}

/// Everyone may access everything
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl AccessPolicy for OpenAccess {
    fn user_can_access(&self, _principal: &Principal, _owner: &Principal) -> bool {
        true
    }
}

/// Owners share explicitly with named principals
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    grants: HashMap<Principal, HashSet<Principal>>,
}

impl AllowList {
    /// Create an empty allow list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `grantee` use data owned by `owner`
    #[must_use]
    pub fn grant(mut self, owner: Principal, grantee: Principal) -> Self {
        self.grants.entry(owner).or_default().insert(grantee);
        self
    }
}

impl AccessPolicy for AllowList {
    fn user_can_access(&self, principal: &Principal, owner: &Principal) -> bool {
        principal == owner
            || self
                .grants
                .get(owner)
                .is_some_and(|grantees| grantees.contains(principal))
    }
}
