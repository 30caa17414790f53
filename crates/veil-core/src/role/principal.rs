//! Session identity: the user and the roles it has explicitly activated.

use super::graph::PUBLIC_ROLE;
use std::collections::BTreeSet;

/// A user session's role state.
///
/// Mutated only through [`super::RoleGraph::use_role`] and
/// [`super::RoleGraph::activate_secondary`], which check that the user holds
/// the role. Planning snapshots it into an immutable
/// [`crate::eval::EvaluationContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    user: String,
    default_role: String,
    primary_role: String,
    secondary_roles: BTreeSet<String>,
}

impl Principal {
    /// Create a session whose primary role is the user's default role.
    pub fn new(user: impl Into<String>, default_role: impl Into<String>) -> Self {
        let default_role = default_role.into();
        Self {
            user: user.into(),
            primary_role: default_role.clone(),
            default_role,
            secondary_roles: BTreeSet::new(),
        }
    }

    /// Session user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Role the session started with.
    pub fn default_role(&self) -> &str {
        &self.default_role
    }

    /// Role returned by `current_role()`.
    pub fn primary_role(&self) -> &str {
        &self.primary_role
    }

    /// Secondary roles activated in addition to the primary one.
    pub fn secondary_roles(&self) -> &BTreeSet<String> {
        &self.secondary_roles
    }

    /// Explicitly active roles: primary, secondaries, and PUBLIC.
    pub fn session_roles(&self) -> BTreeSet<String> {
        let mut roles = self.secondary_roles.clone();
        roles.insert(self.primary_role.clone());
        roles.insert(PUBLIC_ROLE.to_string());
        roles
    }

    pub(crate) fn set_primary(&mut self, role: &str) {
        self.primary_role = role.to_string();
    }

    pub(crate) fn add_secondary(&mut self, role: &str) {
        if role != self.primary_role {
            self.secondary_roles.insert(role.to_string());
        }
    }

    /// Drop all secondary roles.
    pub fn clear_secondary(&mut self) {
        self.secondary_roles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_roles_always_include_public() {
        let p = Principal::new("alice", "ANALYST");
        let roles = p.session_roles();
        assert!(roles.contains("ANALYST"));
        assert!(roles.contains(PUBLIC_ROLE));
        assert_eq!(roles.len(), 2);
    }

    #[test]
    fn test_secondary_roles() {
        let mut p = Principal::new("alice", "ANALYST");
        p.add_secondary("READER");
        p.add_secondary("ANALYST");
        assert_eq!(p.secondary_roles().len(), 1);
        p.clear_secondary();
        assert!(p.secondary_roles().is_empty());
    }
}
