//! Per-statement evaluation context.

use crate::role::{Principal, RoleGraph};
use crate::value::Value;
use crate::version::Timestamp;
use std::collections::{BTreeSet, HashMap};

/// Identity and role state a statement is evaluated under.
///
/// Built once when the statement is planned and never mutated afterwards.
/// Every worker applying the statement's obligations reads the same
/// instance, so all rows see one role set even if grants change mid-query.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// Statement identifier.
    pub statement_id: u64,
    /// Session user.
    pub user: String,
    /// Primary role, as returned by `current_role()`.
    pub primary_role: String,
    /// Explicitly activated roles (primary, secondaries, PUBLIC).
    pub session_roles: BTreeSet<String>,
    /// Transitive closure of `session_roles` over the role graph.
    pub active_roles: BTreeSet<String>,
    /// Session attributes readable through `context(key)`.
    pub attributes: HashMap<String, Value>,
    /// Point in time policies and attachments are resolved at.
    pub as_of: Timestamp,
    /// When the context was captured.
    pub created_at: Timestamp,
}

impl EvaluationContext {
    /// Capture a principal's role state.
    ///
    /// Roles come from the grants in effect now, so a role revoked since the
    /// session activated it is gone. `as_of` only selects which policy
    /// versions and attachments apply.
    pub fn capture(
        statement_id: u64,
        graph: &RoleGraph,
        principal: &Principal,
        as_of: Timestamp,
        now: Timestamp,
    ) -> Self {
        let roles = graph.resolve_session(principal);
        Self {
            statement_id,
            user: principal.user().to_string(),
            primary_role: roles.primary,
            session_roles: roles.session,
            active_roles: roles.active,
            attributes: HashMap::new(),
            as_of,
            created_at: now,
        }
    }

    /// Build a context directly from a role set. Used by tests and callers
    /// that resolve roles themselves.
    pub fn for_roles<I, S>(
        user: impl Into<String>,
        primary_role: impl Into<String>,
        active: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let primary_role = primary_role.into();
        let mut active_roles: BTreeSet<String> = active.into_iter().map(Into::into).collect();
        active_roles.insert(primary_role.clone());
        active_roles.insert(crate::role::PUBLIC_ROLE.to_string());
        let mut session_roles = BTreeSet::new();
        session_roles.insert(primary_role.clone());
        session_roles.insert(crate::role::PUBLIC_ROLE.to_string());
        Self {
            statement_id: 0,
            user: user.into(),
            primary_role,
            session_roles,
            active_roles,
            attributes: HashMap::new(),
            as_of: 0,
            created_at: 0,
        }
    }

    /// Set a session attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Session attribute, if set.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Check whether a role is in the active set.
    pub fn is_role_active(&self, role: &str) -> bool {
        self.active_roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Grantee;

    #[test]
    fn test_capture_computes_closure() {
        let graph = RoleGraph::new();
        graph.create_role("ANALYST", None, 1).unwrap();
        graph.create_role("READER", None, 1).unwrap();
        graph.grant(Grantee::role("ANALYST"), "READER", "admin", 2).unwrap();
        graph.grant(Grantee::user("alice"), "ANALYST", "admin", 2).unwrap();

        let principal = Principal::new("alice", "ANALYST");
        let ctx = EvaluationContext::capture(7, &graph, &principal, 5, 6);
        assert_eq!(ctx.statement_id, 7);
        assert_eq!(ctx.primary_role, "ANALYST");
        assert!(ctx.is_role_active("READER"));
        assert!(ctx.is_role_active("PUBLIC"));
        assert!(!ctx.session_roles.contains("READER"));
        assert_eq!(ctx.as_of, 5);
    }

    #[test]
    fn test_capture_is_a_snapshot() {
        let graph = RoleGraph::new();
        graph.create_role("A", None, 1).unwrap();
        graph.create_role("B", None, 1).unwrap();
        graph.grant(Grantee::role("A"), "B", "admin", 2).unwrap();
        graph.grant(Grantee::user("u"), "A", "admin", 2).unwrap();

        let principal = Principal::new("u", "A");
        let ctx = EvaluationContext::capture(1, &graph, &principal, 3, 3);
        graph.revoke(&Grantee::role("A"), "B", 4).unwrap();

        assert!(ctx.is_role_active("B"));
        assert!(!graph.is_active(&principal, "B"));
    }

    #[test]
    fn test_attributes() {
        let ctx = EvaluationContext::for_roles("u", "R", ["X"])
            .with_attribute("region", "EU")
            .with_attribute("tier", 3i64);
        assert_eq!(ctx.attribute("region"), Some(&Value::String("EU".into())));
        assert_eq!(ctx.attribute("tier"), Some(&Value::Int(3)));
        assert!(ctx.attribute("missing").is_none());
        assert!(ctx.is_role_active("X"));
        assert!(ctx.is_role_active("R"));
    }
}
