//! Role-to-role and role-to-user grants.
//!
//! Grants form a directed graph: granting role `R` to role `S` means every
//! session with `S` active also has `R` active. The graph is kept acyclic so
//! transitive resolution always terminates.

use super::principal::Principal;
use crate::error::{Error, Result};
use crate::version::{Timestamp, Validity};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// Role implicitly granted to everyone and active in every session.
pub const PUBLIC_ROLE: &str = "PUBLIC";

/// Receiver of a grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grantee {
    /// Another role inherits the granted role.
    Role(String),
    /// A user may activate the granted role.
    User(String),
}

impl Grantee {
    /// Create a role grantee.
    pub fn role(name: impl Into<String>) -> Self {
        Grantee::Role(name.into())
    }

    /// Create a user grantee.
    pub fn user(name: impl Into<String>) -> Self {
        Grantee::User(name.into())
    }
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::Role(r) => write!(f, "role {}", r),
            Grantee::User(u) => write!(f, "user {}", u),
        }
    }
}

/// A named role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDef {
    /// Role name.
    pub name: String,
    /// Principal that owns the role, if recorded.
    pub owner: Option<String>,
    /// When the role was created.
    pub created_at: Timestamp,
}

/// One entry of the append-only grant log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantEdge {
    /// Who receives the role.
    pub grantee: Grantee,
    /// Role granted.
    pub role: String,
    /// Principal that issued the grant.
    pub granted_by: String,
    /// `[granted_at, revoked_at)`.
    pub validity: Validity,
}

impl GrantEdge {
    fn live(&self, at: Option<Timestamp>) -> bool {
        match at {
            Some(at) => self.validity.covers(at),
            None => self.validity.is_open(),
        }
    }
}

#[derive(Debug, Default)]
struct GraphState {
    roles: BTreeMap<String, RoleDef>,
    edges: Vec<GrantEdge>,
}

impl GraphState {
    /// Roles directly granted to `grantee`.
    fn direct<'a>(
        &'a self,
        grantee: &'a Grantee,
        at: Option<Timestamp>,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| &e.grantee == grantee && e.live(at))
            .map(|e| e.role.as_str())
    }

    fn closure<'a, I>(&self, start: I, at: Option<Timestamp>) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        seen.insert(PUBLIC_ROLE.to_string());
        for role in start {
            if seen.insert(role.to_string()) {
                queue.push_back(role.to_string());
            }
        }
        while let Some(role) = queue.pop_front() {
            let grantee = Grantee::Role(role);
            for inherited in self.direct(&grantee, at) {
                if seen.insert(inherited.to_string()) {
                    queue.push_back(inherited.to_string());
                }
            }
        }
        seen
    }

    /// Shortest inheritance chain from `from` down to `to`, inclusive.
    fn path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut parent: HashMap<String, String> = HashMap::new();
        let mut queue = VecDeque::from([from.to_string()]);
        let mut seen = BTreeSet::from([from.to_string()]);
        while let Some(role) = queue.pop_front() {
            if role == to {
                let mut path = vec![role.clone()];
                let mut cur = role;
                while let Some(p) = parent.get(&cur) {
                    path.push(p.clone());
                    cur = p.clone();
                }
                path.reverse();
                return Some(path);
            }
            let grantee = Grantee::Role(role.clone());
            for next in self.direct(&grantee, None) {
                if seen.insert(next.to_string()) {
                    parent.insert(next.to_string(), role.clone());
                    queue.push_back(next.to_string());
                }
            }
        }
        None
    }

    /// Every role `user` holds through current grants, plus PUBLIC.
    fn held_by(&self, user: &str) -> BTreeSet<String> {
        let grantee = Grantee::User(user.to_string());
        let direct: Vec<&str> = self.direct(&grantee, None).collect();
        self.closure(direct, None)
    }

    fn require_role(&self, name: &str) -> Result<()> {
        if self.roles.contains_key(name) {
            Ok(())
        } else {
            Err(Error::UnknownRole(name.to_string()))
        }
    }
}

/// A session's roles as they stand under current grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRoles {
    /// Role `current_role()` reports.
    pub primary: String,
    /// Activated roles still held, PUBLIC included.
    pub session: BTreeSet<String>,
    /// Transitive closure of `session`.
    pub active: BTreeSet<String>,
}

/// Directed graph of role grants.
///
/// Reads take a shared lock; every write holds the exclusive lock for its
/// whole validate-then-mutate sequence.
#[derive(Debug)]
pub struct RoleGraph {
    state: RwLock<GraphState>,
}

impl Default for RoleGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleGraph {
    /// Create a graph containing only PUBLIC.
    pub fn new() -> Self {
        let mut state = GraphState::default();
        state.roles.insert(
            PUBLIC_ROLE.to_string(),
            RoleDef {
                name: PUBLIC_ROLE.to_string(),
                owner: None,
                created_at: 0,
            },
        );
        Self {
            state: RwLock::new(state),
        }
    }

    /// Create a role.
    pub fn create_role(
        &self,
        name: impl Into<String>,
        owner: Option<String>,
        at: Timestamp,
    ) -> Result<RoleDef> {
        let name = name.into();
        let mut state = self.state.write();
        if state.roles.contains_key(&name) {
            return Err(Error::RoleExists(name));
        }
        let def = RoleDef {
            name: name.clone(),
            owner,
            created_at: at,
        };
        state.roles.insert(name, def.clone());
        tracing::info!(role = %def.name, "role created");
        Ok(def)
    }

    /// Check whether a role exists.
    pub fn role_exists(&self, name: &str) -> bool {
        self.state.read().roles.contains_key(name)
    }

    /// All roles, ordered by name.
    pub fn roles(&self) -> Vec<RoleDef> {
        self.state.read().roles.values().cloned().collect()
    }

    /// Grant `role` to `grantee`.
    ///
    /// Granting an already active grant is a no-op that returns the existing
    /// edge. A grant between roles that would close a cycle fails with
    /// [`Error::CyclicGrant`] and leaves the graph unchanged.
    pub fn grant(
        &self,
        grantee: Grantee,
        role: &str,
        granted_by: impl Into<String>,
        at: Timestamp,
    ) -> Result<GrantEdge> {
        let mut state = self.state.write();
        state.require_role(role)?;

        if let Some(existing) = state
            .edges
            .iter()
            .find(|e| e.grantee == grantee && e.role == role && e.validity.is_open())
        {
            return Ok(existing.clone());
        }

        if let Grantee::Role(member) = &grantee {
            state.require_role(member)?;
            if member == role {
                return Err(Error::CyclicGrant {
                    path: vec![member.clone(), role.to_string()],
                });
            }
            // `member` would inherit `role`; a cycle exists if `role` already
            // inherits `member`.
            if let Some(chain) = state.path(role, member) {
                let mut path = vec![member.clone()];
                path.extend(chain);
                return Err(Error::CyclicGrant { path });
            }
        }

        let edge = GrantEdge {
            grantee,
            role: role.to_string(),
            granted_by: granted_by.into(),
            validity: Validity::starting(at),
        };
        state.edges.push(edge.clone());
        tracing::info!(
            role = %edge.role,
            grantee = %edge.grantee,
            by = %edge.granted_by,
            "role granted"
        );
        Ok(edge)
    }

    /// Revoke an active grant. The edge is closed, not removed.
    pub fn revoke(&self, grantee: &Grantee, role: &str, at: Timestamp) -> Result<GrantEdge> {
        let mut state = self.state.write();
        let edge = state
            .edges
            .iter_mut()
            .find(|e| &e.grantee == grantee && e.role == role && e.validity.is_open())
            .ok_or_else(|| Error::GrantNotFound {
                grantee: grantee.to_string(),
                role: role.to_string(),
            })?;
        edge.validity.close(at);
        tracing::info!(role = %role, grantee = %grantee, "role revoked");
        Ok(edge.clone())
    }

    /// Roles directly granted to `grantee` right now.
    pub fn direct_grants(&self, grantee: &Grantee) -> BTreeSet<String> {
        let state = self.state.read();
        state.direct(grantee, None).map(str::to_string).collect()
    }

    /// Every role reachable from `roles` through current grants, plus PUBLIC.
    pub fn closure<'a, I>(&self, roles: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.state.read().closure(roles, None)
    }

    /// Every role reachable from `roles` through grants in effect at `at`.
    pub fn closure_as_of<'a, I>(&self, roles: I, at: Timestamp) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.state.read().closure(roles, Some(at))
    }

    /// Check whether `user` may activate `role`.
    pub fn holds(&self, user: &str, role: &str) -> bool {
        role == PUBLIC_ROLE || self.state.read().held_by(user).contains(role)
    }

    /// Resolve a session's roles against the grants in effect now.
    ///
    /// Session roles the user no longer holds are dropped, and a revoked
    /// primary role falls back to PUBLIC. Roles the user holds but has not
    /// activated are never added.
    pub fn resolve_session(&self, principal: &Principal) -> SessionRoles {
        let state = self.state.read();
        let held = state.held_by(principal.user());
        let session: BTreeSet<String> = principal
            .session_roles()
            .into_iter()
            .filter(|role| held.contains(role))
            .collect();
        let primary = if session.contains(principal.primary_role()) {
            principal.primary_role().to_string()
        } else {
            tracing::debug!(
                user = %principal.user(),
                role = %principal.primary_role(),
                "primary role no longer held, using PUBLIC"
            );
            PUBLIC_ROLE.to_string()
        };
        let active = state.closure(session.iter().map(String::as_str), None);
        SessionRoles {
            primary,
            session,
            active,
        }
    }

    /// Roles active for the principal's current session.
    pub fn active_role_set(&self, principal: &Principal) -> BTreeSet<String> {
        self.resolve_session(principal).active
    }

    /// Check whether `role` is active for the principal.
    pub fn is_active(&self, principal: &Principal, role: &str) -> bool {
        self.active_role_set(principal).contains(role)
    }

    /// Replace the principal's primary role.
    pub fn use_role(&self, principal: &mut Principal, role: &str) -> Result<()> {
        self.check_activation(principal, role)?;
        principal.set_primary(role);
        tracing::debug!(user = %principal.user(), role = %role, "primary role changed");
        Ok(())
    }

    /// Add a secondary role to the principal's session.
    pub fn activate_secondary(&self, principal: &mut Principal, role: &str) -> Result<()> {
        self.check_activation(principal, role)?;
        principal.add_secondary(role);
        Ok(())
    }

    fn check_activation(&self, principal: &Principal, role: &str) -> Result<()> {
        if !self.role_exists(role) {
            return Err(Error::UnknownRole(role.to_string()));
        }
        if !self.holds(principal.user(), role) {
            return Err(Error::RoleNotGranted {
                user: principal.user().to_string(),
                role: role.to_string(),
            });
        }
        Ok(())
    }

    /// Full grant log, including revoked edges.
    pub fn edges(&self) -> Vec<GrantEdge> {
        self.state.read().edges.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(roles: &[&str]) -> RoleGraph {
        let graph = RoleGraph::new();
        for (i, role) in roles.iter().enumerate() {
            graph.create_role(*role, None, i as u64 + 1).unwrap();
        }
        graph
    }

    #[test]
    fn test_closure_follows_role_grants() {
        let graph = graph_with(&["SYSADMIN", "HR_ADMIN", "ANALYST"]);
        graph
            .grant(Grantee::role("SYSADMIN"), "HR_ADMIN", "root", 10)
            .unwrap();
        graph
            .grant(Grantee::role("HR_ADMIN"), "ANALYST", "root", 11)
            .unwrap();

        let active = graph.closure(["SYSADMIN"]);
        assert!(active.contains("SYSADMIN"));
        assert!(active.contains("HR_ADMIN"));
        assert!(active.contains("ANALYST"));
        assert!(active.contains(PUBLIC_ROLE));

        // Inheritance flows one way only.
        let active = graph.closure(["ANALYST"]);
        assert!(!active.contains("HR_ADMIN"));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let graph = graph_with(&["A", "B", "C"]);
        graph.grant(Grantee::role("A"), "B", "root", 10).unwrap();
        graph.grant(Grantee::role("B"), "C", "root", 11).unwrap();
        let before = graph.edges();

        let err = graph.grant(Grantee::role("C"), "A", "root", 12).unwrap_err();
        match err {
            Error::CyclicGrant { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path, vec!["C", "A", "B", "C"]);
            }
            other => panic!("expected CyclicGrant, got {other:?}"),
        }
        assert_eq!(graph.edges(), before);

        let err = graph.grant(Grantee::role("A"), "A", "root", 13).unwrap_err();
        assert!(matches!(err, Error::CyclicGrant { .. }));
    }

    #[test]
    fn test_two_role_cycle_rejected() {
        let graph = graph_with(&["A", "B"]);
        graph.grant(Grantee::role("B"), "A", "root", 10).unwrap();
        assert!(matches!(
            graph.grant(Grantee::role("A"), "B", "root", 11),
            Err(Error::CyclicGrant { .. })
        ));
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_duplicate_grant_is_noop() {
        let graph = graph_with(&["ANALYST"]);
        let first = graph
            .grant(Grantee::user("alice"), "ANALYST", "root", 10)
            .unwrap();
        let second = graph
            .grant(Grantee::user("alice"), "ANALYST", "root", 11)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_revoke_closes_edge() {
        let graph = graph_with(&["A", "B"]);
        graph.grant(Grantee::role("A"), "B", "root", 10).unwrap();
        graph.revoke(&Grantee::role("A"), "B", 20).unwrap();

        assert!(!graph.closure(["A"]).contains("B"));
        assert!(graph.closure_as_of(["A"], 15).contains("B"));
        assert!(!graph.closure_as_of(["A"], 20).contains("B"));
        assert_eq!(graph.edges().len(), 1);

        assert!(matches!(
            graph.revoke(&Grantee::role("A"), "B", 30),
            Err(Error::GrantNotFound { .. })
        ));
    }

    #[test]
    fn test_unknown_roles_rejected() {
        let graph = graph_with(&["A"]);
        assert!(matches!(
            graph.grant(Grantee::role("A"), "MISSING", "root", 10),
            Err(Error::UnknownRole(_))
        ));
        assert!(matches!(
            graph.grant(Grantee::role("MISSING"), "A", "root", 10),
            Err(Error::UnknownRole(_))
        ));
        assert!(matches!(
            graph.create_role("A", None, 11),
            Err(Error::RoleExists(_))
        ));
    }

    #[test]
    fn test_activation_requires_holding_role() {
        let graph = graph_with(&["ANALYST", "HR_ADMIN", "READER"]);
        graph
            .grant(Grantee::user("alice"), "ANALYST", "root", 10)
            .unwrap();
        graph
            .grant(Grantee::role("ANALYST"), "READER", "root", 11)
            .unwrap();

        let mut alice = Principal::new("alice", PUBLIC_ROLE);
        graph.use_role(&mut alice, "ANALYST").unwrap();
        assert!(graph.is_active(&alice, "READER"));

        // Held through ANALYST, so it may be activated directly.
        graph.activate_secondary(&mut alice, "READER").unwrap();

        assert!(matches!(
            graph.use_role(&mut alice, "HR_ADMIN"),
            Err(Error::RoleNotGranted { .. })
        ));
        assert_eq!(alice.primary_role(), "ANALYST");
    }

    #[test]
    fn test_revoked_session_roles_are_dropped() {
        let graph = graph_with(&["HR_ADMIN", "READER"]);
        graph
            .grant(Grantee::user("hana"), "HR_ADMIN", "root", 10)
            .unwrap();
        graph
            .grant(Grantee::user("hana"), "READER", "root", 11)
            .unwrap();
        let mut hana = Principal::new("hana", "HR_ADMIN");
        graph.activate_secondary(&mut hana, "READER").unwrap();

        graph.revoke(&Grantee::user("hana"), "HR_ADMIN", 12).unwrap();
        let roles = graph.resolve_session(&hana);
        assert_eq!(roles.primary, PUBLIC_ROLE);
        assert!(!roles.session.contains("HR_ADMIN"));
        assert!(!roles.active.contains("HR_ADMIN"));
        assert!(roles.active.contains("READER"));
        assert!(!graph.is_active(&hana, "HR_ADMIN"));
    }

    #[test]
    fn test_held_but_inactive_roles_are_not_active() {
        let graph = graph_with(&["ANALYST", "HR_ADMIN"]);
        graph
            .grant(Grantee::user("bob"), "ANALYST", "root", 10)
            .unwrap();
        graph
            .grant(Grantee::user("bob"), "HR_ADMIN", "root", 11)
            .unwrap();

        let bob = Principal::new("bob", "ANALYST");
        let active = graph.active_role_set(&bob);
        assert!(active.contains("ANALYST"));
        assert!(!active.contains("HR_ADMIN"));
    }
}
