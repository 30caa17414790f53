//! Roles, grants, and session role activation.

pub mod graph;
pub mod principal;

pub use graph::{GrantEdge, Grantee, RoleDef, RoleGraph, SessionRoles, PUBLIC_ROLE};
pub use principal::Principal;
