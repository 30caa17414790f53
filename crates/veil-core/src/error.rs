//! Core error types.

use thiserror::Error;

/// Errors returned by administrative and planning operations.
///
/// Evaluation faults never appear here: they are contained per row by the
/// execution hook, see [`crate::eval::EvaluationFault`].
#[derive(Debug, Error)]
pub enum Error {
    /// Policy body rejected before storage.
    #[error("policy compilation error in '{policy}': {reason}")]
    PolicyCompile {
        /// Policy being created.
        policy: String,
        /// What was wrong with the body or signature.
        reason: String,
    },

    /// Grant would introduce a cycle in role membership.
    #[error("cyclic grant: {}", path.join(" -> "))]
    CyclicGrant {
        /// Role chain that would close the cycle, starting and ending at the same role.
        path: Vec<String>,
    },

    /// Column or table already has an active attachment and implicit replace is disabled.
    #[error("'{target}' already has policy '{existing}' attached")]
    AttachmentConflict {
        /// Column or table identifier.
        target: String,
        /// Policy currently attached.
        existing: String,
    },

    /// Reference to a policy that does not exist (at the requested point in time).
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// Reference to a column that is not registered.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// Reference to a table that is not registered.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Reference to a role that does not exist.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// Role already exists.
    #[error("role already exists: {0}")]
    RoleExists(String),

    /// User tried to activate a role they do not hold.
    #[error("role '{role}' is not granted to user '{user}'")]
    RoleNotGranted {
        /// Session user.
        user: String,
        /// Role requested.
        role: String,
    },

    /// Revoke of a grant that is not currently active.
    #[error("no active grant of '{role}' to {grantee}")]
    GrantNotFound {
        /// Grantee display name.
        grantee: String,
        /// Role name.
        role: String,
    },

    /// Create without replace on an existing policy name.
    #[error("policy already exists: {0}")]
    PolicyExists(String),

    /// Drop of a policy that is still attached somewhere.
    #[error("policy '{policy}' is attached to {target}")]
    PolicyInUse {
        /// Policy name.
        policy: String,
        /// One of the targets it is attached to.
        target: String,
    },

    /// Detach of a column or table with no active attachment.
    #[error("no policy attached to {0}")]
    NotAttached(String),

    /// Durable log storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Log record encoding error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a policy compile error.
    pub fn compile(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PolicyCompile {
            policy: policy.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CyclicGrant {
            path: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "cyclic grant: A -> B -> A");

        let err = Error::compile("email_mask", "unknown argument 'x'");
        assert!(err.to_string().contains("email_mask"));
        assert!(err.to_string().contains("unknown argument"));

        let err = Error::AttachmentConflict {
            target: "employees.salary".into(),
            existing: "salary_mask".into(),
        };
        assert!(err.to_string().contains("employees.salary"));
    }
}
