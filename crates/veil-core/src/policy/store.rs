//! Versioned policy and attachment storage.
//!
//! Nothing here is ever removed. Replacing a policy closes the validity of
//! its current version and opens a new one; detaching closes the attachment.
//! Lookups at a point in time pick the record whose validity covers it, which
//! is what makes time-travel planning consistent.

use super::compile::{CompiledMaskingPolicy, CompiledRowAccessPolicy};
use crate::catalog::{ColumnId, TableId};
use crate::error::{Error, Result};
use crate::value::DataType;
use crate::version::{Timestamp, Validity};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One version of a named policy.
#[derive(Debug)]
pub struct PolicyVersion<T> {
    /// Compiled policy, shared with every plan that resolved it.
    pub policy: Arc<T>,
    /// `[created_at, replaced_or_dropped_at)`.
    pub validity: Validity,
}

impl<T> Clone for PolicyVersion<T> {
    fn clone(&self) -> Self {
        Self {
            policy: Arc::clone(&self.policy),
            validity: self.validity,
        }
    }
}

/// What an attachment protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachmentTarget {
    /// Masked column.
    Column(ColumnId),
    /// Filtered table.
    Table(TableId),
}

impl fmt::Display for AttachmentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentTarget::Column(c) => write!(f, "column {}", c),
            AttachmentTarget::Table(t) => write!(f, "table {}", t),
        }
    }
}

/// Binding of a policy to a column or table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAttachment {
    /// Protected column or table.
    pub target: AttachmentTarget,
    /// Attached policy.
    pub policy: String,
    /// Row-access only: table columns bound to the policy parameters, in order.
    pub columns: Vec<String>,
    /// `[attached_at, detached_at)`.
    pub validity: Validity,
}

impl PolicyAttachment {
    /// When the attachment took effect.
    pub fn attached_at(&self) -> Timestamp {
        self.validity.valid_from
    }

    /// When the attachment was detached or replaced, if it was.
    pub fn detached_at(&self) -> Option<Timestamp> {
        self.validity.valid_to
    }
}

/// Result of storing a policy version.
#[derive(Debug)]
pub struct Stored<T> {
    /// The version now in effect.
    pub policy: Arc<T>,
    /// Whether a live version was replaced.
    pub replaced: bool,
}

/// Versioned store of policies and their attachments.
///
/// Writes to one name or target are serialized by the map's per-entry lock.
/// No method holds an entry of one map while locking another.
#[derive(Debug)]
pub struct PolicyStore {
    masking: DashMap<String, Vec<PolicyVersion<CompiledMaskingPolicy>>>,
    row_access: DashMap<String, Vec<PolicyVersion<CompiledRowAccessPolicy>>>,
    columns: DashMap<ColumnId, Vec<PolicyAttachment>>,
    tables: DashMap<TableId, Vec<PolicyAttachment>>,
    implicit_replace: bool,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(true)
    }
}

fn live<T>(versions: &[PolicyVersion<T>]) -> Option<&PolicyVersion<T>> {
    versions.iter().rev().find(|v| v.validity.is_open())
}

fn as_of<T>(versions: &[PolicyVersion<T>], at: Timestamp) -> Option<Arc<T>> {
    versions
        .iter()
        .rev()
        .find(|v| v.validity.covers(at))
        .map(|v| Arc::clone(&v.policy))
}

fn active(log: &[PolicyAttachment]) -> Option<&PolicyAttachment> {
    log.iter().rev().find(|a| a.validity.is_open())
}

impl PolicyStore {
    /// Create an empty store. With `implicit_replace` off, attaching to a
    /// target that already has an active attachment fails instead of
    /// replacing it.
    pub fn new(implicit_replace: bool) -> Self {
        Self {
            masking: DashMap::new(),
            row_access: DashMap::new(),
            columns: DashMap::new(),
            tables: DashMap::new(),
            implicit_replace,
        }
    }

    // =========================================================================
    // Masking policies
    // =========================================================================

    /// Store a new version of a masking policy.
    ///
    /// The version number is assigned here. Replacing a policy that is
    /// currently attached must keep its input type.
    pub fn put_masking(
        &self,
        mut compiled: CompiledMaskingPolicy,
        replace: bool,
        at: Timestamp,
    ) -> Result<Stored<CompiledMaskingPolicy>> {
        let name = compiled.def.name.clone();
        let attached_to = self.masking_targets(&name);

        let mut versions = self.masking.entry(name.clone()).or_default();
        let mut replaced = false;
        if let Some(current) = live(&versions) {
            if !replace {
                return Err(Error::PolicyExists(name));
            }
            if let Some(column) = attached_to.first() {
                if current.policy.input_type() != compiled.input_type() {
                    return Err(Error::compile(
                        &name,
                        format!(
                            "cannot change input type from {} to {} while attached to {}",
                            current.policy.input_type(),
                            compiled.input_type(),
                            column
                        ),
                    ));
                }
            }
            replaced = true;
        }

        compiled.version = versions.last().map_or(1, |v| v.policy.version + 1);
        if let Some(current) = versions.iter_mut().rev().find(|v| v.validity.is_open()) {
            current.validity.close(at);
        }
        let policy = Arc::new(compiled);
        versions.push(PolicyVersion {
            policy: Arc::clone(&policy),
            validity: Validity::starting(at),
        });
        Ok(Stored { policy, replaced })
    }

    /// Close the live version of a masking policy.
    pub fn drop_masking(&self, name: &str, at: Timestamp) -> Result<()> {
        if let Some(column) = self.masking_targets(name).into_iter().next() {
            return Err(Error::PolicyInUse {
                policy: name.to_string(),
                target: column.to_string(),
            });
        }
        let mut versions = self
            .masking
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))?;
        let current = versions
            .iter_mut()
            .rev()
            .find(|v| v.validity.is_open())
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))?;
        current.validity.close(at);
        Ok(())
    }

    /// Live version of a masking policy.
    pub fn current_masking(&self, name: &str) -> Option<Arc<CompiledMaskingPolicy>> {
        let versions = self.masking.get(name)?;
        live(&versions).map(|v| Arc::clone(&v.policy))
    }

    /// Masking policy version in effect at `at`.
    pub fn resolve_masking(&self, name: &str, at: Timestamp) -> Option<Arc<CompiledMaskingPolicy>> {
        let versions = self.masking.get(name)?;
        as_of(&versions, at)
    }

    /// Every version of a masking policy, oldest first.
    pub fn masking_versions(&self, name: &str) -> Vec<PolicyVersion<CompiledMaskingPolicy>> {
        self.masking
            .get(name)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// Live masking policies, ordered by name.
    pub fn masking_policies(&self) -> Vec<Arc<CompiledMaskingPolicy>> {
        let mut out: Vec<_> = self
            .masking
            .iter()
            .filter_map(|e| live(e.value()).map(|v| Arc::clone(&v.policy)))
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    fn masking_targets(&self, name: &str) -> Vec<ColumnId> {
        let mut out: Vec<ColumnId> = self
            .columns
            .iter()
            .filter(|e| active(e.value()).is_some_and(|a| a.policy == name))
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    // =========================================================================
    // Row-access policies
    // =========================================================================

    /// Store a new version of a row-access policy.
    pub fn put_row_access(
        &self,
        mut compiled: CompiledRowAccessPolicy,
        replace: bool,
        at: Timestamp,
    ) -> Result<Stored<CompiledRowAccessPolicy>> {
        let name = compiled.def.name.clone();
        let attached_to = self.row_access_targets(&name);

        let mut versions = self.row_access.entry(name.clone()).or_default();
        let mut replaced = false;
        if let Some(current) = live(&versions) {
            if !replace {
                return Err(Error::PolicyExists(name));
            }
            if let Some(table) = attached_to.first() {
                if current.policy.param_types() != compiled.param_types() {
                    return Err(Error::compile(
                        &name,
                        format!("cannot change parameter types while attached to table {}", table),
                    ));
                }
            }
            replaced = true;
        }

        compiled.version = versions.last().map_or(1, |v| v.policy.version + 1);
        if let Some(current) = versions.iter_mut().rev().find(|v| v.validity.is_open()) {
            current.validity.close(at);
        }
        let policy = Arc::new(compiled);
        versions.push(PolicyVersion {
            policy: Arc::clone(&policy),
            validity: Validity::starting(at),
        });
        Ok(Stored { policy, replaced })
    }

    /// Close the live version of a row-access policy.
    pub fn drop_row_access(&self, name: &str, at: Timestamp) -> Result<()> {
        if let Some(table) = self.row_access_targets(name).into_iter().next() {
            return Err(Error::PolicyInUse {
                policy: name.to_string(),
                target: table.to_string(),
            });
        }
        let mut versions = self
            .row_access
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))?;
        let current = versions
            .iter_mut()
            .rev()
            .find(|v| v.validity.is_open())
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))?;
        current.validity.close(at);
        Ok(())
    }

    /// Live version of a row-access policy.
    pub fn current_row_access(&self, name: &str) -> Option<Arc<CompiledRowAccessPolicy>> {
        let versions = self.row_access.get(name)?;
        live(&versions).map(|v| Arc::clone(&v.policy))
    }

    /// Row-access policy version in effect at `at`.
    pub fn resolve_row_access(
        &self,
        name: &str,
        at: Timestamp,
    ) -> Option<Arc<CompiledRowAccessPolicy>> {
        let versions = self.row_access.get(name)?;
        as_of(&versions, at)
    }

    /// Live row-access policies, ordered by name.
    pub fn row_access_policies(&self) -> Vec<Arc<CompiledRowAccessPolicy>> {
        let mut out: Vec<_> = self
            .row_access
            .iter()
            .filter_map(|e| live(e.value()).map(|v| Arc::clone(&v.policy)))
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    fn row_access_targets(&self, name: &str) -> Vec<TableId> {
        let mut out: Vec<TableId> = self
            .tables
            .iter()
            .filter(|e| active(e.value()).is_some_and(|a| a.policy == name))
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Attach a masking policy to a column of type `column_type`.
    ///
    /// Attaching the policy that is already attached is a no-op. Attaching a
    /// different one closes the previous attachment at the same instant the
    /// new one opens, unless implicit replace is disabled.
    pub fn attach_masking(
        &self,
        column: &ColumnId,
        column_type: DataType,
        policy: &str,
        at: Timestamp,
    ) -> Result<PolicyAttachment> {
        let compiled = self
            .current_masking(policy)
            .ok_or_else(|| Error::UnknownPolicy(policy.to_string()))?;
        if compiled.input_type() != column_type {
            return Err(Error::compile(
                policy,
                format!(
                    "policy takes {} but column {} is {}",
                    compiled.input_type(),
                    column,
                    column_type
                ),
            ));
        }

        let mut log = self.columns.entry(column.clone()).or_default();
        let attachment = PolicyAttachment {
            target: AttachmentTarget::Column(column.clone()),
            policy: policy.to_string(),
            columns: Vec::new(),
            validity: Validity::starting(at),
        };
        self.open_attachment(&mut log, attachment)
    }

    /// Detach the active masking policy from a column.
    pub fn detach_masking(&self, column: &ColumnId, at: Timestamp) -> Result<PolicyAttachment> {
        let mut log = self
            .columns
            .get_mut(column)
            .ok_or_else(|| Error::NotAttached(column.to_string()))?;
        close_attachment(&mut log, at).ok_or_else(|| Error::NotAttached(column.to_string()))
    }

    /// Attach a row-access policy to a table, binding `columns` (with their
    /// types) to the policy parameters in order.
    pub fn attach_row_access(
        &self,
        table: &TableId,
        policy: &str,
        columns: &[(String, DataType)],
        at: Timestamp,
    ) -> Result<PolicyAttachment> {
        let compiled = self
            .current_row_access(policy)
            .ok_or_else(|| Error::UnknownPolicy(policy.to_string()))?;
        let params = &compiled.def.params;
        if params.len() != columns.len() {
            return Err(Error::compile(
                policy,
                format!(
                    "policy takes {} parameter(s) but {} column(s) were bound",
                    params.len(),
                    columns.len()
                ),
            ));
        }
        for ((param, want), (column, found)) in params.iter().zip(columns) {
            if want != found {
                return Err(Error::compile(
                    policy,
                    format!(
                        "parameter '{}' is {} but column {}.{} is {}",
                        param, want, table, column, found
                    ),
                ));
            }
        }

        let mut log = self.tables.entry(table.clone()).or_default();
        let attachment = PolicyAttachment {
            target: AttachmentTarget::Table(table.clone()),
            policy: policy.to_string(),
            columns: columns.iter().map(|(c, _)| c.clone()).collect(),
            validity: Validity::starting(at),
        };
        self.open_attachment(&mut log, attachment)
    }

    /// Detach the active row-access policy from a table.
    pub fn detach_row_access(&self, table: &TableId, at: Timestamp) -> Result<PolicyAttachment> {
        let mut log = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotAttached(table.to_string()))?;
        close_attachment(&mut log, at).ok_or_else(|| Error::NotAttached(table.to_string()))
    }

    fn open_attachment(
        &self,
        log: &mut Vec<PolicyAttachment>,
        attachment: PolicyAttachment,
    ) -> Result<PolicyAttachment> {
        let at = attachment.attached_at();
        if let Some(existing) = log.iter_mut().rev().find(|a| a.validity.is_open()) {
            if existing.policy == attachment.policy && existing.columns == attachment.columns {
                return Ok(existing.clone());
            }
            if !self.implicit_replace {
                return Err(Error::AttachmentConflict {
                    target: attachment.target.to_string(),
                    existing: existing.policy.clone(),
                });
            }
            existing.validity.close(at);
            tracing::info!(
                target_id = %attachment.target,
                previous = %existing.policy,
                policy = %attachment.policy,
                "attachment replaced"
            );
        }
        log.push(attachment.clone());
        Ok(attachment)
    }

    /// Masking attachment currently active on a column.
    pub fn active_attachment(&self, column: &ColumnId) -> Option<PolicyAttachment> {
        active(self.columns.get(column)?.value()).cloned()
    }

    /// Row-access attachment currently active on a table.
    pub fn active_row_attachment(&self, table: &TableId) -> Option<PolicyAttachment> {
        active(self.tables.get(table)?.value()).cloned()
    }

    /// Masking attachment of a column in effect at `at`.
    pub fn attachment_as_of(&self, column: &ColumnId, at: Timestamp) -> Option<PolicyAttachment> {
        let log = self.columns.get(column)?;
        log.iter().rev().find(|a| a.validity.covers(at)).cloned()
    }

    /// Row-access attachment of a table in effect at `at`.
    pub fn row_attachment_as_of(&self, table: &TableId, at: Timestamp) -> Option<PolicyAttachment> {
        let log = self.tables.get(table)?;
        log.iter().rev().find(|a| a.validity.covers(at)).cloned()
    }

    /// Full attachment log of a column, oldest first.
    pub fn history(&self, column: &ColumnId) -> Vec<PolicyAttachment> {
        self.columns
            .get(column)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Full row-access attachment log of a table, oldest first.
    pub fn table_history(&self, table: &TableId) -> Vec<PolicyAttachment> {
        self.tables
            .get(table)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }
}

fn close_attachment(log: &mut [PolicyAttachment], at: Timestamp) -> Option<PolicyAttachment> {
    let current = log.iter_mut().rev().find(|a| a.validity.is_open())?;
    current.validity.close(at);
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compile::PolicyCompiler;
    use crate::policy::definition::{MaskingPolicyDef, RowAccessPolicyDef};
    use crate::policy::expr::Expr;

    fn masking(name: &str, ty: DataType) -> CompiledMaskingPolicy {
        let def = MaskingPolicyDef::new(name, "val", ty, Expr::arg("val"));
        PolicyCompiler::default().compile_masking(&def).unwrap()
    }

    fn region_filter(name: &str) -> CompiledRowAccessPolicy {
        let def = RowAccessPolicyDef::new(
            name,
            Expr::equals(Expr::arg("region"), Expr::lit("EU")),
        )
        .with_param("region", DataType::Text);
        PolicyCompiler::default().compile_row_access(&def).unwrap()
    }

    fn email() -> ColumnId {
        ColumnId::new("users", "email")
    }

    #[test]
    fn test_create_and_replace_versions() {
        let store = PolicyStore::default();
        let v1 = store.put_masking(masking("m", DataType::Text), false, 10).unwrap();
        assert_eq!(v1.policy.version, 1);
        assert!(!v1.replaced);

        let err = store.put_masking(masking("m", DataType::Text), false, 20).unwrap_err();
        assert!(matches!(err, Error::PolicyExists(_)));

        let v2 = store.put_masking(masking("m", DataType::Text), true, 20).unwrap();
        assert_eq!(v2.policy.version, 2);
        assert!(v2.replaced);

        assert_eq!(store.resolve_masking("m", 15).unwrap().version, 1);
        assert_eq!(store.resolve_masking("m", 20).unwrap().version, 2);
        assert!(store.resolve_masking("m", 5).is_none());
        assert_eq!(store.masking_versions("m").len(), 2);

        // The Arc held by an earlier plan is still version 1.
        assert_eq!(v1.policy.version, 1);
    }

    #[test]
    fn test_drop_in_use_and_unknown() {
        let store = PolicyStore::default();
        store.put_masking(masking("m", DataType::Text), false, 10).unwrap();
        store.attach_masking(&email(), DataType::Text, "m", 11).unwrap();

        let err = store.drop_masking("m", 12).unwrap_err();
        assert!(matches!(err, Error::PolicyInUse { .. }));

        store.detach_masking(&email(), 13).unwrap();
        store.drop_masking("m", 14).unwrap();
        assert!(store.current_masking("m").is_none());
        assert!(store.resolve_masking("m", 13).is_some());

        assert!(matches!(
            store.drop_masking("m", 15),
            Err(Error::UnknownPolicy(_))
        ));
        assert!(matches!(
            store.drop_masking("nope", 15),
            Err(Error::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_attach_type_mismatch() {
        let store = PolicyStore::default();
        store.put_masking(masking("m", DataType::Number), false, 10).unwrap();
        let err = store.attach_masking(&email(), DataType::Text, "m", 11).unwrap_err();
        assert!(matches!(err, Error::PolicyCompile { .. }));
        assert!(store.history(&email()).is_empty());
    }

    #[test]
    fn test_implicit_replace_closes_previous_at_same_instant() {
        let store = PolicyStore::default();
        store.put_masking(masking("a", DataType::Text), false, 1).unwrap();
        store.put_masking(masking("b", DataType::Text), false, 2).unwrap();

        store.attach_masking(&email(), DataType::Text, "a", 10).unwrap();
        store.attach_masking(&email(), DataType::Text, "b", 20).unwrap();

        let history = store.history(&email());
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].detached_at(), Some(20));
        assert_eq!(history[1].attached_at(), 20);

        assert_eq!(store.attachment_as_of(&email(), 19).unwrap().policy, "a");
        assert_eq!(store.attachment_as_of(&email(), 20).unwrap().policy, "b");
        assert!(store.attachment_as_of(&email(), 9).is_none());
    }

    #[test]
    fn test_attach_same_policy_is_idempotent() {
        let store = PolicyStore::default();
        store.put_masking(masking("a", DataType::Text), false, 1).unwrap();
        store.attach_masking(&email(), DataType::Text, "a", 10).unwrap();
        let again = store.attach_masking(&email(), DataType::Text, "a", 20).unwrap();
        assert_eq!(again.attached_at(), 10);
        assert_eq!(store.history(&email()).len(), 1);
    }

    #[test]
    fn test_conflict_without_implicit_replace() {
        let store = PolicyStore::new(false);
        store.put_masking(masking("a", DataType::Text), false, 1).unwrap();
        store.put_masking(masking("b", DataType::Text), false, 2).unwrap();
        store.attach_masking(&email(), DataType::Text, "a", 10).unwrap();

        let err = store.attach_masking(&email(), DataType::Text, "b", 20).unwrap_err();
        assert!(matches!(err, Error::AttachmentConflict { .. }));
        assert_eq!(store.attachment_as_of(&email(), 30).unwrap().policy, "a");
    }

    #[test]
    fn test_replace_cannot_change_attached_input_type() {
        let store = PolicyStore::default();
        store.put_masking(masking("m", DataType::Text), false, 1).unwrap();
        store.attach_masking(&email(), DataType::Text, "m", 2).unwrap();
        let err = store
            .put_masking(masking("m", DataType::Number), true, 3)
            .unwrap_err();
        assert!(matches!(err, Error::PolicyCompile { .. }));
        assert_eq!(store.current_masking("m").unwrap().version, 1);
    }

    #[test]
    fn test_row_access_attachment() {
        let store = PolicyStore::default();
        let sales = TableId::new("sales");
        store.put_row_access(region_filter("eu"), false, 1).unwrap();

        let err = store
            .attach_row_access(&sales, "eu", &[("region".into(), DataType::Number)], 2)
            .unwrap_err();
        assert!(err.to_string().contains("parameter 'region'"));

        let err = store.attach_row_access(&sales, "eu", &[], 2).unwrap_err();
        assert!(err.to_string().contains("1 parameter(s)"));

        let att = store
            .attach_row_access(&sales, "eu", &[("region".into(), DataType::Text)], 3)
            .unwrap();
        assert_eq!(att.columns, vec!["region".to_string()]);
        assert!(store.row_attachment_as_of(&sales, 3).is_some());

        assert!(matches!(
            store.drop_row_access("eu", 4),
            Err(Error::PolicyInUse { .. })
        ));
        store.detach_row_access(&sales, 5).unwrap();
        assert!(store.row_attachment_as_of(&sales, 5).is_none());
        assert!(matches!(
            store.detach_row_access(&sales, 6),
            Err(Error::NotAttached(_))
        ));
        assert_eq!(store.table_history(&sales).len(), 1);
    }
}
