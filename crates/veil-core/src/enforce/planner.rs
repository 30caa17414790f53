//! Per-statement enforcement planning.
//!
//! The planner decides which masks and row filters apply to a statement and
//! pre-evaluates everything about them that depends only on the session.

use crate::catalog::{Catalog, ColumnId, TableId};
use crate::error::{Error, Result};
use crate::eval::{EvaluationContext, PolicyEvaluator};
use crate::policy::compile::{CompiledMaskingPolicy, CompiledRowAccessPolicy, Node};
use crate::policy::store::PolicyStore;
use crate::value::DataType;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Masking applied to one projected column.
#[derive(Debug, Clone)]
pub struct MaskObligation {
    /// Position of the column in both the input and the output row.
    pub index: usize,
    /// Masked column.
    pub column: ColumnId,
    /// Policy version resolved at plan time.
    pub policy: Arc<CompiledMaskingPolicy>,
    /// Body specialized for the statement's context.
    pub residual: Node,
}

impl MaskObligation {
    /// Whether the mask returns its input unchanged for this statement.
    pub fn is_identity(&self) -> bool {
        self.residual == Node::Arg(0) && self.policy.input_type() == self.policy.output_type()
    }
}

/// Row filter applied to one referenced table.
#[derive(Debug, Clone)]
pub struct RowObligation {
    /// Filtered table.
    pub table: TableId,
    /// Policy version resolved at plan time.
    pub policy: Arc<CompiledRowAccessPolicy>,
    /// Input row positions bound to the policy parameters, in order.
    pub arg_indices: Vec<usize>,
    /// Declared parameter types, in order.
    pub param_types: Vec<DataType>,
    /// Predicate specialized for the statement's context.
    pub residual: Node,
}

/// Everything the execution hook needs to enforce policies on a statement.
///
/// Input rows carry the projected columns first, followed by any extra
/// columns a row filter reads. Output rows carry only the projected columns.
#[derive(Debug, Clone)]
pub struct ObligationSet {
    /// Context the obligations were specialized for.
    pub context: Arc<EvaluationContext>,
    /// Columns of an input row, in order.
    pub input_columns: Vec<ColumnId>,
    /// Number of projected columns.
    pub output_len: usize,
    /// Row filters, applied before any mask.
    pub row_filters: Vec<RowObligation>,
    /// Column masks, applied to rows that pass every filter.
    pub masks: Vec<MaskObligation>,
    /// Evaluator shared by all rows.
    pub evaluator: PolicyEvaluator,
}

impl ObligationSet {
    /// Check whether no policy applies to the statement.
    pub fn is_pass_through(&self) -> bool {
        self.row_filters.is_empty() && self.masks.is_empty()
    }

    /// Projected columns, in output order.
    pub fn output_columns(&self) -> &[ColumnId] {
        &self.input_columns[..self.output_len]
    }

    /// Columns the caller must fetch beyond the projection.
    pub fn hidden_columns(&self) -> &[ColumnId] {
        &self.input_columns[self.output_len..]
    }
}

/// Computes [`ObligationSet`]s against a catalog and policy store.
#[derive(Debug, Clone, Copy)]
pub struct EnforcementPlanner<'a> {
    catalog: &'a Catalog,
    store: &'a PolicyStore,
    evaluator: PolicyEvaluator,
}

impl<'a> EnforcementPlanner<'a> {
    /// Create a planner.
    pub fn new(catalog: &'a Catalog, store: &'a PolicyStore) -> Self {
        Self {
            catalog,
            store,
            evaluator: PolicyEvaluator::new(),
        }
    }

    /// Use a specific evaluator.
    pub fn with_evaluator(mut self, evaluator: PolicyEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Plan a statement projecting `columns` and referencing `tables`.
    ///
    /// Tables owning a projected column are referenced implicitly. Policies
    /// and attachments are resolved at `ctx.as_of`.
    pub fn plan(
        &self,
        columns: &[ColumnId],
        tables: &[TableId],
        ctx: Arc<EvaluationContext>,
    ) -> Result<ObligationSet> {
        let at = ctx.as_of;

        for column in columns {
            self.catalog.column_type(column)?;
        }
        let mut referenced: BTreeSet<TableId> = BTreeSet::new();
        for table in tables {
            self.catalog.table(table)?;
            referenced.insert(table.clone());
        }
        referenced.extend(columns.iter().map(|c| c.table.clone()));

        let mut input_columns = columns.to_vec();
        let mut row_filters = Vec::new();
        for table in &referenced {
            let Some(attachment) = self.store.row_attachment_as_of(table, at) else {
                continue;
            };
            let policy = self
                .store
                .resolve_row_access(&attachment.policy, at)
                .ok_or_else(|| Error::UnknownPolicy(attachment.policy.clone()))?;

            let mut arg_indices = Vec::with_capacity(attachment.columns.len());
            for name in &attachment.columns {
                let column = ColumnId::new(table.as_str(), name.as_str());
                self.catalog.column_type(&column)?;
                let index = match input_columns.iter().position(|c| c == &column) {
                    Some(i) => i,
                    None => {
                        input_columns.push(column);
                        input_columns.len() - 1
                    }
                };
                arg_indices.push(index);
            }

            let residual = self.evaluator.specialize(&policy.body, &ctx);
            row_filters.push(RowObligation {
                table: table.clone(),
                param_types: policy.param_types(),
                policy,
                arg_indices,
                residual,
            });
        }

        let mut masks = Vec::new();
        for (index, column) in columns.iter().enumerate() {
            let Some(attachment) = self.store.attachment_as_of(column, at) else {
                continue;
            };
            let policy = self
                .store
                .resolve_masking(&attachment.policy, at)
                .ok_or_else(|| Error::UnknownPolicy(attachment.policy.clone()))?;
            let residual = self.evaluator.specialize(&policy.body, &ctx);
            masks.push(MaskObligation {
                index,
                column: column.clone(),
                policy,
                residual,
            });
        }

        tracing::debug!(
            statement = ctx.statement_id,
            user = %ctx.user,
            role = %ctx.primary_role,
            masks = masks.len(),
            row_filters = row_filters.len(),
            hidden_columns = input_columns.len() - columns.len(),
            "statement planned"
        );

        Ok(ObligationSet {
            context: ctx,
            input_columns,
            output_len: columns.len(),
            row_filters,
            masks,
            evaluator: self.evaluator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableDef;
    use crate::policy::compile::PolicyCompiler;
    use crate::policy::definition::{MaskingPolicyDef, RowAccessPolicyDef};
    use crate::policy::expr::Expr;
    use crate::value::Value;

    fn setup() -> (Catalog, PolicyStore) {
        let catalog = Catalog::new();
        catalog.register(
            TableDef::new("employees")
                .with_column("id", DataType::Number)
                .with_column("salary", DataType::Number)
                .with_column("region", DataType::Text),
        );
        let store = PolicyStore::default();
        let compiler = PolicyCompiler::default();

        let mask = MaskingPolicyDef::new(
            "salary_mask",
            "val",
            DataType::Number,
            Expr::case(Expr::role_in_session("HR_ADMIN"), Expr::arg("val"), Expr::null()),
        );
        store
            .put_masking(compiler.compile_masking(&mask).unwrap(), false, 1)
            .unwrap();
        store
            .attach_masking(
                &ColumnId::new("employees", "salary"),
                DataType::Number,
                "salary_mask",
                2,
            )
            .unwrap();

        let filter = RowAccessPolicyDef::new(
            "eu_only",
            Expr::equals(Expr::arg("r"), Expr::lit("EU")),
        )
        .with_param("r", DataType::Text);
        store
            .put_row_access(compiler.compile_row_access(&filter).unwrap(), false, 3)
            .unwrap();
        (catalog, store)
    }

    fn ctx(role: &str, as_of: u64) -> Arc<EvaluationContext> {
        let mut ctx = EvaluationContext::for_roles("u", role, Vec::<String>::new());
        ctx.as_of = as_of;
        Arc::new(ctx)
    }

    #[test]
    fn test_unattached_columns_pass_through() {
        let (catalog, store) = setup();
        let planner = EnforcementPlanner::new(&catalog, &store);
        let plan = planner
            .plan(&[ColumnId::new("employees", "id")], &[], ctx("ANALYST", 10))
            .unwrap();
        assert!(plan.is_pass_through());
        assert_eq!(plan.output_len, 1);
    }

    #[test]
    fn test_mask_residual_depends_on_role() {
        let (catalog, store) = setup();
        let planner = EnforcementPlanner::new(&catalog, &store);
        let cols = [
            ColumnId::new("employees", "id"),
            ColumnId::new("employees", "salary"),
        ];

        let plan = planner.plan(&cols, &[], ctx("HR_ADMIN", 10)).unwrap();
        assert_eq!(plan.masks.len(), 1);
        assert_eq!(plan.masks[0].index, 1);
        assert!(plan.masks[0].is_identity());

        let plan = planner.plan(&cols, &[], ctx("ANALYST", 10)).unwrap();
        assert_eq!(plan.masks[0].residual, Node::Const(Value::Null));
        assert!(!plan.masks[0].is_identity());
    }

    #[test]
    fn test_row_filter_adds_hidden_column() {
        let (catalog, store) = setup();
        store
            .attach_row_access(
                &TableId::new("employees"),
                "eu_only",
                &[("region".into(), DataType::Text)],
                4,
            )
            .unwrap();
        let planner = EnforcementPlanner::new(&catalog, &store);
        let plan = planner
            .plan(&[ColumnId::new("employees", "salary")], &[], ctx("ANALYST", 10))
            .unwrap();

        assert_eq!(plan.row_filters.len(), 1);
        assert_eq!(plan.output_columns(), &[ColumnId::new("employees", "salary")]);
        assert_eq!(plan.hidden_columns(), &[ColumnId::new("employees", "region")]);
        assert_eq!(plan.row_filters[0].arg_indices, vec![1]);
    }

    #[test]
    fn test_projected_filter_column_is_reused() {
        let (catalog, store) = setup();
        store
            .attach_row_access(
                &TableId::new("employees"),
                "eu_only",
                &[("region".into(), DataType::Text)],
                4,
            )
            .unwrap();
        let planner = EnforcementPlanner::new(&catalog, &store);
        let plan = planner
            .plan(&[ColumnId::new("employees", "region")], &[], ctx("ANALYST", 10))
            .unwrap();
        assert!(plan.hidden_columns().is_empty());
        assert_eq!(plan.row_filters[0].arg_indices, vec![0]);
    }

    #[test]
    fn test_time_travel_uses_attachment_as_of() {
        let (catalog, store) = setup();
        let planner = EnforcementPlanner::new(&catalog, &store);
        let salary = [ColumnId::new("employees", "salary")];
        let before = planner.plan(&salary, &[], ctx("ANALYST", 1)).unwrap();
        assert!(before.masks.is_empty());
        let after = planner.plan(&salary, &[], ctx("ANALYST", 2)).unwrap();
        assert_eq!(after.masks.len(), 1);
    }

    #[test]
    fn test_unknown_references() {
        let (catalog, store) = setup();
        let planner = EnforcementPlanner::new(&catalog, &store);
        let err = planner
            .plan(&[ColumnId::new("employees", "ssn")], &[], ctx("R", 10))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownColumn(_)));
        let err = planner
            .plan(&[], &[TableId::new("payroll")], ctx("R", 10))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTable(_)));
    }
}
