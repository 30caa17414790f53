//! Row-by-row application of an [`ObligationSet`].

use super::planner::ObligationSet;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fault target used when an input row has the wrong number of columns.
pub const ROW_SHAPE_TARGET: &str = "<row>";

/// What happened to one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// Row passed every filter; values are masked and trimmed to the projection.
    Emitted(Vec<Value>),
    /// Row was excluded by a filter or a filter fault.
    Suppressed,
}

/// Contained evaluation faults, counted by column or table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultSummary {
    /// Total number of faults.
    pub total: u64,
    /// Fault counts keyed by column (`table.column`) or table name.
    pub by_target: BTreeMap<String, u64>,
}

impl FaultSummary {
    /// Check if no fault occurred.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Count one fault against a target.
    pub fn record(&mut self, target: impl Into<String>) {
        self.total += 1;
        *self.by_target.entry(target.into()).or_insert(0) += 1;
    }

    /// Add another summary into this one.
    pub fn merge(&mut self, other: FaultSummary) {
        self.total += other.total;
        for (target, count) in other.by_target {
            *self.by_target.entry(target).or_insert(0) += count;
        }
    }
}

/// Result of applying the hook to one row.
#[derive(Debug, Clone, PartialEq)]
pub struct HookOutput {
    /// Emitted or suppressed.
    pub outcome: RowOutcome,
    /// Faults contained while processing the row.
    pub faults: FaultSummary,
}

/// Result of applying the hook to a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Emitted rows, in input order.
    pub rows: Vec<Vec<Value>>,
    /// Number of suppressed rows.
    pub suppressed: usize,
    /// Faults contained across the batch.
    pub faults: FaultSummary,
}

impl BatchResult {
    fn merge(&mut self, other: BatchResult) {
        self.rows.extend(other.rows);
        self.suppressed += other.suppressed;
        self.faults.merge(other.faults);
    }
}

/// Applies row filters and masks to rows fetched by the host engine.
///
/// Holds no mutable state, so one hook can be shared by any number of
/// threads.
#[derive(Debug, Clone)]
pub struct ExecutionHook {
    obligations: Arc<ObligationSet>,
    parallel_threshold: usize,
}

impl ExecutionHook {
    /// Create a hook for a planned statement.
    pub fn new(obligations: Arc<ObligationSet>) -> Self {
        Self {
            obligations,
            parallel_threshold: crate::config::DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// Batches smaller than `rows` are processed on the calling thread by
    /// [`ExecutionHook::apply_parallel`].
    pub fn with_parallel_threshold(mut self, rows: usize) -> Self {
        self.parallel_threshold = rows;
        self
    }

    /// Obligations this hook enforces.
    pub fn obligations(&self) -> &ObligationSet {
        &self.obligations
    }

    /// Apply filters then masks to one row.
    pub fn apply(&self, row: Vec<Value>) -> HookOutput {
        let mut faults = FaultSummary::default();
        let outcome = match self.process(row, &mut faults) {
            Some(row) => RowOutcome::Emitted(row),
            None => RowOutcome::Suppressed,
        };
        HookOutput { outcome, faults }
    }

    /// Apply the hook to a batch on the calling thread.
    pub fn apply_batch(&self, rows: Vec<Vec<Value>>) -> BatchResult {
        let result = self.process_all(rows);
        self.report(&result);
        result
    }

    /// Apply the hook to a batch split across up to `workers` scoped threads.
    ///
    /// Output order matches input order.
    pub fn apply_parallel(&self, rows: Vec<Vec<Value>>, workers: usize) -> BatchResult {
        if workers <= 1 || rows.len() < self.parallel_threshold.max(2) {
            return self.apply_batch(rows);
        }

        let chunk_len = rows.len().div_ceil(workers);
        let mut chunks = Vec::with_capacity(workers);
        let mut rest = rows;
        while rest.len() > chunk_len {
            let tail = rest.split_off(chunk_len);
            chunks.push(rest);
            rest = tail;
        }
        chunks.push(rest);

        let mut result = BatchResult::default();
        std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| scope.spawn(move || self.process_all(chunk)))
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(part) => result.merge(part),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });

        self.report(&result);
        result
    }

    fn process_all(&self, rows: Vec<Vec<Value>>) -> BatchResult {
        let mut result = BatchResult {
            rows: Vec::with_capacity(rows.len()),
            ..BatchResult::default()
        };
        for row in rows {
            match self.process(row, &mut result.faults) {
                Some(row) => result.rows.push(row),
                None => result.suppressed += 1,
            }
        }
        result
    }

    fn process(&self, mut row: Vec<Value>, faults: &mut FaultSummary) -> Option<Vec<Value>> {
        let ob = &*self.obligations;
        let ctx = &*ob.context;

        if row.len() != ob.input_columns.len() {
            faults.record(ROW_SHAPE_TARGET);
            return None;
        }

        for filter in &ob.row_filters {
            let args: Vec<Value> = filter.arg_indices.iter().map(|&i| row[i].clone()).collect();
            match ob
                .evaluator
                .filter_with(&filter.residual, &filter.param_types, &args, ctx)
            {
                Ok(true) => {}
                Ok(false) => return None,
                Err(fault) => {
                    tracing::trace!(table = %filter.table, %fault, "row filter fault");
                    faults.record(filter.table.to_string());
                    return None;
                }
            }
        }

        row.truncate(ob.output_len);
        for mask in &ob.masks {
            let raw = std::mem::replace(&mut row[mask.index], Value::Null);
            match ob.evaluator.mask_with(
                &mask.residual,
                mask.policy.input_type(),
                mask.policy.output_type(),
                &raw,
                ctx,
            ) {
                Ok(value) => row[mask.index] = value,
                Err(fault) => {
                    tracing::trace!(column = %mask.column, %fault, "mask fault");
                    faults.record(mask.column.to_string());
                }
            }
        }
        Some(row)
    }

    fn report(&self, result: &BatchResult) {
        if result.faults.is_empty() {
            return;
        }
        tracing::warn!(
            statement = self.obligations.context.statement_id,
            faults = result.faults.total,
            targets = ?result.faults.by_target,
            "contained evaluation faults"
        );
    }
}
