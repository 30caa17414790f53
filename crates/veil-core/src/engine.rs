//! Engine facade tying the catalog, role graph, policy store, and durable
//! log together.
//!
//! Administrative operations are serialized by one lock. Each is stamped by
//! the engine clock, applied in memory, and then appended to the durable log.
//! Planning and row processing never take that lock.

use crate::audit::{AuditEvent, AuditEventType, AuditLogger, NullAuditLogger};
use crate::catalog::{Catalog, ColumnId, TableDef, TableId};
use crate::config::EngineConfig;
use crate::enforce::{BatchResult, EnforcementPlanner, ExecutionHook, ObligationSet};
use crate::error::{Error, Result};
use crate::eval::{EvaluationContext, PolicyEvaluator};
use crate::persist::{DurableLog, LogRecord};
use crate::policy::{MaskingPolicyDef, PolicyCompiler, PolicyKind, PolicyStore, RowAccessPolicyDef};
use crate::role::{Grantee, Principal, RoleGraph, PUBLIC_ROLE};
use crate::value::{DataType, Value};
use crate::version::{MonotonicClock, Timestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Actor recorded in audit events for operations that do not name one.
pub const SYSTEM_ACTOR: &str = "system";

/// The masking and row-access engine.
pub struct Engine {
    config: EngineConfig,
    catalog: Catalog,
    roles: RoleGraph,
    store: PolicyStore,
    compiler: PolicyCompiler,
    evaluator: PolicyEvaluator,
    clock: MonotonicClock,
    log: Option<DurableLog>,
    audit: Arc<dyn AuditLogger>,
    statements: AtomicU64,
    admin: Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("log", &self.log)
            .field("statements", &self.statements.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.audit.flush() {
            tracing::warn!(error = %e, "failed to flush audit log");
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.flush() {
                tracing::warn!(error = %e, "failed to flush durable log");
            }
        }
    }
}

impl Engine {
    /// Create an in-memory engine. `config.data_path` is ignored.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            catalog: Catalog::new(),
            roles: RoleGraph::new(),
            store: PolicyStore::new(config.implicit_replace),
            compiler: PolicyCompiler::new(config.max_expression_depth),
            evaluator: PolicyEvaluator::new(),
            clock: MonotonicClock::new(),
            log: None,
            audit: Arc::new(NullAuditLogger),
            statements: AtomicU64::new(0),
            admin: Mutex::new(()),
            config,
        }
    }

    /// Open an engine backed by the durable log at `config.data_path`,
    /// replaying every logged operation. Without a data path this is the
    /// same as [`Engine::new`].
    pub fn open(config: EngineConfig) -> Result<Self> {
        let log = match &config.data_path {
            Some(path) => Some(DurableLog::open(path)?),
            None => None,
        };
        let mut engine = Self::new(config);
        if let Some(log) = log {
            let entries = log.entries()?;
            for entry in &entries {
                engine.clock.observe(entry.at);
                engine.apply(&entry.record, entry.at, false)?;
            }
            tracing::info!(entries = entries.len(), "durable log replayed");
            engine.log = Some(log);
        }
        Ok(engine)
    }

    /// Route audit events to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Table registry.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Role graph.
    pub fn roles(&self) -> &RoleGraph {
        &self.roles
    }

    /// Policy store.
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Current engine time. Every completed admin operation is at or before it.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Register or redefine a table.
    pub fn register_table(&self, table: TableDef) -> Result<()> {
        self.execute(LogRecord::RegisterTable(table)).map(|_| ())
    }

    /// Create a role.
    pub fn create_role(&self, name: &str, owner: Option<&str>) -> Result<()> {
        self.execute(LogRecord::CreateRole {
            name: name.to_string(),
            owner: owner.map(str::to_string),
        })
        .map(|_| ())
    }

    /// Grant `role` to a user or role.
    pub fn grant_role(&self, grantee: Grantee, role: &str, granted_by: &str) -> Result<()> {
        self.execute(LogRecord::Grant {
            grantee,
            role: role.to_string(),
            granted_by: granted_by.to_string(),
        })
        .map(|_| ())
    }

    /// Revoke an active grant.
    pub fn revoke_role(&self, grantee: Grantee, role: &str, revoked_by: &str) -> Result<()> {
        self.execute(LogRecord::Revoke {
            grantee,
            role: role.to_string(),
            revoked_by: revoked_by.to_string(),
        })
        .map(|_| ())
    }

    /// Create a masking policy, or a new version of it with `replace`.
    /// Returns the stored version number.
    pub fn create_masking_policy(&self, def: MaskingPolicyDef, replace: bool) -> Result<u64> {
        self.execute(LogRecord::CreateMaskingPolicy { def, replace })
            .map(|version| version.unwrap_or_default())
    }

    /// Create a row-access policy, or a new version of it with `replace`.
    /// Returns the stored version number.
    pub fn create_row_access_policy(&self, def: RowAccessPolicyDef, replace: bool) -> Result<u64> {
        self.execute(LogRecord::CreateRowAccessPolicy { def, replace })
            .map(|version| version.unwrap_or_default())
    }

    /// Drop a policy by name. A live masking policy of that name is dropped
    /// in preference to a row-access policy. Returns the kind dropped.
    pub fn drop_policy(&self, name: &str) -> Result<PolicyKind> {
        let kind = if self.store.current_masking(name).is_some() {
            PolicyKind::Masking
        } else if self.store.current_row_access(name).is_some() {
            PolicyKind::RowAccess
        } else {
            return Err(Error::UnknownPolicy(name.to_string()));
        };
        self.drop_policy_of_kind(kind, name)?;
        Ok(kind)
    }

    /// Drop a policy of a specific kind.
    pub fn drop_policy_of_kind(&self, kind: PolicyKind, name: &str) -> Result<()> {
        self.execute(LogRecord::DropPolicy {
            kind,
            name: name.to_string(),
        })
        .map(|_| ())
    }

    /// Attach a masking policy to a column.
    pub fn attach_masking_policy(&self, column: &ColumnId, policy: &str) -> Result<()> {
        self.execute(LogRecord::AttachMasking {
            column: column.clone(),
            policy: policy.to_string(),
        })
        .map(|_| ())
    }

    /// Detach the masking policy from a column.
    pub fn detach_masking_policy(&self, column: &ColumnId) -> Result<()> {
        self.execute(LogRecord::DetachMasking {
            column: column.clone(),
        })
        .map(|_| ())
    }

    /// Attach a row-access policy to a table, binding `columns` to its
    /// parameters in order.
    pub fn attach_row_access_policy<I, S>(
        &self,
        table: &TableId,
        policy: &str,
        columns: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute(LogRecord::AttachRowAccess {
            table: table.clone(),
            policy: policy.to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
        })
        .map(|_| ())
    }

    /// Detach the row-access policy from a table.
    pub fn detach_row_access_policy(&self, table: &TableId) -> Result<()> {
        self.execute(LogRecord::DetachRowAccess {
            table: table.clone(),
        })
        .map(|_| ())
    }

    fn execute(&self, record: LogRecord) -> Result<Option<u64>> {
        let _guard = self.admin.lock();
        let at = self.clock.tick();
        let version = self.apply(&record, at, true)?;
        if let Some(log) = &self.log {
            log.append(at, &record)?;
        }
        Ok(version)
    }

    /// Apply one operation at `at`. Returns the version for policy creation.
    fn apply(&self, record: &LogRecord, at: Timestamp, audit: bool) -> Result<Option<u64>> {
        let mut version = None;
        let event = match record {
            LogRecord::RegisterTable(table) => {
                self.check_redefinition(table)?;
                self.catalog.register(table.clone());
                tracing::info!(
                    table = %table.id,
                    columns = table.columns.len(),
                    "table registered"
                );
                None
            }
            LogRecord::CreateRole { name, owner } => {
                self.roles.create_role(name.as_str(), owner.clone(), at)?;
                None
            }
            LogRecord::Grant {
                grantee,
                role,
                granted_by,
            } => {
                self.roles.grant(grantee.clone(), role, granted_by.as_str(), at)?;
                Some(AuditEvent::new(
                    granted_by.as_str(),
                    AuditEventType::RoleGranted {
                        grantee: grantee.to_string(),
                        role: role.clone(),
                    },
                ))
            }
            LogRecord::Revoke {
                grantee,
                role,
                revoked_by,
            } => {
                self.roles.revoke(grantee, role, at)?;
                Some(AuditEvent::new(
                    revoked_by.as_str(),
                    AuditEventType::RoleRevoked {
                        grantee: grantee.to_string(),
                        role: role.clone(),
                    },
                ))
            }
            LogRecord::CreateMaskingPolicy { def, replace } => {
                let compiled = self.compiler.compile_masking(def)?;
                let stored = self.store.put_masking(compiled, *replace, at)?;
                version = Some(stored.policy.version);
                tracing::info!(
                    policy = %def.name,
                    version = stored.policy.version,
                    replaced = stored.replaced,
                    "masking policy stored"
                );
                Some(policy_event(
                    PolicyKind::Masking,
                    &def.name,
                    stored.policy.version,
                    stored.replaced,
                ))
            }
            LogRecord::CreateRowAccessPolicy { def, replace } => {
                let compiled = self.compiler.compile_row_access(def)?;
                let stored = self.store.put_row_access(compiled, *replace, at)?;
                version = Some(stored.policy.version);
                tracing::info!(
                    policy = %def.name,
                    version = stored.policy.version,
                    replaced = stored.replaced,
                    "row access policy stored"
                );
                Some(policy_event(
                    PolicyKind::RowAccess,
                    &def.name,
                    stored.policy.version,
                    stored.replaced,
                ))
            }
            LogRecord::DropPolicy { kind, name } => {
                match kind {
                    PolicyKind::Masking => self.store.drop_masking(name, at)?,
                    PolicyKind::RowAccess => self.store.drop_row_access(name, at)?,
                }
                tracing::info!(policy = %name, kind = %kind, "policy dropped");
                Some(AuditEvent::new(
                    SYSTEM_ACTOR,
                    AuditEventType::PolicyDropped {
                        kind: *kind,
                        policy: name.clone(),
                    },
                ))
            }
            LogRecord::AttachMasking { column, policy } => {
                let ty = self.catalog.column_type(column)?;
                self.store.attach_masking(column, ty, policy, at)?;
                tracing::info!(column = %column, policy = %policy, "masking policy attached");
                Some(AuditEvent::new(
                    SYSTEM_ACTOR,
                    AuditEventType::PolicyAttached {
                        target: column.to_string(),
                        policy: policy.clone(),
                    },
                ))
            }
            LogRecord::DetachMasking { column } => {
                let detached = self.store.detach_masking(column, at)?;
                tracing::info!(
                    column = %column,
                    policy = %detached.policy,
                    "masking policy detached"
                );
                Some(AuditEvent::new(
                    SYSTEM_ACTOR,
                    AuditEventType::PolicyDetached {
                        target: column.to_string(),
                        policy: detached.policy,
                    },
                ))
            }
            LogRecord::AttachRowAccess {
                table,
                policy,
                columns,
            } => {
                self.catalog.table(table)?;
                let typed = columns
                    .iter()
                    .map(|c| -> Result<(String, DataType)> {
                        let id = ColumnId::new(table.as_str(), c.as_str());
                        let ty = self.catalog.column_type(&id)?;
                        Ok((c.clone(), ty))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.store.attach_row_access(table, policy, &typed, at)?;
                tracing::info!(table = %table, policy = %policy, "row access policy attached");
                Some(AuditEvent::new(
                    SYSTEM_ACTOR,
                    AuditEventType::PolicyAttached {
                        target: table.to_string(),
                        policy: policy.clone(),
                    },
                ))
            }
            LogRecord::DetachRowAccess { table } => {
                let detached = self.store.detach_row_access(table, at)?;
                tracing::info!(
                    table = %table,
                    policy = %detached.policy,
                    "row access policy detached"
                );
                Some(AuditEvent::new(
                    SYSTEM_ACTOR,
                    AuditEventType::PolicyDetached {
                        target: table.to_string(),
                        policy: detached.policy,
                    },
                ))
            }
        };

        if audit {
            if let Some(event) = event {
                self.audit.log(event.at(at));
            }
        }
        Ok(version)
    }

    /// A redefined table must keep every column an active policy reads,
    /// with the same type.
    fn check_redefinition(&self, table: &TableDef) -> Result<()> {
        let Ok(existing) = self.catalog.table(&table.id) else {
            return Ok(());
        };
        let check = |column: &str, policy: &str| -> Result<()> {
            let Some(before) = existing.column_type(column) else {
                return Ok(());
            };
            match table.column_type(column) {
                Some(after) if after == before => Ok(()),
                Some(after) => Err(Error::compile(
                    policy,
                    format!(
                        "column {}.{} is bound to this policy and cannot change from {} to {}",
                        table.id, column, before, after
                    ),
                )),
                None => Err(Error::compile(
                    policy,
                    format!(
                        "column {}.{} is bound to this policy and cannot be removed",
                        table.id, column
                    ),
                )),
            }
        };
        for (column, _) in &existing.columns {
            let id = ColumnId::new(table.id.as_str(), column.as_str());
            if let Some(attachment) = self.store.active_attachment(&id) {
                check(column, &attachment.policy)?;
            }
        }
        if let Some(attachment) = self.store.active_row_attachment(&table.id) {
            for column in &attachment.columns {
                check(column, &attachment.policy)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Start a session for `user` with `default_role` as its primary role.
    ///
    /// If the user does not hold the default role the session starts with
    /// PUBLIC instead.
    pub fn session(&self, user: &str, default_role: &str) -> Principal {
        if self.roles.role_exists(default_role) && self.roles.holds(user, default_role) {
            Principal::new(user, default_role)
        } else {
            tracing::debug!(
                user = %user,
                role = %default_role,
                "default role not held, using PUBLIC"
            );
            Principal::new(user, PUBLIC_ROLE)
        }
    }

    /// Replace the session's primary role.
    pub fn use_role(&self, principal: &mut Principal, role: &str) -> Result<()> {
        self.roles.use_role(principal, role)
    }

    /// Activate an additional role in the session.
    pub fn activate_secondary(&self, principal: &mut Principal, role: &str) -> Result<()> {
        self.roles.activate_secondary(principal, role)
    }

    /// Capture an evaluation context for a new statement.
    ///
    /// `as_of` selects the point in time policies and attachments are
    /// resolved at; `None` means now.
    pub fn context(&self, principal: &Principal, as_of: Option<Timestamp>) -> EvaluationContext {
        let statement_id = self.statements.fetch_add(1, Ordering::Relaxed) + 1;
        let now = self.clock.now();
        EvaluationContext::capture(statement_id, &self.roles, principal, as_of.unwrap_or(now), now)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Plan a statement for a principal.
    pub fn prepare(
        &self,
        principal: &Principal,
        columns: &[ColumnId],
        tables: &[TableId],
        as_of: Option<Timestamp>,
    ) -> Result<PreparedStatement> {
        let ctx = self.context(principal, as_of);
        self.prepare_with(ctx, columns, tables)
    }

    /// Plan a statement under an already captured context, for example one
    /// carrying session attributes.
    pub fn prepare_with(
        &self,
        ctx: EvaluationContext,
        columns: &[ColumnId],
        tables: &[TableId],
    ) -> Result<PreparedStatement> {
        let ctx = Arc::new(ctx);
        let obligations = EnforcementPlanner::new(&self.catalog, &self.store)
            .with_evaluator(self.evaluator)
            .plan(columns, tables, Arc::clone(&ctx))?;

        self.audit.log(AuditEvent::new(
            ctx.user.as_str(),
            AuditEventType::StatementPlanned {
                statement_id: ctx.statement_id,
                masked_columns: obligations.masks.len(),
                row_filters: obligations.row_filters.len(),
            },
        ));

        let obligations = Arc::new(obligations);
        let hook = ExecutionHook::new(Arc::clone(&obligations))
            .with_parallel_threshold(self.config.parallel_threshold);
        Ok(PreparedStatement {
            context: ctx,
            obligations,
            hook,
            workers: self.config.hook_workers,
            audit: Arc::clone(&self.audit),
        })
    }
}

fn policy_event(kind: PolicyKind, name: &str, version: u64, replaced: bool) -> AuditEvent {
    let policy = name.to_string();
    let event_type = if replaced {
        AuditEventType::PolicyReplaced { kind, policy, version }
    } else {
        AuditEventType::PolicyCreated { kind, policy, version }
    };
    AuditEvent::new(SYSTEM_ACTOR, event_type)
}

/// A planned statement, ready to process rows.
///
/// Holds the policy versions resolved at plan time, so later replaces,
/// detaches, and revokes do not affect it.
pub struct PreparedStatement {
    /// Context captured at plan time.
    pub context: Arc<EvaluationContext>,
    /// Obligations computed for the statement.
    pub obligations: Arc<ObligationSet>,
    /// Hook enforcing the obligations.
    pub hook: ExecutionHook,
    workers: usize,
    audit: Arc<dyn AuditLogger>,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("statement_id", &self.context.statement_id)
            .field("obligations", &self.obligations)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl PreparedStatement {
    /// Columns the caller must supply for each input row, in order.
    pub fn input_columns(&self) -> &[ColumnId] {
        &self.obligations.input_columns
    }

    /// Process a batch of input rows.
    pub fn run(&self, rows: Vec<Vec<Value>>) -> BatchResult {
        let result = self.hook.apply_parallel(rows, self.workers);
        if !result.faults.is_empty() {
            self.audit.log(AuditEvent::new(
                self.context.user.as_str(),
                AuditEventType::FaultsContained {
                    statement_id: self.context.statement_id,
                    total: result.faults.total,
                    by_target: result
                        .faults
                        .by_target
                        .iter()
                        .map(|(t, n)| (t.clone(), *n))
                        .collect(),
                },
            ));
        }
        result
    }
}
