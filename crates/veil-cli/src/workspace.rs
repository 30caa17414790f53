//! JSON workspace files: tables, roles, grants, policies, and attachments.

use crate::error::{CliError, Result};
use serde::Deserialize;
use std::path::Path;
use veil_core::{
    ColumnId, DataType, Engine, Grantee, MaskingPolicyDef, PolicyCompiler, RowAccessPolicyDef,
    TableDef, TableId,
};
use veil_lang::PolicyParser;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workspace {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    #[serde(default)]
    pub grants: Vec<GrantSpec>,
    #[serde(default)]
    pub masking_policies: Vec<MaskingSpec>,
    #[serde(default)]
    pub row_access_policies: Vec<RowAccessSpec>,
    #[serde(default)]
    pub attachments: Vec<AttachmentSpec>,
    #[serde(default)]
    pub row_attachments: Vec<RowAttachmentSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
}

/// `{"role": "R", "to_user": "u"}` or `{"role": "R", "to_role": "P"}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantSpec {
    pub role: String,
    #[serde(default)]
    pub to_user: Option<String>,
    #[serde(default)]
    pub to_role: Option<String>,
}

impl GrantSpec {
    fn grantee(&self) -> Result<Grantee> {
        match (&self.to_user, &self.to_role) {
            (Some(user), None) => Ok(Grantee::user(user.as_str())),
            (None, Some(role)) => Ok(Grantee::role(role.as_str())),
            _ => Err(CliError::Invalid(format!(
                "grant of {} needs exactly one of to_user or to_role",
                self.role
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaskingSpec {
    pub name: String,
    pub arg: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub returns: Option<String>,
    pub body: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub or_replace: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowAccessSpec {
    pub name: String,
    pub params: Vec<ColumnSpec>,
    pub body: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub or_replace: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentSpec {
    /// `table.column`.
    pub column: String,
    pub policy: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowAttachmentSpec {
    pub table: String,
    pub policy: String,
    pub columns: Vec<String>,
}

/// Counts of what an apply changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub tables: usize,
    pub roles: usize,
    pub grants: usize,
    pub policies: usize,
    pub attachments: usize,
}

fn parse_type(name: &str, what: &str) -> Result<DataType> {
    DataType::parse(name)
        .ok_or_else(|| CliError::Invalid(format!("{}: unknown type '{}'", what, name)))
}

fn parse_column(qualified: &str) -> Result<ColumnId> {
    ColumnId::parse(qualified).ok_or_else(|| {
        CliError::Invalid(format!("column '{}' must be written table.column", qualified))
    })
}

fn body_error(policy: &str, source: &str, err: veil_lang::LangError) -> CliError {
    CliError::Body {
        policy: policy.to_string(),
        rendered: err.format_with_source(source),
    }
}

impl Workspace {
    /// Read a workspace file.
    pub fn load(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CliError::Json {
            path: display,
            source,
        })
    }

    pub fn table_defs(&self) -> Result<Vec<TableDef>> {
        self.tables
            .iter()
            .map(|t| {
                let init = TableDef::new(t.name.as_str());
                t.columns.iter().try_fold(init, |def, c| -> Result<TableDef> {
                    let what = format!("{}.{}", t.name, c.name);
                    Ok(def.with_column(c.name.as_str(), parse_type(&c.ty, &what)?))
                })
            })
            .collect()
    }

    pub fn masking_def(spec: &MaskingSpec, parser: PolicyParser) -> Result<MaskingPolicyDef> {
        let input = parse_type(&spec.ty, &spec.name)?;
        let mut def = parser
            .masking_policy(&spec.name, &spec.arg, input, &spec.body)
            .map_err(|e| body_error(&spec.name, &spec.body, e))?;
        if let Some(returns) = &spec.returns {
            def = def.returning(parse_type(returns, &spec.name)?);
        }
        if let Some(comment) = &spec.comment {
            def = def.with_comment(comment.as_str());
        }
        Ok(def)
    }

    pub fn row_access_def(
        spec: &RowAccessSpec,
        parser: PolicyParser,
    ) -> Result<RowAccessPolicyDef> {
        let params = spec
            .params
            .iter()
            .map(|p| -> Result<(&str, DataType)> {
                Ok((p.name.as_str(), parse_type(&p.ty, &spec.name)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut def = parser
            .row_access_policy(&spec.name, &params, &spec.body)
            .map_err(|e| body_error(&spec.name, &spec.body, e))?;
        if let Some(comment) = &spec.comment {
            def = def.with_comment(comment.as_str());
        }
        Ok(def)
    }

    /// Parse and compile every policy without touching an engine. Returns
    /// one rendered problem per failure.
    pub fn check(&self, compiler: &PolicyCompiler) -> Vec<String> {
        let parser = PolicyParser::new(compiler.max_depth());
        let mut problems = Vec::new();
        if let Err(e) = self.table_defs() {
            problems.push(e.to_string());
        }
        for spec in &self.masking_policies {
            let compiled = Self::masking_def(spec, parser)
                .and_then(|def| compiler.compile_masking(&def).map_err(CliError::from));
            if let Err(e) = compiled {
                problems.push(e.to_string());
            }
        }
        for spec in &self.row_access_policies {
            let compiled = Self::row_access_def(spec, parser)
                .and_then(|def| compiler.compile_row_access(&def).map_err(CliError::from));
            if let Err(e) = compiled {
                problems.push(e.to_string());
            }
        }
        for a in &self.attachments {
            if let Err(e) = parse_column(&a.column) {
                problems.push(e.to_string());
            }
        }
        for g in &self.grants {
            if let Err(e) = g.grantee() {
                problems.push(e.to_string());
            }
        }
        problems
    }

    /// Apply the workspace to an engine. Roles that exist and policies whose
    /// definition is unchanged are skipped, so applying twice is harmless.
    pub fn apply(&self, engine: &Engine, actor: &str) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        let parser = PolicyParser::new(engine.config().max_expression_depth);

        for table in self.table_defs()? {
            if engine.catalog().table(&table.id).ok().as_ref() != Some(&table) {
                engine.register_table(table)?;
                summary.tables += 1;
            }
        }

        for role in &self.roles {
            if engine.roles().role_exists(&role.name) {
                tracing::debug!(role = %role.name, "role exists, skipping");
                continue;
            }
            engine.create_role(&role.name, role.owner.as_deref())?;
            summary.roles += 1;
        }

        for grant in &self.grants {
            let grantee = grant.grantee()?;
            if engine.roles().direct_grants(&grantee).contains(&grant.role) {
                continue;
            }
            engine.grant_role(grantee, &grant.role, actor)?;
            summary.grants += 1;
        }

        for spec in &self.masking_policies {
            let def = Self::masking_def(spec, parser)?;
            let unchanged = engine
                .store()
                .current_masking(&def.name)
                .is_some_and(|current| current.def == def);
            if !unchanged {
                let version = engine.create_masking_policy(def, spec.or_replace)?;
                tracing::info!(policy = %spec.name, version, "masking policy applied");
                summary.policies += 1;
            }
        }

        for spec in &self.row_access_policies {
            let def = Self::row_access_def(spec, parser)?;
            let unchanged = engine
                .store()
                .current_row_access(&def.name)
                .is_some_and(|current| current.def == def);
            if !unchanged {
                let version = engine.create_row_access_policy(def, spec.or_replace)?;
                tracing::info!(policy = %spec.name, version, "row access policy applied");
                summary.policies += 1;
            }
        }

        let now = engine.now();
        for a in &self.attachments {
            let column = parse_column(&a.column)?;
            let current = engine.store().attachment_as_of(&column, now);
            if current.is_some_and(|c| c.policy == a.policy) {
                continue;
            }
            engine.attach_masking_policy(&column, &a.policy)?;
            summary.attachments += 1;
        }

        for a in &self.row_attachments {
            let table = TableId::new(a.table.as_str());
            let current = engine.store().row_attachment_as_of(&table, now);
            if current.is_some_and(|c| c.policy == a.policy && c.columns == a.columns) {
                continue;
            }
            let columns = a.columns.iter().map(String::as_str);
            engine.attach_row_access_policy(&table, &a.policy, columns)?;
            summary.attachments += 1;
        }

        Ok(summary)
    }
}
