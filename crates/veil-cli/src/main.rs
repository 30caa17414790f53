//! Veil command-line interface
//!
//! Checks and applies policy workspaces and runs rows through the
//! enforcement hook of a durable engine.

mod error;
mod formatter;
mod rows;
mod workspace;

use clap::{Parser, Subcommand};
use error::{CliError, Result};
use formatter::OutputFormat;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veil_core::{
    ColumnId, Engine, EngineConfig, PolicyCompiler, Timestamp, TracingAuditLogger,
};
use workspace::Workspace;

/// Veil dynamic data masking engine
#[derive(Parser, Debug)]
#[command(name = "veil")]
#[command(version, about = "Veil dynamic data masking engine", long_about = None)]
pub struct Args {
    /// Directory of the durable policy log.
    #[arg(short, long, global = true)]
    pub data_path: Option<PathBuf>,

    /// Worker threads for large batches (0 = auto).
    #[arg(long, default_value_t = 0, global = true)]
    pub workers: usize,

    /// Deepest policy body accepted.
    #[arg(long, default_value_t = veil_core::config::DEFAULT_MAX_EXPRESSION_DEPTH, global = true)]
    pub max_depth: usize,

    /// Fail attaches to columns or tables that already have a policy.
    #[arg(long, global = true)]
    pub no_implicit_replace: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse and compile every policy in a workspace file.
    Check {
        /// Workspace JSON file.
        workspace: PathBuf,
    },
    /// Apply a workspace file to the durable engine.
    Apply {
        /// Workspace JSON file.
        workspace: PathBuf,
        /// Principal recorded as the grantor.
        #[arg(long, default_value = "admin")]
        actor: String,
    },
    /// Run rows through the enforcement hook for a principal.
    Query {
        /// Session user.
        #[arg(short, long)]
        user: String,
        /// Default role of the session.
        #[arg(short, long, default_value = veil_core::PUBLIC_ROLE)]
        role: String,
        /// Additional roles to activate.
        #[arg(long)]
        secondary: Vec<String>,
        /// Table being read.
        #[arg(short, long)]
        table: String,
        /// Projected columns, comma separated.
        #[arg(short, long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
        /// JSON file of input rows, arrays in input-column order or objects.
        #[arg(long)]
        rows: PathBuf,
        /// Evaluate policies as of this engine timestamp.
        #[arg(long)]
        as_of: Option<Timestamp>,
        /// Session attribute, `key=value`. Repeatable.
        #[arg(long = "attr")]
        attributes: Vec<String>,
        /// Output format.
        #[arg(long, default_value = "table", value_enum)]
        format: OutputFormat,
    },
}

impl Args {
    /// Engine configuration for these arguments.
    pub fn into_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new()
            .with_implicit_replace(!self.no_implicit_replace)
            .with_max_expression_depth(self.max_depth);
        if self.workers > 0 {
            config = config.with_hook_workers(self.workers);
        }
        if let Some(path) = &self.data_path {
            config = config.with_data_path(path.clone());
        }
        config
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_engine(config: EngineConfig) -> Result<Engine> {
    let Some(path) = &config.data_path else {
        return Err(CliError::Invalid("--data-path is required".into()));
    };
    tracing::info!(data_path = %path.display(), "opening engine");
    let engine = Engine::open(config)?.with_audit_logger(Arc::new(TracingAuditLogger));
    Ok(engine)
}

fn run(args: Args) -> Result<()> {
    let config = args.into_config();
    match args.command {
        Command::Check { workspace } => {
            let ws = Workspace::load(&workspace)?;
            let problems = ws.check(&PolicyCompiler::new(config.max_expression_depth));
            for problem in &problems {
                eprintln!("{}", problem);
            }
            if !problems.is_empty() {
                return Err(CliError::CheckFailed(problems.len()));
            }
            println!(
                "{}: {} masking and {} row access policies ok",
                workspace.display(),
                ws.masking_policies.len(),
                ws.row_access_policies.len()
            );
            Ok(())
        }
        Command::Apply { workspace, actor } => {
            let ws = Workspace::load(&workspace)?;
            let engine = open_engine(config)?;
            let summary = ws.apply(&engine, &actor)?;
            println!(
                "applied {} table(s), {} role(s), {} grant(s), {} policy version(s), \
                 {} attachment(s)",
                summary.tables, summary.roles, summary.grants, summary.policies, summary.attachments
            );
            Ok(())
        }
        Command::Query {
            user,
            role,
            secondary,
            table,
            columns,
            rows,
            as_of,
            attributes,
            format,
        } => {
            let engine = open_engine(config)?;

            let mut principal = engine.session(&user, &role);
            for extra in &secondary {
                engine.activate_secondary(&mut principal, extra)?;
            }
            let mut ctx = engine.context(&principal, as_of);
            for pair in &attributes {
                let (key, value) = rows::parse_attribute(pair)?;
                ctx = ctx.with_attribute(key, value);
            }

            let projection: Vec<ColumnId> = columns
                .iter()
                .map(|c| ColumnId::new(table.as_str(), c.trim()))
                .collect();
            let stmt = engine.prepare_with(ctx, &projection, &[])?;

            let display = rows.display().to_string();
            let text = std::fs::read_to_string(&rows).map_err(|source| CliError::Io {
                path: display.clone(),
                source,
            })?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|source| CliError::Json {
                    path: display,
                    source,
                })?;
            let input = rows::rows_from_json(&json, stmt.input_columns(), engine.catalog())?;

            let result = stmt.run(input);
            println!(
                "{}",
                formatter::format_result(stmt.obligations.output_columns(), &result, format)
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "veil",
            "--data-path",
            "/tmp/veil",
            "--workers",
            "3",
            "--no-implicit-replace",
            "check",
            "ws.json",
        ]);
        let config = args.into_config();
        assert_eq!(config.data_path, Some(PathBuf::from("/tmp/veil")));
        assert_eq!(config.hook_workers, 3);
        assert!(!config.implicit_replace);
        assert!(matches!(args.command, Command::Check { .. }));
    }

    #[test]
    fn test_query_columns_are_comma_separated() {
        let args = Args::parse_from([
            "veil", "query", "-u", "andy", "-t", "employees", "-c", "id,salary", "--rows",
            "rows.json", "--attr", "region=EU",
        ]);
        let Command::Query {
            columns,
            role,
            attributes,
            ..
        } = args.command
        else {
            panic!("expected query");
        };
        assert_eq!(columns, vec!["id", "salary"]);
        assert_eq!(role, "PUBLIC");
        assert_eq!(attributes, vec!["region=EU"]);
    }

    #[test]
    fn test_apply_then_query_against_durable_engine() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = dir.path().join("ws.json");
        let body = "CASE WHEN is_role_in_session('SYSADMIN') THEN val \
                    ELSE '***@' || split_part(val, '@', 2) END";
        let ws = serde_json::json!({
            "tables": [{"name": "employees", "columns": [
                {"name": "id", "type": "number"},
                {"name": "email", "type": "text"}
            ]}],
            "roles": [{"name": "SYSADMIN"}],
            "grants": [{"role": "SYSADMIN", "to_user": "sam"}],
            "masking_policies": [{
                "name": "email_mask", "arg": "val", "type": "text", "body": body
            }],
            "attachments": [{"column": "employees.email", "policy": "email_mask"}]
        });
        std::fs::write(&ws_path, ws.to_string()).unwrap();
        let data = dir.path().join("data");
        let data_arg = data.to_str().unwrap();
        let ws_arg = ws_path.to_str().unwrap();

        run(Args::parse_from(["veil", "-d", data_arg, "apply", ws_arg])).unwrap();

        let engine = Engine::open(EngineConfig::persistent(&data)).unwrap();
        let principal = engine.session("andy", "PUBLIC");
        let stmt = engine
            .prepare(&principal, &[ColumnId::new("employees", "email")], &[], None)
            .unwrap();
        let result = stmt.run(vec![vec![veil_core::Value::from("alice@snowflake.com")]]);
        assert_eq!(
            result.rows,
            vec![vec![veil_core::Value::from("***@snowflake.com")]]
        );
    }
}
