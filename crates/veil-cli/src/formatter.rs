//! Output formatting for statement results.

use crate::rows::value_to_json;
use clap::ValueEnum;
use comfy_table::{Cell, Table};
use veil_core::{BatchResult, ColumnId, Value};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

pub fn format_result(columns: &[ColumnId], result: &BatchResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_table(columns, result),
        OutputFormat::Json => format_json(columns, result),
    }
}

fn cell(value: &Value) -> Cell {
    Cell::new(value.to_string())
}

fn format_table(columns: &[ColumnId], result: &BatchResult) -> String {
    let mut table = Table::new();
    table.set_header(columns.iter().map(|c| Cell::new(&c.column)));
    for row in &result.rows {
        table.add_row(row.iter().map(cell));
    }

    let mut output = if result.rows.is_empty() {
        "No rows".to_string()
    } else {
        table.to_string()
    };
    output.push_str(&format!(
        "\n{} row(s), {} suppressed",
        result.rows.len(),
        result.suppressed
    ));
    if !result.faults.is_empty() {
        output.push_str(&format!("\n{} contained fault(s):", result.faults.total));
        for (target, count) in &result.faults.by_target {
            output.push_str(&format!("\n  {}: {}", target, count));
        }
    }
    output
}

fn format_json(columns: &[ColumnId], result: &BatchResult) -> String {
    let rows: Vec<serde_json::Value> = result
        .rows
        .iter()
        .map(|row| {
            let obj: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .zip(row)
                .map(|(c, v)| (c.column.clone(), value_to_json(v)))
                .collect();
            serde_json::Value::Object(obj)
        })
        .collect();
    let json = serde_json::json!({
        "rows": rows,
        "suppressed": result.suppressed,
        "faults": {
            "total": result.faults.total,
            "by_target": result.faults.by_target,
        },
    });
    serde_json::to_string_pretty(&json).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::FaultSummary;

    fn result() -> BatchResult {
        let mut faults = FaultSummary::default();
        faults.record("employees.salary");
        BatchResult {
            rows: vec![vec![Value::Int(1), Value::Null]],
            suppressed: 1,
            faults,
        }
    }

    fn columns() -> Vec<ColumnId> {
        vec![
            ColumnId::new("employees", "id"),
            ColumnId::new("employees", "salary"),
        ]
    }

    #[test]
    fn test_table_output() {
        let out = format_result(&columns(), &result(), OutputFormat::Table);
        assert!(out.contains("salary"));
        assert!(out.contains("NULL"));
        assert!(out.contains("1 row(s), 1 suppressed"));
        assert!(out.contains("employees.salary: 1"));
    }

    #[test]
    fn test_json_output() {
        let out = format_result(&columns(), &result(), OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["rows"][0]["id"], 1);
        assert!(parsed["rows"][0]["salary"].is_null());
        assert_eq!(parsed["faults"]["by_target"]["employees.salary"], 1);
    }
}
