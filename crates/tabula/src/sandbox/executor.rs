// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use crate::data::DataHandle;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::parser;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Prefix carried by every failed execution's output. The repair loop keys
/// on this to distinguish failures from legitimate results.
pub const ERROR_MARKER: &str = "Error executing code";

/// Parses and evaluates model-generated scripts against an injected data
/// handle. Never panics or propagates: every outcome, success or failure,
/// comes back as captured text.
#[derive(Debug, Default)]
pub struct SandboxedExecutor {
    executions: AtomicU64,
}

impl SandboxedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one script to completion. Failures of any kind (syntax, unknown
    /// identifier, forbidden call, query error) are folded into the returned
    /// text behind [`ERROR_MARKER`].
    pub fn run(&self, script: &str, handle: &DataHandle) -> String {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let parsed = match parser::parse(script) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Script rejected by parser");
                return format!("{ERROR_MARKER}: {e}");
            }
        };
        match Interpreter::new(handle).run(&parsed) {
            Ok(output) => {
                debug!(bytes = output.len(), "Script executed");
                output.trim().to_string()
            }
            Err(e) => {
                warn!(error = %e, "Script failed at runtime");
                format!("{ERROR_MARKER}: {e}")
            }
        }
    }

    /// Validates syntax without evaluating anything. Used by the generation
    /// loop to reject non-code replies before they reach execution attempts.
    pub fn validate(&self, script: &str) -> Result<(), String> {
        parser::parse(script).map(|_| ()).map_err(|e| e.to_string())
    }

    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }
}

/// True when `output` is a failed execution rather than a result.
pub fn is_execution_error(output: &str) -> bool {
    output.starts_with(ERROR_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataAccess, DataHandle, MemoryDataset};
    use serde_json::json;

    fn employee_handle() -> DataHandle {
        let dataset = MemoryDataset::new();
        dataset.insert_table(
            "s1",
            "employees",
            &[("department", "TEXT"), ("salary", "INTEGER")],
            vec![
                vec![json!("Engineering"), json!(95000)],
                vec![json!("Sales"), json!(60000)],
                vec![json!("Sales"), json!(65000)],
            ],
            2,
        );
        DataHandle {
            session_id: "s1".to_string(),
            query: dataset.query_handle("s1").unwrap(),
        }
    }

    #[test]
    fn executes_print_and_trims_output() {
        let executor = SandboxedExecutor::new();
        let out = executor.run("print(\"RESULT:\", 42)", &employee_handle());
        assert_eq!(out, "RESULT: 42");
        assert_eq!(executor.execution_count(), 1);
    }

    #[test]
    fn sql_column_and_aggregate_pipeline() {
        let executor = SandboxedExecutor::new();
        let script = "let t = sql(\"SELECT * FROM employees\")\n\
                      let salaries = column(t, \"salary\")\n\
                      print(\"total:\", sum(salaries))";
        let out = executor.run(script, &employee_handle());
        assert_eq!(out, "total: 220000");
    }

    #[test]
    fn runtime_failures_carry_the_error_marker() {
        let executor = SandboxedExecutor::new();
        let out = executor.run("print(missing)", &employee_handle());
        assert!(is_execution_error(&out));
        assert!(out.contains("unknown identifier"));
    }

    #[test]
    fn syntax_failures_carry_the_error_marker() {
        let executor = SandboxedExecutor::new();
        let out = executor.run("let = broken", &employee_handle());
        assert!(is_execution_error(&out));
    }

    #[test]
    fn negative_row_index_is_rejected() {
        let executor = SandboxedExecutor::new();
        let script = "let t = sql(\"SELECT * FROM employees\")\n\
                      print(cell(t, -1, \"salary\"))";
        let out = executor.run(script, &employee_handle());
        assert!(is_execution_error(&out));
        assert!(out.contains("row index"));
    }

    #[test]
    fn fractional_row_index_is_rejected() {
        let executor = SandboxedExecutor::new();
        let script = "let t = sql(\"SELECT * FROM employees\")\n\
                      print(cell(t, 0.5, \"salary\"))";
        let out = executor.run(script, &employee_handle());
        assert!(is_execution_error(&out));
        assert!(out.contains("row index"));
    }

    #[test]
    fn forbidden_calls_are_rejected() {
        let executor = SandboxedExecutor::new();
        let out = executor.run("open(\"/etc/passwd\")", &employee_handle());
        assert!(is_execution_error(&out));
        assert!(out.contains("not permitted"));
    }

    #[test]
    fn session_id_is_available_to_scripts() {
        let executor = SandboxedExecutor::new();
        let out = executor.run("print(session_id)", &employee_handle());
        assert_eq!(out, "s1");
    }

    #[test]
    fn plot_is_accepted_without_affecting_output() {
        let executor = SandboxedExecutor::new();
        let script = "let t = sql(\"SELECT department, salary FROM employees\")\n\
                      plot(\"bar\", column(t, \"department\"), column(t, \"salary\"))\n\
                      print(t)";
        let out = executor.run(script, &employee_handle());
        assert!(out.starts_with("Engineering: 95000"));
        assert!(out.contains("Sales: 60000"));
    }

    #[test]
    fn validate_rejects_prose_without_executing() {
        let executor = SandboxedExecutor::new();
        assert!(executor.validate("Sure! Here is the code:").is_err());
        assert!(executor.validate("print(1)").is_ok());
        assert_eq!(executor.execution_count(), 0);
    }
}
