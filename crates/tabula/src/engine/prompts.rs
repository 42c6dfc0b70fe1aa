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

//! Prompt construction for every stage of the pipeline. Each builder pins the
//! reply format it expects so downstream parsing stays mechanical.

use analysis_contracts::TableSchema;
use std::fmt::Write;

const SCRIPT_GRAMMAR: &str = r#"Write a script in the following restricted language, nothing else:
- one statement per line: `let name = expression` or a bare expression
- expressions: numbers, "strings", identifiers, + - * /, parentheses
- available functions only: print, sql, plot, column, columns, cell, count,
  len, sum, avg, min, max, first, last, round, abs, str, num
- `sql("...")` runs a read-only query and returns a table
- `column(table, "name")` extracts one column as a list
- `plot(kind, labels, values)` declares a chart; kind is "bar", "pie",
  "line" or "scatter"
- `print(...)` is the only way to produce output
- lines starting with # are comments
No imports, no loops, no conditionals, no other functions exist."#;

/// Renders the schemas of every table in a session, with a bounded number of
/// sample rows per table.
pub fn schema_description(schemas: &[TableSchema], sample_rows: usize) -> String {
    let mut out = String::new();
    for schema in schemas {
        let _ = writeln!(out, "Table `{}`:", schema.name);
        for column in &schema.columns {
            let _ = writeln!(out, "  - {} ({})", column.name, column.data_type);
        }
        for row in schema.sample_rows.iter().take(sample_rows) {
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            let _ = writeln!(out, "  sample: {}", cells.join(", "));
        }
    }
    out
}

/// Code-generation prompt. From the second attempt onward the accumulated
/// rejection reasons are spelled out so the model stops repeating them.
pub fn code_generation(
    question: &str,
    schemas: &[TableSchema],
    sample_rows: usize,
    attempt: usize,
    failures: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are a data analyst writing an analysis script.");
    let _ = writeln!(out, "\n{}", schema_description(schemas, sample_rows));
    let _ = writeln!(out, "Question: {question}\n");
    let _ = writeln!(out, "{SCRIPT_GRAMMAR}");
    if attempt > 1 && !failures.is_empty() {
        let _ = writeln!(
            out,
            "\nYour previous replies were rejected as invalid scripts:"
        );
        for failure in failures {
            let _ = writeln!(out, "- {failure}");
        }
        let _ = writeln!(out, "Reply with only a valid script this time.");
    }
    let _ = writeln!(out, "\nEnd the script by printing the answer.");
    out
}

/// Repair prompt: the failing script plus the captured error, asking for a
/// corrected script in the same language.
pub fn repair(question: &str, script: &str, error_output: &str) -> String {
    format!(
        "The following script failed to execute.\n\n\
         Question it was answering: {question}\n\n\
         Script:\n{script}\n\n\
         Error:\n{error_output}\n\n\
         {SCRIPT_GRAMMAR}\n\n\
         Reply with only the corrected script."
    )
}

/// Decomposition prompt. The reply is expected to be a JSON array of subtask
/// objects; anything else falls back to keyword decomposition.
pub fn decomposition(question: &str, schemas: &[TableSchema], sample_rows: usize) -> String {
    format!(
        "Split the user's question into independent analysis subtasks.\n\n\
         {}\n\
         Question: {question}\n\n\
         Reply with a JSON array of subtasks, each an object with keys\n\
         \"description\", \"question\", \"chart\" (one of bar, pie, line,\n\
         scatter, none) and \"priority\" (integer, 1 is highest). Use a\n\
         single-element array when the question is already atomic.",
        schema_description(schemas, sample_rows)
    )
}

/// Synthesis prompt. Pins the `Answer: ... | Chart: ... | Data: ...` reply
/// grammar that [`crate::engine::synthesis`] parses.
pub fn synthesis(question: &str, raw_output: &str) -> String {
    format!(
        "A script answering the question below produced this output.\n\n\
         Question: {question}\n\n\
         Output:\n{raw_output}\n\n\
         Summarise the result for the user. Reply on a single line in\n\
         exactly this shape:\n\
         Answer: <plain-language answer> | Chart: <bar, pie, line, scatter \
         or none> | Data: <the labelled numbers backing the chart, as \
         `label: value` pairs separated by commas, or `none`>"
    )
}
