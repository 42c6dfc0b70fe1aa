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
use crate::sandbox::parser::{BinOp, Expr, Script, Stmt};
use analysis_contracts::{ChartKind, RowSet};
use std::collections::HashMap;
use thiserror::Error;

/// Runtime value of the script language. `Table` wraps whatever the injected
/// query capability returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    List(Vec<Value>),
    Table(RowSet),
    Unit,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),
    #[error("call to `{0}` is not permitted in the sandbox")]
    ForbiddenCall(String),
    #[error("`{name}` expects {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("type error in `{context}`: {message}")]
    Type {
        context: &'static str,
        message: String,
    },
    #[error("query failed: {0}")]
    Query(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("`{0}` called on an empty series")]
    EmptySeries(&'static str),
    #[error("row index {0} out of range")]
    RowOutOfRange(usize),
}

/// Tree-walking evaluator. Print output accumulates in an owned buffer that
/// is handed back on completion; the buffer lives and dies with one run.
pub struct Interpreter<'a> {
    handle: &'a DataHandle,
    bindings: HashMap<String, Value>,
    output: String,
}

impl<'a> Interpreter<'a> {
    pub fn new(handle: &'a DataHandle) -> Self {
        let mut bindings = HashMap::new();
        bindings.insert(
            "session_id".to_string(),
            Value::Str(handle.session_id.clone()),
        );
        Self {
            handle,
            bindings,
            output: String::new(),
        }
    }

    pub fn run(mut self, script: &Script) -> Result<String, RuntimeError> {
        for stmt in &script.statements {
            match stmt {
                Stmt::Let { name, value } => {
                    let evaluated = self.eval(value)?;
                    self.bindings.insert(name.clone(), evaluated);
                }
                Stmt::Expr(expr) => {
                    self.eval(expr)?;
                }
            }
        }
        Ok(self.output)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        match expr {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Ident(name) => self
                .bindings
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownIdentifier(name.clone())),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Num(n) => Ok(Value::Num(-n)),
                other => Err(type_error("negation", &other)),
            },
            Expr::Binary { op, lhs, rhs } => {
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                apply_binary(*op, left, right)
            }
            Expr::Call { name, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval(arg)?);
                }
                self.call_builtin(name, evaluated)
            }
        }
    }

    /// The complete capability surface of the sandbox. Anything not matched
    /// here does not exist as far as a script is concerned.
    fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match name {
            "print" => {
                let rendered: Vec<String> = args.iter().map(format_value).collect();
                self.output.push_str(&rendered.join(" "));
                self.output.push('\n');
                Ok(Value::Unit)
            }
            "sql" => {
                let [Value::Str(query)] = args.as_slice() else {
                    return Err(arity("sql", "1 string", args.len()));
                };
                let rows = self
                    .handle
                    .query
                    .execute(query)
                    .map_err(|e| RuntimeError::Query(e.to_string()))?;
                Ok(Value::Table(rows))
            }
            "plot" => {
                let [Value::Str(kind), Value::List(labels), Value::List(values)] = args.as_slice()
                else {
                    return Err(arity("plot", "kind, labels, values", args.len()));
                };
                if ChartKind::from(kind.as_str()).is_none() {
                    return Err(RuntimeError::Type {
                        context: "plot",
                        message: format!("unsupported chart kind `{kind}`"),
                    });
                }
                if labels.len() != values.len() {
                    return Err(RuntimeError::Type {
                        context: "plot",
                        message: format!(
                            "label/value length mismatch ({} vs {})",
                            labels.len(),
                            values.len()
                        ),
                    });
                }
                // Non-interactive handle: the series is validated and
                // discarded, mirroring a headless plotting backend.
                Ok(Value::Unit)
            }
            "column" => {
                let [Value::Table(rows), Value::Str(column)] = args.as_slice() else {
                    return Err(arity("column", "table, name", args.len()));
                };
                let index = rows
                    .columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(column))
                    .ok_or_else(|| RuntimeError::UnknownColumn(column.clone()))?;
                Ok(Value::List(
                    rows.rows
                        .iter()
                        .map(|row| scalar_to_value(row.get(index)))
                        .collect(),
                ))
            }
            "columns" => {
                let [Value::Table(rows)] = args.as_slice() else {
                    return Err(arity("columns", "table", args.len()));
                };
                Ok(Value::List(
                    rows.columns.iter().cloned().map(Value::Str).collect(),
                ))
            }
            "cell" => {
                let [Value::Table(rows), Value::Num(row_idx), Value::Str(column)] = args.as_slice()
                else {
                    return Err(arity("cell", "table, row, column", args.len()));
                };
                let col = rows
                    .columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(column))
                    .ok_or_else(|| RuntimeError::UnknownColumn(column.clone()))?;
                if *row_idx < 0.0 || row_idx.fract() != 0.0 {
                    return Err(RuntimeError::Type {
                        context: "cell",
                        message: format!("row index must be a non-negative integer, got {row_idx}"),
                    });
                }
                let idx = *row_idx as usize;
                let row = rows
                    .rows
                    .get(idx)
                    .ok_or(RuntimeError::RowOutOfRange(idx))?;
                Ok(scalar_to_value(row.get(col)))
            }
            "count" => match args.as_slice() {
                [Value::Table(rows)] => Ok(Value::Num(rows.rows.len() as f64)),
                [Value::List(items)] => Ok(Value::Num(items.len() as f64)),
                _ => Err(arity("count", "table or list", args.len())),
            },
            "len" => match args.as_slice() {
                [Value::Str(s)] => Ok(Value::Num(s.chars().count() as f64)),
                [Value::List(items)] => Ok(Value::Num(items.len() as f64)),
                [Value::Table(rows)] => Ok(Value::Num(rows.rows.len() as f64)),
                _ => Err(arity("len", "string, list or table", args.len())),
            },
            "sum" | "avg" | "min" | "max" => self.aggregate(name, args),
            "first" | "last" => {
                let label = if name == "first" { "first" } else { "last" };
                let [Value::List(items)] = args.as_slice() else {
                    return Err(arity(label, "list", args.len()));
                };
                let picked = if name == "first" {
                    items.first()
                } else {
                    items.last()
                };
                picked.cloned().ok_or(RuntimeError::EmptySeries(label))
            }
            "round" => {
                let [Value::Num(n)] = args.as_slice() else {
                    return Err(arity("round", "number", args.len()));
                };
                Ok(Value::Num(n.round()))
            }
            "abs" => {
                let [Value::Num(n)] = args.as_slice() else {
                    return Err(arity("abs", "number", args.len()));
                };
                Ok(Value::Num(n.abs()))
            }
            "str" => match args.as_slice() {
                [value] => Ok(Value::Str(format_value(value))),
                _ => Err(arity("str", "1 value", args.len())),
            },
            "num" => match args.as_slice() {
                [Value::Num(n)] => Ok(Value::Num(*n)),
                [Value::Str(s)] => s
                    .trim()
                    .replace(',', "")
                    .parse::<f64>()
                    .map(Value::Num)
                    .map_err(|_| RuntimeError::Type {
                        context: "num",
                        message: format!("cannot parse `{s}` as a number"),
                    }),
                _ => Err(arity("num", "string or number", args.len())),
            },
            other => Err(RuntimeError::ForbiddenCall(other.to_string())),
        }
    }

    fn aggregate(&self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let [Value::List(items)] = args.as_slice() else {
            return Err(arity("aggregate", "list of numbers", args.len()));
        };
        let mut numbers = Vec::with_capacity(items.len());
        for item in items {
            numbers.push(as_number(item, "aggregate")?);
        }
        if numbers.is_empty() && name != "sum" {
            let label = match name {
                "avg" => "avg",
                "min" => "min",
                _ => "max",
            };
            return Err(RuntimeError::EmptySeries(label));
        }
        let result = match name {
            "sum" => numbers.iter().sum(),
            "avg" => numbers.iter().sum::<f64>() / numbers.len() as f64,
            "min" => numbers.iter().copied().fold(f64::INFINITY, f64::min),
            "max" => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            _ => unreachable!("aggregate dispatch is exhaustive"),
        };
        Ok(Value::Num(result))
    }
}

fn apply_binary(op: BinOp, left: Value, right: Value) -> Result<Value, RuntimeError> {
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (BinOp::Add, Value::Str(a), b) => Ok(Value::Str(a + &format_value(&b))),
        (BinOp::Add, a, Value::Str(b)) => Ok(Value::Str(format_value(&a) + &b)),
        (op, Value::Num(a), Value::Num(b)) => {
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    a / b
                }
            };
            Ok(Value::Num(result))
        }
        (_, left, _) => Err(type_error("arithmetic", &left)),
    }
}

fn as_number(value: &Value, context: &'static str) -> Result<f64, RuntimeError> {
    match value {
        Value::Num(n) => Ok(*n),
        Value::Str(s) => s
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .map_err(|_| type_error(context, value)),
        other => Err(type_error(context, other)),
    }
}

fn arity(name: &'static str, expected: &'static str, got: usize) -> RuntimeError {
    RuntimeError::Arity {
        name,
        expected,
        got,
    }
}

fn type_error(context: &'static str, value: &Value) -> RuntimeError {
    RuntimeError::Type {
        context,
        message: format!("unsupported operand `{}`", describe(value)),
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Str(_) => "string",
        Value::Num(_) => "number",
        Value::List(_) => "list",
        Value::Table(_) => "table",
        Value::Unit => "unit",
    }
}

fn scalar_to_value(scalar: Option<&serde_json::Value>) -> Value {
    match scalar {
        Some(serde_json::Value::String(s)) => Value::Str(s.clone()),
        Some(serde_json::Value::Number(n)) => Value::Num(n.as_f64().unwrap_or(0.0)),
        Some(serde_json::Value::Bool(b)) => Value::Num(f64::from(u8::from(*b))),
        _ => Value::Str(String::new()),
    }
}

/// Rendering used by `print` and string coercion. Two-column tables render
/// as `label: value` lines, which downstream chart extraction understands.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Num(n) => format_number(*n),
        Value::Unit => String::new(),
        Value::List(items) => items
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Table(rows) => format_table(rows),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n:.2}")
    }
}

fn format_table(rows: &RowSet) -> String {
    if rows.columns.len() == 2 {
        rows.rows
            .iter()
            .map(|row| {
                format!(
                    "{}: {}",
                    format_value(&scalar_to_value(row.first())),
                    format_value(&scalar_to_value(row.get(1)))
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        let mut lines = vec![rows.columns.join(", ")];
        for row in &rows.rows {
            lines.push(
                row.iter()
                    .map(|cell| format_value(&scalar_to_value(Some(cell))))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        lines.join("\n")
    }
}
