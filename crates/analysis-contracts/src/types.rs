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

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Pie,
    Line,
    Scatter,
    #[default]
    None,
}

impl ChartKind {
    pub fn is_none(self) -> bool {
        self == ChartKind::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Pie => "pie",
            ChartKind::Line => "line",
            ChartKind::Scatter => "scatter",
            ChartKind::None => "none",
        }
    }
}

impl From<&str> for ChartKind {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "bar" => ChartKind::Bar,
            "pie" => ChartKind::Pie,
            "line" => ChartKind::Line,
            "scatter" => ChartKind::Scatter,
            _ => ChartKind::None,
        }
    }
}

impl std::fmt::Display for ChartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Primary,
    Secondary,
    Tertiary,
}

impl ModelTier {
    /// Next tier down, or `None` when already at the terminal tier.
    pub fn demoted(self) -> Option<Self> {
        match self {
            ModelTier::Primary => Some(ModelTier::Secondary),
            ModelTier::Secondary => Some(ModelTier::Tertiary),
            ModelTier::Tertiary => None,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Primary => f.write_str("primary"),
            ModelTier::Secondary => f.write_str("secondary"),
            ModelTier::Tertiary => f.write_str("tertiary"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub sample_rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl RowSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No credentials available in the pool")]
    NoCredentialsAvailable,

    #[error("Code generation exhausted: {0}")]
    CodeGenerationExhausted(String),

    #[error("Execution exhausted: {0}")]
    ExecutionExhausted(String),

    #[error("Synthesis exhausted: {0}")]
    SynthesisExhausted(String),

    #[error("Invalid chat session: {0}")]
    InvalidChatSession(String),

    #[error("No schema found for session: {0}")]
    NoSchemaForSession(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
