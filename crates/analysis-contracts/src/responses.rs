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

use crate::types::ChartKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub description: String,
    pub question: String,
    pub chart_kind: ChartKind,
    pub priority: u32,
}

impl Subtask {
    pub fn new(description: &str, question: &str, chart_kind: ChartKind, priority: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.to_string(),
            question: question.to_string(),
            chart_kind,
            priority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask: Subtask,
    pub script: String,
    pub raw_output: String,
    pub answer: String,
    pub chart_kind: ChartKind,
    pub chart_data: Option<ChartSeries>,
    pub calls_made: u64,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryResponse {
    pub answer: String,
    pub chart_kind: ChartKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<ChartSeries>,
    pub generated_scripts: Vec<String>,
    pub calls_made: u64,
    pub tokens_used: u64,
    pub subtask_results: Vec<SubtaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatQueryResponse {
    #[serde(flatten)]
    pub response: QueryResponse,
    pub chat_id: String,
    pub turn_count: u64,
}

/// Per-credential usage snapshot for the admin surface. The secret itself
/// never leaves the pool; only a short suffix fingerprint is exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub fingerprint: String,
    pub calls_made: u64,
    pub tokens_used: u64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub chat_id: String,
    pub data_session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_messages: u64,
    pub session_timeout_secs: u64,
    pub sessions: Vec<SessionSummary>,
}
