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

use crate::engine::prompts;
use crate::llm::gateway::InferenceGateway;
use crate::llm::utils::extract_json_from_text;
use analysis_contracts::{ChartKind, EngineConfig, Subtask, TableSchema};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

static NUMBERED_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*\d+[.)]\s*(.+)$").unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

#[derive(Deserialize)]
struct RawSubtask {
    description: String,
    question: String,
    #[serde(default)]
    chart: String,
    #[serde(default = "default_priority")]
    priority: u32,
}

fn default_priority() -> u32 {
    1
}

/// Splits a compound question into independent subtasks. The model path asks
/// for a JSON array; any unusable reply falls back to deterministic keyword
/// decomposition, so callers always get at least one subtask.
pub struct TaskDecomposer {
    gateway: Arc<InferenceGateway>,
    sample_rows: usize,
}

impl TaskDecomposer {
    pub fn new(gateway: Arc<InferenceGateway>, config: &EngineConfig) -> Self {
        Self {
            gateway,
            sample_rows: config.sample_rows_per_table,
        }
    }

    pub async fn decompose(
        &self,
        question: &str,
        schemas: &[TableSchema],
        credential: Option<&str>,
    ) -> Vec<Subtask> {
        let prompt = prompts::decomposition(question, schemas, self.sample_rows);
        match self.gateway.call(&prompt, credential).await {
            Ok(reply) => {
                if let Some(subtasks) = parse_model_subtasks(&reply) {
                    debug!(count = subtasks.len(), "Model decomposition accepted");
                    return subtasks;
                }
                warn!("Model decomposition unusable; falling back to keywords");
                fallback_decomposition(question)
            }
            Err(e) => {
                warn!(error = %e, "Decomposition call failed; falling back to keywords");
                fallback_decomposition(question)
            }
        }
    }
}

fn parse_model_subtasks(reply: &str) -> Option<Vec<Subtask>> {
    let value = extract_json_from_text(reply)?;
    let raw: Vec<RawSubtask> = serde_json::from_value(value).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.into_iter()
            .map(|r| {
                Subtask::new(
                    &r.description,
                    &r.question,
                    ChartKind::from(r.chart.as_str()),
                    r.priority,
                )
            })
            .collect(),
    )
}

/// Deterministic decomposition used whenever the model path yields nothing.
/// Numbered lists split per item; otherwise top-level ` and ` conjunctions
/// split the question; a simple question stays whole. Each part gets a chart
/// kind inferred from its phrasing.
pub fn fallback_decomposition(question: &str) -> Vec<Subtask> {
    let parts = split_question(question);
    parts
        .iter()
        .enumerate()
        .map(|(idx, part)| {
            Subtask::new(
                part,
                part,
                infer_chart_kind(part),
                u32::try_from(idx).map_or(u32::MAX, |i| i + 1),
            )
        })
        .collect()
}

fn split_question(question: &str) -> Vec<String> {
    let numbered: Vec<String> = NUMBERED_ITEM
        .captures_iter(question)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if numbered.len() > 1 {
        return numbered;
    }

    let lowered = question.to_lowercase();
    if lowered.contains(" and ") {
        let parts: Vec<String> = split_on_and(question)
            .into_iter()
            .filter(|s| s.split_whitespace().count() >= 3)
            .collect();
        if parts.len() > 1 {
            return parts;
        }
    }

    vec![question.trim().to_string()]
}

/// Splits on ` and ` without a lowercase/original length mismatch: matches
/// case-insensitively against the original text.
fn split_on_and(question: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = question;
    loop {
        let lowered = rest.to_lowercase();
        match lowered.find(" and ") {
            Some(pos) => {
                parts.push(rest[..pos].trim().to_string());
                rest = &rest[pos + 5..];
            }
            None => {
                parts.push(rest.trim().to_string());
                break;
            }
        }
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Chart kind inferred from question phrasing. Mirrors how the answer
/// synthesiser classifies chart requests, so the hint and the extraction
/// agree.
pub fn infer_chart_kind(text: &str) -> ChartKind {
    let lowered = text.to_lowercase();
    if lowered.contains("pie") || lowered.contains("distribution") || lowered.contains("share of")
    {
        ChartKind::Pie
    } else if lowered.contains("trend")
        || lowered.contains("over time")
        || lowered.contains("per month")
        || lowered.contains("by month")
        || lowered.contains("by year")
    {
        ChartKind::Line
    } else if lowered.contains("versus")
        || lowered.contains(" vs ")
        || lowered.contains("correlat")
    {
        ChartKind::Scatter
    } else if lowered.contains("highest")
        || lowered.contains("top ")
        || lowered.contains("most ")
        || lowered.contains("compare")
        || lowered.contains("by department")
        || lowered.contains("per department")
        || lowered.contains("breakdown")
    {
        ChartKind::Bar
    } else {
        ChartKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_question_stays_whole() {
        let subtasks = fallback_decomposition("What is the average salary?");
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].question, "What is the average salary?");
        assert_eq!(subtasks[0].chart_kind, ChartKind::None);
        assert_eq!(subtasks[0].priority, 1);
    }

    #[test]
    fn numbered_list_splits_per_item() {
        let subtasks = fallback_decomposition(
            "1. What is the headcount per department?\n2. Show the salary distribution",
        );
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].chart_kind, ChartKind::Bar);
        assert_eq!(subtasks[1].chart_kind, ChartKind::Pie);
        assert_eq!(subtasks[1].priority, 2);
    }

    #[test]
    fn conjunction_splits_when_both_sides_are_substantial() {
        let subtasks = fallback_decomposition(
            "Show the top departments by salary and plot the hiring trend over time",
        );
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].chart_kind, ChartKind::Bar);
        assert_eq!(subtasks[1].chart_kind, ChartKind::Line);
    }

    #[test]
    fn short_conjunction_does_not_split() {
        let subtasks = fallback_decomposition("Compare salaries and bonuses");
        assert_eq!(subtasks.len(), 1);
    }

    #[test]
    fn scatter_keywords_are_recognised() {
        assert_eq!(
            infer_chart_kind("Is salary correlated with tenure?"),
            ChartKind::Scatter
        );
    }

    #[test]
    fn model_reply_with_json_array_is_parsed() {
        let reply = r#"Here you go:
```json
[{"description": "headcount", "question": "How many employees per department?", "chart": "bar", "priority": 1}]
```"#;
        let subtasks = parse_model_subtasks(reply).unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].chart_kind, ChartKind::Bar);
    }

    #[test]
    fn empty_json_array_is_rejected() {
        assert!(parse_model_subtasks("[]").is_none());
    }
}
