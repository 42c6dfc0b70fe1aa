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

//! Answer synthesis and chart-series extraction from unstructured model
//! output. The model is pinned to an `Answer: … | Chart: … | Data: …` reply
//! shape; everything after that is tolerant pattern matching, because models
//! drift from the shape under load.

use crate::engine::prompts;
use crate::llm::gateway::InferenceGateway;
use analysis_contracts::{ChartKind, ChartSeries, EngineError, EngineResult, SubtaskResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAnswer {
    pub answer: String,
    pub chart_kind: ChartKind,
    pub chart_data: Option<ChartSeries>,
}

/// One way of reading a labelled numeric series out of free text. Strategies
/// are tried in declaration order; the first hit wins.
pub trait SeriesPattern: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> Option<ChartSeries>;
}

/// `Engineering: 5, Sales: 4` — label, colon, number.
struct LabelColonNumber;

static LABEL_COLON_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z][A-Za-z0-9 _/&-]*?)\s*:\s*\$?(-?[\d,]+(?:\.\d+)?)")
        .unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

impl SeriesPattern for LabelColonNumber {
    fn name(&self) -> &'static str {
        "label-colon-number"
    }

    fn extract(&self, text: &str) -> Option<ChartSeries> {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        for caps in LABEL_COLON_NUMBER.captures_iter(text) {
            let label = caps[1].trim().to_string();
            if let Some(value) = parse_number(&caps[2]) {
                labels.push(label);
                values.push(value);
            }
        }
        series_of(labels, values)
    }
}

/// `12 engineers, 8 analysts` — count followed by a plural noun.
struct NumberNoun;

static NUMBER_NOUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(-?[\d,]+(?:\.\d+)?)\s+([A-Za-z][A-Za-z-]{2,})")
        .unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

impl SeriesPattern for NumberNoun {
    fn name(&self) -> &'static str {
        "number-noun"
    }

    fn extract(&self, text: &str) -> Option<ChartSeries> {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        for caps in NUMBER_NOUN.captures_iter(text) {
            if let Some(value) = parse_number(&caps[1]) {
                labels.push(caps[2].to_string());
                values.push(value);
            }
        }
        series_of(labels, values)
    }
}

/// `$50k-$60k: 12` style salary buckets, where the bucket itself contains
/// digits and would confuse the generic label pattern.
struct DollarBuckets;

static DOLLAR_BUCKETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\$[\d,]+k?\s*[-–]\s*\$[\d,]+k?)\s*:\s*(-?[\d,]+(?:\.\d+)?)")
        .unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

impl SeriesPattern for DollarBuckets {
    fn name(&self) -> &'static str {
        "dollar-buckets"
    }

    fn extract(&self, text: &str) -> Option<ChartSeries> {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        for caps in DOLLAR_BUCKETS.captures_iter(text) {
            if let Some(value) = parse_number(&caps[2]) {
                labels.push(caps[1].trim().to_string());
                values.push(value);
            }
        }
        series_of(labels, values)
    }
}

static PATTERNS: Lazy<Vec<Box<dyn SeriesPattern>>> = Lazy::new(|| {
    vec![
        Box::new(DollarBuckets),
        Box::new(LabelColonNumber),
        Box::new(NumberNoun),
    ]
});

fn series_of(labels: Vec<String>, values: Vec<f64>) -> Option<ChartSeries> {
    if labels.is_empty() {
        None
    } else {
        Some(ChartSeries { labels, values })
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.replace(',', "").parse().ok()
}

/// Runs every registered pattern in order against `text`.
pub fn extract_series(text: &str) -> Option<ChartSeries> {
    for pattern in PATTERNS.iter() {
        if let Some(series) = pattern.extract(text) {
            debug!(pattern = pattern.name(), "Chart series extracted");
            return Some(series);
        }
    }
    None
}

/// Parses a synthesis reply into its answer, chart kind and chart data.
/// Series extraction tries the reply's own `Data:` section first, then the
/// raw execution output; a chart kind with no extractable series degrades to
/// no chart.
pub fn interpret_model_reply(reply: &str, raw_output: &str) -> SynthesizedAnswer {
    let (answer, chart_text, data_text) = split_reply(reply);
    let mut chart_kind = ChartKind::from(chart_text.as_str());

    let chart_data = if chart_kind.is_none() {
        None
    } else {
        data_text
            .as_deref()
            .filter(|d| !d.eq_ignore_ascii_case("none"))
            .and_then(extract_series)
            .or_else(|| extract_series(raw_output))
    };
    if chart_data.is_none() {
        chart_kind = ChartKind::None;
    }

    SynthesizedAnswer {
        answer,
        chart_kind,
        chart_data,
    }
}

fn split_reply(reply: &str) -> (String, String, Option<String>) {
    let mut answer = reply.trim().to_string();
    let mut chart = "none".to_string();
    let mut data = None;

    if let Some(pos) = answer.find("| Data:") {
        data = Some(answer[pos + 7..].trim().to_string());
        answer.truncate(pos);
    }
    if let Some(pos) = answer.find("| Chart:") {
        chart = answer[pos + 8..].trim().to_string();
        answer.truncate(pos);
    }
    let answer = answer
        .trim()
        .strip_prefix("Answer:")
        .map(str::trim)
        .unwrap_or(answer.trim())
        .to_string();
    (answer, chart, data)
}

/// Retry-bounded synthesis stage: asks the model to summarise an execution
/// output and parses the pinned reply shape. Replies that drift from the
/// shape still count: any non-empty text degrades to a bare answer. Only an
/// empty reply or a failed call burns an attempt.
pub struct Synthesizer {
    gateway: Arc<InferenceGateway>,
    max_attempts: usize,
}

impl Synthesizer {
    pub fn new(gateway: Arc<InferenceGateway>, max_attempts: usize) -> Self {
        Self {
            gateway,
            max_attempts,
        }
    }

    pub async fn synthesize(
        &self,
        question: &str,
        raw_output: &str,
        chart_hint: ChartKind,
        credential: Option<&str>,
    ) -> EngineResult<SynthesizedAnswer> {
        let prompt = prompts::synthesis(question, raw_output);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.gateway.call(&prompt, credential).await {
                Ok(reply) if !reply.trim().is_empty() => {
                    let mut synthesized = interpret_model_reply(&reply, raw_output);
                    // A hinted chart with no kind from the model still gets a
                    // series extraction attempt against the raw output.
                    if synthesized.chart_kind.is_none() && !chart_hint.is_none() {
                        if let Some(series) = extract_series(raw_output) {
                            synthesized.chart_kind = chart_hint;
                            synthesized.chart_data = Some(series);
                        }
                    }
                    return Ok(synthesized);
                }
                Ok(_) => {
                    warn!(attempt, "Synthesis reply was empty");
                    last_error = "empty reply".to_string();
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Synthesis call failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(EngineError::SynthesisExhausted(format!(
            "no usable summary after {} attempt(s); last error: {last_error}",
            self.max_attempts
        )))
    }
}

/// Combines per-subtask results into one response body. A single result
/// passes through untouched; multiple results get numbered sections and the
/// most presentable chart (pie first, then any other kind with data).
pub fn merge_results(results: &[SubtaskResult]) -> (String, ChartKind, Option<ChartSeries>) {
    if results.len() == 1 {
        let only = &results[0];
        return (only.answer.clone(), only.chart_kind, only.chart_data.clone());
    }

    let mut sections = Vec::with_capacity(results.len());
    for (idx, result) in results.iter().enumerate() {
        sections.push(format!(
            "{}. {}: {}",
            idx + 1,
            result.subtask.description,
            result.answer
        ));
    }

    let charted = results
        .iter()
        .find(|r| r.chart_kind == ChartKind::Pie && r.chart_data.is_some())
        .or_else(|| {
            results
                .iter()
                .find(|r| !r.chart_kind.is_none() && r.chart_data.is_some())
        });

    match charted {
        Some(result) => (
            sections.join("\n"),
            result.chart_kind,
            result.chart_data.clone(),
        ),
        None => (sections.join("\n"), ChartKind::None, None),
    }
}
