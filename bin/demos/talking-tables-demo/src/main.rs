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

//! Interactive-free demo of the analysis pipeline over an in-memory dataset.
//! With `GEMINI_API_KEY` set it talks to the live provider; without it a
//! scripted provider answers each pipeline stage deterministically.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tabula::{
    AnalysisEngine, EngineConfig, EngineResult, GeminiClient, InferenceProvider, MemoryDataset,
    ProviderReply,
};
use tracing::info;

/// Offline stand-in for the model: routes on the stage-specific phrasing of
/// each prompt and replies in the format that stage expects.
struct ScriptedDemoProvider;

#[async_trait]
impl InferenceProvider for ScriptedDemoProvider {
    async fn generate(
        &self,
        _model: &str,
        _credential: &str,
        prompt: &str,
    ) -> EngineResult<ProviderReply> {
        let text = if prompt.contains("JSON array of subtasks") {
            // Unusable on purpose, to exercise the keyword fallback.
            "I would rather describe the plan in prose.".to_string()
        } else if prompt.contains("Summarise the result") {
            "Answer: Here is what the data shows. | Chart: bar | Data: none".to_string()
        } else if prompt.contains("average salary") {
            "let t = sql(\"SELECT * FROM employees\")\n\
             print(\"Average salary:\", round(avg(column(t, \"salary\"))))"
                .to_string()
        } else {
            "let t = sql(\"SELECT * FROM headcount\")\nprint(t)".to_string()
        };
        Ok(ProviderReply {
            text,
            tokens_used: Some(42),
        })
    }
}

fn demo_dataset() -> Arc<MemoryDataset> {
    let dataset = MemoryDataset::new();
    dataset.insert_table(
        "upload-1",
        "employees",
        &[
            ("name", "TEXT"),
            ("department", "TEXT"),
            ("salary", "INTEGER"),
        ],
        vec![
            vec![json!("Ada"), json!("Engineering"), json!(98000)],
            vec![json!("Grace"), json!("Engineering"), json!(94000)],
            vec![json!("Edsger"), json!("Research"), json!(88000)],
            vec![json!("Barbara"), json!("Sales"), json!(61000)],
            vec![json!("Donald"), json!("Sales"), json!(59000)],
        ],
        2,
    );
    dataset.insert_table(
        "upload-1",
        "headcount",
        &[("department", "TEXT"), ("employees", "INTEGER")],
        vec![
            vec![json!("Engineering"), json!(12)],
            vec![json!("Sales"), json!(8)],
            vec![json!("Research"), json!(4)],
        ],
        2,
    );
    dataset
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    dotenvy::dotenv().ok();
    let mut config = EngineConfig::from_env();

    let live = config.fallback_credential.is_some();
    let provider: Arc<dyn InferenceProvider> = if live {
        info!("GEMINI_API_KEY found; using the live provider");
        Arc::new(GeminiClient::new(Duration::from_secs(
            config.request_timeout_secs,
        ))?)
    } else {
        info!("No GEMINI_API_KEY; using the scripted offline provider");
        config.fallback_credential = Some("offline-demo-credential".to_string());
        Arc::new(ScriptedDemoProvider)
    };

    let engine = AnalysisEngine::new(config, provider, demo_dataset());

    let response = engine
        .answer_query("upload-1", "How many employees are in each department?", None)
        .await?;
    println!("\n=== Single query ===");
    println!("Answer: {}", response.answer);
    println!("Chart:  {}", response.chart_kind);
    if let Some(series) = &response.chart_data {
        for (label, value) in series.labels.iter().zip(&series.values) {
            println!("  {label}: {value}");
        }
    }
    println!(
        "Calls: {}, tokens: {}",
        response.calls_made, response.tokens_used
    );

    let chat_id = engine.create_chat_session("upload-1");
    let chat = engine
        .answer_query_with_chat(&chat_id, "What is the average salary?", None)
        .await?;
    println!("\n=== Chat turn {} ({}) ===", chat.turn_count, chat.chat_id);
    println!("Answer: {}", chat.response.answer);

    let stats = engine.session_stats();
    println!(
        "\nActive sessions: {}, messages: {}",
        stats.active_sessions, stats.total_messages
    );

    for usage in engine.credential_usage() {
        println!(
            "Credential {}: {} calls, {} tokens",
            usage.fingerprint, usage.calls_made, usage.tokens_used
        );
    }

    Ok(())
}
