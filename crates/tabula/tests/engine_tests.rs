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

mod common;

use common::{company_dataset, RoutedProvider, Stage};
use tabula::{AnalysisEngine, ChartKind, EngineConfig, EngineError, ModelTier};

fn engine_with(provider: std::sync::Arc<RoutedProvider>) -> AnalysisEngine {
    let config = EngineConfig {
        fallback_credential: Some("test-credential".to_string()),
        ..EngineConfig::default()
    };
    AnalysisEngine::new(config, provider, company_dataset())
}

#[tokio::test]
async fn single_question_flows_through_the_whole_pipeline() {
    let provider = RoutedProvider::new();
    provider.push(
        Stage::CodeGen,
        Ok("let t = sql(\"SELECT * FROM headcount\")\nprint(t)"),
    );
    provider.push(
        Stage::Synthesis,
        Ok("Answer: Engineering is the largest department. | Chart: bar | Data: none"),
    );
    let engine = engine_with(provider);

    let response = engine
        .answer_query("upload-1", "How big is each department?", None)
        .await
        .unwrap();

    assert_eq!(response.answer, "Engineering is the largest department.");
    assert_eq!(response.chart_kind, ChartKind::Bar);
    let series = response.chart_data.unwrap();
    assert_eq!(series.labels, vec!["Engineering", "Sales"]);
    assert_eq!(series.values, vec![12.0, 8.0]);
    assert_eq!(response.generated_scripts.len(), 1);
    assert!(response.error.is_none());
    // Decomposition, generation and synthesis each cost one call.
    assert_eq!(response.calls_made, 3);
    assert_eq!(response.tokens_used, 21);
}

#[tokio::test]
async fn compound_question_produces_numbered_sections() {
    let provider = RoutedProvider::new();
    provider.push(Stage::CodeGen, Ok("print(\"headcount done\")"));
    provider.push(Stage::CodeGen, Ok("print(\"trend done\")"));
    provider.push(Stage::Synthesis, Ok("Answer: twelve engineers lead"));
    provider.push(Stage::Synthesis, Ok("Answer: hiring is steady"));
    let engine = engine_with(provider);

    let response = engine
        .answer_query(
            "upload-1",
            "Show the top departments by headcount and plot the hiring trend over time",
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.subtask_results.len(), 2);
    assert!(response.answer.starts_with("1. "));
    assert!(response.answer.contains("\n2. "));
    assert_eq!(response.generated_scripts.len(), 2);
}

#[tokio::test]
async fn missing_data_session_is_rejected_before_any_model_call() {
    let provider = RoutedProvider::new();
    let engine = engine_with(provider.clone());

    let err = engine
        .answer_query("no-such-upload", "anything", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSchemaForSession(_)));
    assert!(provider.stages_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn generation_exhaustion_surfaces_in_the_error_field() {
    let provider = RoutedProvider::new();
    provider.push(Stage::CodeGen, Ok("I refuse to write code."));
    provider.push(Stage::CodeGen, Ok("Still refusing."));
    let engine = engine_with(provider);

    let response = engine
        .answer_query("upload-1", "How big is each department?", None)
        .await
        .unwrap();

    let error = response.error.unwrap();
    assert!(error.contains("Code generation exhausted"));
    assert!(response.answer.is_empty());
    assert_eq!(response.chart_kind, ChartKind::None);
    assert!(response.subtask_results.is_empty());
    // The failed attempts are still accounted for.
    assert!(response.calls_made >= 3);
}

#[tokio::test]
async fn later_subtask_failure_keeps_partial_results_but_suppresses_the_chart() {
    let provider = RoutedProvider::new();
    provider.push(
        Stage::CodeGen,
        Ok("let t = sql(\"SELECT * FROM headcount\")\nprint(t)"),
    );
    provider.push(
        Stage::Synthesis,
        Ok("Answer: Engineering leads. | Chart: bar | Data: none"),
    );
    // The second subtask's generation attempts never produce a script.
    provider.push(Stage::CodeGen, Ok("No script from me."));
    provider.push(Stage::CodeGen, Ok("Still nothing."));
    let engine = engine_with(provider);

    let response = engine
        .answer_query(
            "upload-1",
            "Show the top departments by headcount and plot the hiring trend over time",
            None,
        )
        .await
        .unwrap();

    let error = response.error.unwrap();
    assert!(error.contains("Code generation exhausted"));
    assert_eq!(response.subtask_results.len(), 1);
    assert_eq!(response.answer, "Engineering leads.");
    assert_eq!(response.chart_kind, ChartKind::None);
    assert!(response.chart_data.is_none());
    assert!(response.calls_made > 0);
}

#[tokio::test]
async fn failing_script_is_repaired_within_the_execution_ceiling() {
    let provider = RoutedProvider::new();
    provider.push(Stage::CodeGen, Ok("print(broken)"));
    provider.push(Stage::Repair, Ok("print(\"repaired\")"));
    provider.push(Stage::Synthesis, Ok("Answer: repaired fine"));
    let engine = engine_with(provider);

    let response = engine
        .answer_query("upload-1", "How big is each department?", None)
        .await
        .unwrap();

    assert!(response.error.is_none());
    assert_eq!(response.answer, "repaired fine");
    assert_eq!(response.generated_scripts, vec!["print(\"repaired\")"]);
    assert_eq!(engine.execution_count(), 2);
}

#[tokio::test]
async fn quota_pressure_demotes_the_tier_once_and_the_query_still_succeeds() {
    let provider = RoutedProvider::new();
    provider.push(
        Stage::Decomposition,
        Err("googleapi: Error 429: resource_exhausted"),
    );
    provider.push(Stage::Synthesis, Ok("Answer: made it through"));
    let engine = engine_with(provider);

    let response = engine
        .answer_query("upload-1", "How big is each department?", None)
        .await
        .unwrap();

    assert!(response.error.is_none());
    assert_eq!(response.answer, "made it through");
    assert_eq!(engine.pool().current_tier(), ModelTier::Secondary);

    engine.reset_model_tier();
    assert_eq!(engine.pool().current_tier(), ModelTier::Primary);
}

#[tokio::test]
async fn chat_turns_accumulate_and_unknown_chats_are_rejected() {
    let provider = RoutedProvider::new();
    provider.push(Stage::Synthesis, Ok("Answer: first answer"));
    provider.push(Stage::Synthesis, Ok("Answer: second answer"));
    let engine = engine_with(provider);

    let chat_id = engine.create_chat_session("upload-1");
    let first = engine
        .answer_query_with_chat(&chat_id, "How many people?", None)
        .await
        .unwrap();
    assert_eq!(first.turn_count, 1);
    assert_eq!(first.response.answer, "first answer");

    let second = engine
        .answer_query_with_chat(&chat_id, "And salaries?", None)
        .await
        .unwrap();
    assert_eq!(second.turn_count, 2);

    let stats = engine.session_stats();
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.total_messages, 4);

    let err = engine
        .answer_query_with_chat("not-a-chat", "hello", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidChatSession(_)));

    assert!(engine.delete_chat_session(&chat_id));
    assert!(engine
        .answer_query_with_chat(&chat_id, "gone?", None)
        .await
        .is_err());
}

#[tokio::test]
async fn usage_is_tracked_per_credential_and_resets() {
    let provider = RoutedProvider::new();
    let engine = engine_with(provider);

    engine
        .answer_query("upload-1", "How big is each department?", None)
        .await
        .unwrap();

    let usage = engine.credential_usage();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].calls_made >= 3);
    assert!(usage[0].tokens_used > 0);
    assert!(!usage[0].fingerprint.contains("test-credential"));

    engine.reset_usage_counters();
    assert_eq!(engine.credential_usage()[0].calls_made, 0);
}
