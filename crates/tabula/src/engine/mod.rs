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

//! Query orchestration: decompose, generate, execute-with-repair, synthesise.
//! Every model-facing stage runs under an explicit attempt ceiling; exhaustion
//! surfaces in the response's `error` field rather than panicking or looping.

pub mod codegen;
pub mod decomposer;
pub mod prompts;
pub mod repair;
pub mod synthesis;

use crate::data::{DataAccess, DataHandle};
use crate::llm::credential_pool::CredentialPool;
use crate::llm::gateway::InferenceGateway;
use crate::llm::provider::InferenceProvider;
use crate::sandbox::executor::SandboxedExecutor;
use crate::session::ChatSessionManager;
use analysis_contracts::{
    ChartKind, ChatQueryResponse, CredentialUsage, EngineConfig, EngineError, EngineResult,
    QueryResponse, SessionStats, SessionSummary, Subtask, SubtaskResult, TableSchema,
};
use codegen::CodeGenerator;
use decomposer::TaskDecomposer;
use repair::RepairLoop;
use std::sync::Arc;
use synthesis::{merge_results, Synthesizer};
use tracing::{info, instrument, warn};

/// Facade over the whole pipeline. Construction wires every stage to one
/// shared credential pool, gateway and executor; all collaborators are
/// injected, nothing global.
pub struct AnalysisEngine {
    config: EngineConfig,
    data: Arc<dyn DataAccess>,
    provider: Arc<dyn InferenceProvider>,
    pool: Arc<CredentialPool>,
    gateway: Arc<InferenceGateway>,
    executor: Arc<SandboxedExecutor>,
    codegen: CodeGenerator,
    repair: RepairLoop,
    decomposer: TaskDecomposer,
    synthesizer: Synthesizer,
    sessions: ChatSessionManager,
}

impl AnalysisEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn InferenceProvider>,
        data: Arc<dyn DataAccess>,
    ) -> Self {
        let pool = Arc::new(CredentialPool::new());
        let gateway = Arc::new(InferenceGateway::new(
            pool.clone(),
            provider.clone(),
            &config,
        ));
        let executor = Arc::new(SandboxedExecutor::new());
        let codegen = CodeGenerator::new(gateway.clone(), executor.clone(), &config);
        let repair = RepairLoop::new(
            gateway.clone(),
            executor.clone(),
            config.max_execution_attempts,
        );
        let decomposer = TaskDecomposer::new(gateway.clone(), &config);
        let synthesizer = Synthesizer::new(gateway.clone(), config.max_synthesis_attempts);
        let sessions = ChatSessionManager::new(config.session_timeout_secs, config.history_cap);
        Self {
            config,
            data,
            provider,
            pool,
            gateway,
            executor,
            codegen,
            repair,
            decomposer,
            synthesizer,
            sessions,
        }
    }

    /// Answers one question against an uploaded data session. Stage
    /// exhaustion never escapes as an `Err`: completed subtasks, counters and
    /// the failure reason all come back in the response body.
    #[instrument(skip(self, question, credential))]
    pub async fn answer_query(
        &self,
        session_id: &str,
        question: &str,
        credential: Option<&str>,
    ) -> EngineResult<QueryResponse> {
        let schemas = self.data.table_schemas(session_id)?;
        if schemas.is_empty() {
            return Err(EngineError::NoSchemaForSession(session_id.to_string()));
        }
        let handle = DataHandle {
            session_id: session_id.to_string(),
            query: self.data.query_handle(session_id)?,
        };
        Ok(self
            .run_pipeline(question, &schemas, &handle, credential)
            .await)
    }

    async fn run_pipeline(
        &self,
        question: &str,
        schemas: &[TableSchema],
        handle: &DataHandle,
        credential: Option<&str>,
    ) -> QueryResponse {
        let calls_before = self.gateway.calls_made();
        let tokens_before = self.gateway.tokens_used();

        let mut subtasks = self.decomposer.decompose(question, schemas, credential).await;
        subtasks.sort_by_key(|s| s.priority);
        info!(count = subtasks.len(), "Question decomposed");

        let mut results: Vec<SubtaskResult> = Vec::with_capacity(subtasks.len());
        let mut failure: Option<String> = None;
        for subtask in subtasks {
            match self
                .run_subtask(&subtask, schemas, handle, credential)
                .await
            {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(subtask = %subtask.description, error = %e, "Subtask failed");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let generated_scripts: Vec<String> =
            results.iter().map(|r| r.script.clone()).collect();
        let (answer, mut chart_kind, mut chart_data) = if results.is_empty() {
            (String::new(), ChartKind::None, None)
        } else {
            merge_results(&results)
        };
        // A partial failure keeps the completed answers and counters but
        // never presents a chart.
        if failure.is_some() {
            chart_kind = ChartKind::None;
            chart_data = None;
        }

        QueryResponse {
            answer,
            chart_kind,
            chart_data,
            generated_scripts,
            calls_made: self.gateway.calls_made() - calls_before,
            tokens_used: self.gateway.tokens_used() - tokens_before,
            subtask_results: results,
            error: failure,
        }
    }

    async fn run_subtask(
        &self,
        subtask: &Subtask,
        schemas: &[TableSchema],
        handle: &DataHandle,
        credential: Option<&str>,
    ) -> EngineResult<SubtaskResult> {
        let calls_before = self.gateway.calls_made();
        let tokens_before = self.gateway.tokens_used();

        let script = self
            .codegen
            .generate(&subtask.question, schemas, credential)
            .await?;
        let (script, raw_output) = self
            .repair
            .run_with_repair(&subtask.question, &script, handle, credential)
            .await?;
        let synthesized = self
            .synthesizer
            .synthesize(&subtask.question, &raw_output, subtask.chart_kind, credential)
            .await?;

        Ok(SubtaskResult {
            subtask: subtask.clone(),
            script,
            raw_output,
            answer: synthesized.answer,
            chart_kind: synthesized.chart_kind,
            chart_data: synthesized.chart_data,
            calls_made: self.gateway.calls_made() - calls_before,
            tokens_used: self.gateway.tokens_used() - tokens_before,
        })
    }

    /// Conversational variant: validates the chat, reuses its cached schema
    /// snapshot, and folds the completed turn into the session history.
    pub async fn answer_query_with_chat(
        &self,
        chat_id: &str,
        question: &str,
        credential: Option<&str>,
    ) -> EngineResult<ChatQueryResponse> {
        let session = self.sessions.touch(chat_id)?;

        let schemas = if session.context.schemas.is_empty() {
            let resolved = self.data.table_schemas(&session.data_session_id)?;
            if resolved.is_empty() {
                return Err(EngineError::NoSchemaForSession(
                    session.data_session_id.clone(),
                ));
            }
            self.sessions.set_schemas(chat_id, resolved.clone())?;
            resolved
        } else {
            session.context.schemas.clone()
        };

        let handle = DataHandle {
            session_id: session.data_session_id.clone(),
            query: self.data.query_handle(&session.data_session_id)?,
        };
        let response = self
            .run_pipeline(question, &schemas, &handle, credential)
            .await;
        let turn_count =
            self.sessions
                .record_turn(chat_id, question, &response.answer, response.chart_kind)?;

        Ok(ChatQueryResponse {
            response,
            chat_id: chat_id.to_string(),
            turn_count,
        })
    }

    // Credential administration.

    /// Probes the secret against the current primary model, then adds it to
    /// the rotation.
    pub async fn register_credential(&self, secret: &str) -> EngineResult<()> {
        let model = self
            .config
            .tier_models
            .model_for(self.pool.current_tier())
            .to_string();
        self.pool
            .register(secret, self.provider.as_ref(), &model)
            .await
    }

    pub fn remove_credential(&self, secret: &str) -> bool {
        self.pool.remove(secret)
    }

    pub fn credential_usage(&self) -> Vec<CredentialUsage> {
        self.pool.usage()
    }

    pub fn reset_usage_counters(&self) {
        self.pool.reset_counters();
        self.gateway.reset_counters();
    }

    pub fn reset_model_tier(&self) {
        self.pool.reset_tier();
    }

    // Chat session administration.

    pub fn create_chat_session(&self, data_session_id: &str) -> String {
        self.sessions.create(data_session_id)
    }

    pub fn delete_chat_session(&self, chat_id: &str) -> bool {
        self.sessions.delete(chat_id)
    }

    pub fn list_chat_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.list()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    pub fn sweep_expired_sessions(&self) -> usize {
        self.sessions.sweep_expired()
    }

    // Introspection used by callers and tests.

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn execution_count(&self) -> u64 {
        self.executor.execution_count()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
