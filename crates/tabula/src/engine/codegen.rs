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
use crate::sandbox::executor::SandboxedExecutor;
use analysis_contracts::{EngineConfig, EngineError, EngineResult, TableSchema};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bounded generate-and-validate loop. Each attempt asks the gateway for a
/// script and syntax-checks it; rejection reasons accumulate into the next
/// attempt's prompt. Exhaustion is a hard error, never a silent retry.
pub struct CodeGenerator {
    gateway: Arc<InferenceGateway>,
    executor: Arc<SandboxedExecutor>,
    max_attempts: usize,
    sample_rows: usize,
}

impl CodeGenerator {
    pub fn new(
        gateway: Arc<InferenceGateway>,
        executor: Arc<SandboxedExecutor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            gateway,
            executor,
            max_attempts: config.max_code_generation_attempts,
            sample_rows: config.sample_rows_per_table,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        schemas: &[TableSchema],
        credential: Option<&str>,
    ) -> EngineResult<String> {
        let mut failures: Vec<String> = Vec::new();
        for attempt in 1..=self.max_attempts {
            let prompt =
                prompts::code_generation(question, schemas, self.sample_rows, attempt, &failures);
            let reply = self.gateway.call(&prompt, credential).await?;
            match self.executor.validate(&reply) {
                Ok(()) => {
                    debug!(attempt, "Generated script passed validation");
                    return Ok(reply);
                }
                Err(reason) => {
                    warn!(attempt, %reason, "Generated reply rejected");
                    failures.push(reason);
                }
            }
        }
        Err(EngineError::CodeGenerationExhausted(format!(
            "no valid script after {} attempt(s); last rejection: {}",
            self.max_attempts,
            failures.pop().unwrap_or_default()
        )))
    }
}
