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
use crate::engine::prompts;
use crate::llm::gateway::InferenceGateway;
use crate::sandbox::executor::{is_execution_error, SandboxedExecutor};
use analysis_contracts::{EngineError, EngineResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Execute-and-repair loop with a hard attempt ceiling. A failed execution
/// triggers one model round asking for a patched script; a patch that is
/// itself invalid, or identical to the failing script, burns the attempt by
/// re-running the original unchanged.
pub struct RepairLoop {
    gateway: Arc<InferenceGateway>,
    executor: Arc<SandboxedExecutor>,
    max_attempts: usize,
}

impl RepairLoop {
    pub fn new(
        gateway: Arc<InferenceGateway>,
        executor: Arc<SandboxedExecutor>,
        max_attempts: usize,
    ) -> Self {
        Self {
            gateway,
            executor,
            max_attempts,
        }
    }

    /// Runs `script` until it produces a non-error output or the attempt
    /// ceiling is hit. Returns the script that finally succeeded together
    /// with its captured output.
    pub async fn run_with_repair(
        &self,
        question: &str,
        script: &str,
        handle: &DataHandle,
        credential: Option<&str>,
    ) -> EngineResult<(String, String)> {
        let mut current = script.to_string();
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let output = self.executor.run(&current, handle);
            if !is_execution_error(&output) {
                debug!(attempt, "Script executed successfully");
                return Ok((current, output));
            }
            warn!(attempt, error = %output, "Script execution failed");
            last_error = output.clone();

            if attempt == self.max_attempts {
                break;
            }
            let prompt = prompts::repair(question, &current, &output);
            match self.gateway.call(&prompt, credential).await {
                Ok(patched) => {
                    if patched.trim() == current.trim() || self.executor.validate(&patched).is_err()
                    {
                        warn!(attempt, "Repair produced no usable patch; retrying unchanged");
                    } else {
                        current = patched;
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Repair call failed; retrying unchanged");
                }
            }
        }

        Err(EngineError::ExecutionExhausted(format!(
            "script still failing after {} attempt(s); last error: {last_error}",
            self.max_attempts
        )))
    }
}
