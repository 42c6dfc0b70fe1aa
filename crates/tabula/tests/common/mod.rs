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

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tabula::{EngineResult, InferenceProvider, MemoryDataset, ProviderReply};

/// Pipeline stage a prompt belongs to, recognised by the stage-specific
/// phrasing each prompt builder pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decomposition,
    CodeGen,
    Repair,
    Synthesis,
}

fn classify(prompt: &str) -> Stage {
    if prompt.contains("JSON array of subtasks") {
        Stage::Decomposition
    } else if prompt.contains("failed to execute") {
        Stage::Repair
    } else if prompt.contains("Summarise the result") {
        Stage::Synthesis
    } else {
        Stage::CodeGen
    }
}

/// Test double that answers each pipeline stage from its own reply queue.
/// An exhausted queue falls back to a benign default, so tests only script
/// the stages they care about. `Err` entries surface as provider failures.
pub struct RoutedProvider {
    decomposition: Mutex<VecDeque<Result<String, String>>>,
    codegen: Mutex<VecDeque<Result<String, String>>>,
    repair: Mutex<VecDeque<Result<String, String>>>,
    synthesis: Mutex<VecDeque<Result<String, String>>>,
    pub stages_seen: Mutex<Vec<Stage>>,
}

impl RoutedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            decomposition: Mutex::new(VecDeque::new()),
            codegen: Mutex::new(VecDeque::new()),
            repair: Mutex::new(VecDeque::new()),
            synthesis: Mutex::new(VecDeque::new()),
            stages_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, stage: Stage, reply: Result<&str, &str>) {
        let queue = match stage {
            Stage::Decomposition => &self.decomposition,
            Stage::CodeGen => &self.codegen,
            Stage::Repair => &self.repair,
            Stage::Synthesis => &self.synthesis,
        };
        queue
            .lock()
            .unwrap()
            .push_back(reply.map(String::from).map_err(String::from));
    }

    fn default_reply(stage: Stage) -> String {
        match stage {
            // Prose on purpose: decomposition falls back to keywords.
            Stage::Decomposition => "Let me think about that.".to_string(),
            Stage::CodeGen | Stage::Repair => "print(\"ok\")".to_string(),
            Stage::Synthesis => "Answer: ok | Chart: none | Data: none".to_string(),
        }
    }
}

#[async_trait]
impl InferenceProvider for RoutedProvider {
    async fn generate(
        &self,
        _model: &str,
        _credential: &str,
        prompt: &str,
    ) -> EngineResult<ProviderReply> {
        let stage = classify(prompt);
        self.stages_seen.lock().unwrap().push(stage);
        let queue = match stage {
            Stage::Decomposition => &self.decomposition,
            Stage::CodeGen => &self.codegen,
            Stage::Repair => &self.repair,
            Stage::Synthesis => &self.synthesis,
        };
        let reply = queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::default_reply(stage)));
        reply
            .map(|text| ProviderReply {
                text,
                tokens_used: Some(7),
            })
            .map_err(tabula::EngineError::Provider)
    }
}

/// One uploaded data session with a pre-aggregated headcount table and a raw
/// employees table.
pub fn company_dataset() -> Arc<MemoryDataset> {
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
            vec![json!("Barbara"), json!("Sales"), json!(61000)],
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
        ],
        2,
    );
    dataset
}
