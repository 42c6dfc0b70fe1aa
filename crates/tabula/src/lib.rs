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

pub mod data;
pub mod engine;
pub mod llm;
pub mod sandbox;
pub mod session;

pub use analysis_contracts::*;
pub use data::{DataAccess, DataHandle, MemoryDataset, TabularQuery};
pub use engine::AnalysisEngine;
pub use llm::credential_pool::CredentialPool;
pub use llm::gateway::InferenceGateway;
pub use llm::provider::{GeminiClient, InferenceProvider, ProviderReply};
pub use sandbox::executor::{SandboxedExecutor, ERROR_MARKER};
pub use session::{ChatSession, ChatSessionManager, SessionContext};
