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

use analysis_contracts::{ColumnInfo, EngineError, EngineResult, RowSet, TableSchema};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read-only tabular query capability injected into the sandbox. The engine
/// assumes nothing beyond "execute a read query, get rows back".
pub trait TabularQuery: Send + Sync {
    fn execute(&self, query: &str) -> EngineResult<RowSet>;
}

/// Collaborator owning uploaded data: schema introspection plus a per-session
/// query handle. Parsing of uploads happens outside the engine.
pub trait DataAccess: Send + Sync {
    fn table_schemas(&self, session_id: &str) -> EngineResult<Vec<TableSchema>>;
    fn query_handle(&self, session_id: &str) -> EngineResult<Arc<dyn TabularQuery>>;
}

/// The bound pair handed to the sandbox for one execution.
pub struct DataHandle {
    pub session_id: String,
    pub query: Arc<dyn TabularQuery>,
}

struct MemoryTable {
    schema: TableSchema,
    data: RowSet,
}

/// In-memory `DataAccess` implementation backing the demo binary and the
/// integration tests.
#[derive(Default)]
pub struct MemoryDataset {
    sessions: RwLock<HashMap<String, Vec<MemoryTable>>>,
}

impl MemoryDataset {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_table(
        &self,
        session_id: &str,
        name: &str,
        columns: &[(&str, &str)],
        rows: Vec<Vec<serde_json::Value>>,
        sample_rows: usize,
    ) {
        let schema = TableSchema {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(col, ty)| ColumnInfo {
                    name: (*col).to_string(),
                    data_type: (*ty).to_string(),
                })
                .collect(),
            sample_rows: rows.iter().take(sample_rows).cloned().collect(),
        };
        let data = RowSet {
            columns: columns.iter().map(|(col, _)| (*col).to_string()).collect(),
            rows,
        };
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(MemoryTable { schema, data });
    }
}

impl DataAccess for MemoryDataset {
    fn table_schemas(&self, session_id: &str) -> EngineResult<Vec<TableSchema>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .get(session_id)
            .map(|tables| tables.iter().map(|t| t.schema.clone()).collect())
            .unwrap_or_default())
    }

    fn query_handle(&self, session_id: &str) -> EngineResult<Arc<dyn TabularQuery>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        if !sessions.contains_key(session_id) {
            return Err(EngineError::NoSchemaForSession(session_id.to_string()));
        }
        Ok(Arc::new(MemoryQueryHandle {
            tables: sessions
                .get(session_id)
                .map(|tables| {
                    tables
                        .iter()
                        .map(|t| (t.schema.name.clone(), t.data.clone()))
                        .collect()
                })
                .unwrap_or_default(),
        }))
    }
}

/// Fixture-grade query handle: resolves the first table whose name appears in
/// the query text, else the first table of the session. Real deployments
/// inject a proper relational backend here.
struct MemoryQueryHandle {
    tables: Vec<(String, RowSet)>,
}

impl TabularQuery for MemoryQueryHandle {
    fn execute(&self, query: &str) -> EngineResult<RowSet> {
        let lowered = query.to_lowercase();
        let matched = self
            .tables
            .iter()
            .find(|(name, _)| lowered.contains(&name.to_lowercase()))
            .or_else(|| self.tables.first());
        matched
            .map(|(_, data)| data.clone())
            .ok_or_else(|| EngineError::Internal("no tables available for query".to_string()))
    }
}
