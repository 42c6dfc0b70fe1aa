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

//! TTL-bounded conversational sessions. Expiry is lazy: nothing runs in the
//! background, expired entries are dropped on the sweep that precedes each
//! access path.

use analysis_contracts::{
    ChartKind, EngineError, EngineResult, SessionStats, SessionSummary, TableSchema,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: &'static str,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Conversational context carried between turns of one chat.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub schemas: Vec<TableSchema>,
    pub data_summary: Option<String>,
    pub last_query: Option<String>,
    pub last_answer: Option<String>,
    pub last_chart: ChartKind,
    pub history: VecDeque<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub chat_id: String,
    pub data_session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub turn_count: u64,
    pub context: SessionContext,
}

/// Concurrent session registry keyed by chat id.
pub struct ChatSessionManager {
    sessions: DashMap<String, ChatSession>,
    timeout_secs: u64,
    history_cap: usize,
}

impl ChatSessionManager {
    pub fn new(timeout_secs: u64, history_cap: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout_secs,
            history_cap,
        }
    }

    /// Opens a new chat bound to an uploaded data session and returns its id.
    pub fn create(&self, data_session_id: &str) -> String {
        self.sweep_expired();
        let chat_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.sessions.insert(
            chat_id.clone(),
            ChatSession {
                chat_id: chat_id.clone(),
                data_session_id: data_session_id.to_string(),
                created_at: now,
                last_activity: now,
                message_count: 0,
                turn_count: 0,
                context: SessionContext::default(),
            },
        );
        info!(%chat_id, data_session_id, "Chat session created");
        chat_id
    }

    /// Snapshot of a live session, refreshing its activity timestamp.
    /// Expired or unknown ids fail with `InvalidChatSession`.
    pub fn touch(&self, chat_id: &str) -> EngineResult<ChatSession> {
        self.sweep_expired();
        let mut entry = self
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| EngineError::InvalidChatSession(chat_id.to_string()))?;
        entry.last_activity = Utc::now();
        Ok(entry.clone())
    }

    /// Caches the schema snapshot resolved on the session's first turn,
    /// together with a one-line description of the data it covers.
    pub fn set_schemas(&self, chat_id: &str, schemas: Vec<TableSchema>) -> EngineResult<()> {
        let mut entry = self
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| EngineError::InvalidChatSession(chat_id.to_string()))?;
        let tables: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        entry.context.data_summary = Some(format!(
            "{} table(s): {}",
            schemas.len(),
            tables.join(", ")
        ));
        entry.context.schemas = schemas;
        Ok(())
    }

    /// Records one completed question/answer turn: both messages enter the
    /// history (oldest evicted beyond the cap) and the turn counter advances.
    pub fn record_turn(
        &self,
        chat_id: &str,
        question: &str,
        answer: &str,
        chart: ChartKind,
    ) -> EngineResult<u64> {
        let mut entry = self
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| EngineError::InvalidChatSession(chat_id.to_string()))?;
        let now = Utc::now();
        for (role, content) in [("user", question), ("assistant", answer)] {
            entry.context.history.push_back(HistoryEntry {
                role,
                content: content.to_string(),
                at: now,
            });
            entry.message_count += 1;
        }
        while entry.context.history.len() > self.history_cap {
            entry.context.history.pop_front();
        }
        entry.context.last_query = Some(question.to_string());
        entry.context.last_answer = Some(answer.to_string());
        entry.context.last_chart = chart;
        entry.last_activity = now;
        entry.turn_count += 1;
        Ok(entry.turn_count)
    }

    pub fn delete(&self, chat_id: &str) -> bool {
        let removed = self.sessions.remove(chat_id).is_some();
        if removed {
            info!(%chat_id, "Chat session deleted");
        }
        removed
    }

    /// Drops every session idle beyond the timeout. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now() - Duration::seconds(i64::try_from(self.timeout_secs).unwrap_or(0));
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.last_activity >= cutoff);
        let swept = before - self.sessions.len();
        if swept > 0 {
            debug!(swept, "Expired chat sessions removed");
        }
        swept
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sweep_expired();
        self.sessions
            .iter()
            .map(|entry| SessionSummary {
                chat_id: entry.chat_id.clone(),
                data_session_id: entry.data_session_id.clone(),
                created_at: entry.created_at,
                last_activity: entry.last_activity,
                message_count: entry.message_count,
            })
            .collect()
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.list();
        SessionStats {
            active_sessions: sessions.len(),
            total_messages: sessions.iter().map(|s| s.message_count).sum(),
            session_timeout_secs: self.timeout_secs,
            sessions,
        }
    }

    #[cfg(test)]
    fn backdate(&self, chat_id: &str, seconds: i64) {
        if let Some(mut entry) = self.sessions.get_mut(chat_id) {
            entry.last_activity = Utc::now() - Duration::seconds(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_session_is_reachable_and_touch_refreshes() {
        let manager = ChatSessionManager::new(3600, 20);
        let chat_id = manager.create("data-1");
        let session = manager.touch(&chat_id).unwrap();
        assert_eq!(session.data_session_id, "data-1");
        assert_eq!(session.turn_count, 0);
    }

    #[test]
    fn unknown_session_is_invalid() {
        let manager = ChatSessionManager::new(3600, 20);
        assert!(matches!(
            manager.touch("nope"),
            Err(EngineError::InvalidChatSession(_))
        ));
    }

    #[test]
    fn history_is_capped_fifo() {
        let manager = ChatSessionManager::new(3600, 20);
        let chat_id = manager.create("data-1");
        for turn in 0..15 {
            manager
                .record_turn(&chat_id, &format!("q{turn}"), "a", ChartKind::None)
                .unwrap();
        }
        let session = manager.touch(&chat_id).unwrap();
        assert_eq!(session.context.history.len(), 20);
        assert_eq!(session.message_count, 30);
        // Oldest entries evicted first: q0 through q4 are gone.
        assert_eq!(session.context.history.front().unwrap().content, "q5");
    }

    #[test]
    fn turn_count_advances_per_answered_query() {
        let manager = ChatSessionManager::new(3600, 20);
        let chat_id = manager.create("data-1");
        assert_eq!(
            manager.record_turn(&chat_id, "q", "a", ChartKind::None).unwrap(),
            1
        );
        assert_eq!(
            manager.record_turn(&chat_id, "q", "a", ChartKind::Bar).unwrap(),
            2
        );
        let session = manager.touch(&chat_id).unwrap();
        assert_eq!(session.context.last_chart, ChartKind::Bar);
    }

    #[test]
    fn sweep_removes_exactly_the_expired_sessions() {
        let manager = ChatSessionManager::new(3600, 20);
        let stale = manager.create("data-1");
        let fresh = manager.create("data-2");
        manager.backdate(&stale, 3601);

        assert_eq!(manager.sweep_expired(), 1);
        assert!(manager.touch(&stale).is_err());
        assert!(manager.touch(&fresh).is_ok());
    }

    #[test]
    fn expired_session_is_invalid_even_without_explicit_sweep() {
        let manager = ChatSessionManager::new(3600, 20);
        let chat_id = manager.create("data-1");
        manager.backdate(&chat_id, 7200);
        assert!(matches!(
            manager.touch(&chat_id),
            Err(EngineError::InvalidChatSession(_))
        ));
    }

    #[test]
    fn stats_aggregate_across_sessions() {
        let manager = ChatSessionManager::new(3600, 20);
        let a = manager.create("data-1");
        let b = manager.create("data-2");
        manager.record_turn(&a, "q", "a", ChartKind::None).unwrap();
        manager.record_turn(&b, "q", "a", ChartKind::None).unwrap();
        manager.record_turn(&b, "q2", "a2", ChartKind::None).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.total_messages, 6);
        assert_eq!(stats.session_timeout_secs, 3600);
    }

    #[test]
    fn delete_is_idempotent() {
        let manager = ChatSessionManager::new(3600, 20);
        let chat_id = manager.create("data-1");
        assert!(manager.delete(&chat_id));
        assert!(!manager.delete(&chat_id));
    }
}
