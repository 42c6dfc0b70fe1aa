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

use crate::llm::provider::InferenceProvider;
use analysis_contracts::{CredentialUsage, EngineError, EngineResult, ModelTier};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

struct CredentialRecord {
    secret: String,
    calls_made: u64,
    tokens_used: u64,
    last_used: Option<DateTime<Utc>>,
}

struct PoolState {
    credentials: Vec<CredentialRecord>,
    cursor: usize,
}

/// Round-robin pool of provider secrets plus the process-wide model tier.
/// Rotation index and tier are shared across concurrent queries; both live
/// behind their own synchronisation so demotion and selection never race.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    tier: AtomicU8,
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                credentials: Vec::new(),
                cursor: 0,
            }),
            tier: AtomicU8::new(tier_to_u8(ModelTier::Primary)),
        }
    }

    /// Registers a secret after a live validation probe against the provider.
    /// Duplicates and failed probes are rejected.
    pub async fn register(
        &self,
        secret: &str,
        provider: &dyn InferenceProvider,
        probe_model: &str,
    ) -> EngineResult<()> {
        if secret.trim().is_empty() {
            return Err(EngineError::Configuration(
                "credential must not be empty".to_string(),
            ));
        }
        if self.contains(secret) {
            return Err(EngineError::Configuration(
                "credential already registered".to_string(),
            ));
        }
        provider
            .generate(probe_model, secret, "Reply with the single word: ok")
            .await
            .map_err(|e| EngineError::Provider(self.redact_with(secret, &e.to_string())))?;

        self.insert_unchecked(secret);
        info!(
            fingerprint = %fingerprint(secret),
            "Credential validated and added to pool"
        );
        Ok(())
    }

    /// Adds a secret without probing. Used for the configured fallback
    /// credential and for pre-validated secrets.
    pub fn insert_unchecked(&self, secret: &str) {
        let mut state = self.lock_state();
        if state.credentials.iter().any(|c| c.secret == secret) {
            return;
        }
        state.credentials.push(CredentialRecord {
            secret: secret.to_string(),
            calls_made: 0,
            tokens_used: 0,
            last_used: None,
        });
    }

    /// Next secret in rotation. Every registered credential is visited once
    /// before any repeats.
    pub fn next(&self) -> EngineResult<String> {
        let mut state = self.lock_state();
        if state.credentials.is_empty() {
            return Err(EngineError::NoCredentialsAvailable);
        }
        let index = state.cursor % state.credentials.len();
        state.cursor = (index + 1) % state.credentials.len();
        Ok(state.credentials[index].secret.clone())
    }

    pub fn record_usage(&self, secret: &str, tokens: u64) {
        let mut state = self.lock_state();
        if let Some(record) = state.credentials.iter_mut().find(|c| c.secret == secret) {
            record.calls_made += 1;
            record.tokens_used += tokens;
            record.last_used = Some(Utc::now());
        }
    }

    /// Re-inserts the configured fallback credential whenever the pool is
    /// empty, so no call can observe an empty pool.
    pub fn ensure_fallback(&self, fallback: Option<&str>) {
        if let Some(secret) = fallback {
            let empty = self.lock_state().credentials.is_empty();
            if empty {
                warn!("Credential pool empty; re-inserting fallback credential");
                self.insert_unchecked(secret);
            }
        }
    }

    pub fn remove(&self, secret: &str) -> bool {
        let mut state = self.lock_state();
        let before = state.credentials.len();
        state.credentials.retain(|c| c.secret != secret);
        if state.credentials.is_empty() {
            state.cursor = 0;
        }
        state.credentials.len() < before
    }

    pub fn contains(&self, secret: &str) -> bool {
        self.lock_state().credentials.iter().any(|c| c.secret == secret)
    }

    pub fn len(&self) -> usize {
        self.lock_state().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn usage(&self) -> Vec<CredentialUsage> {
        self.lock_state()
            .credentials
            .iter()
            .map(|c| CredentialUsage {
                fingerprint: fingerprint(&c.secret),
                calls_made: c.calls_made,
                tokens_used: c.tokens_used,
                last_used: c.last_used,
            })
            .collect()
    }

    pub fn reset_counters(&self) {
        let mut state = self.lock_state();
        for record in &mut state.credentials {
            record.calls_made = 0;
            record.tokens_used = 0;
        }
        info!("Credential usage counters reset");
    }

    pub fn current_tier(&self) -> ModelTier {
        tier_from_u8(self.tier.load(Ordering::SeqCst))
    }

    /// Demotes the process-wide tier one step. Returns false once tertiary
    /// has been reached; demotion never wraps back up.
    pub fn demote_tier(&self) -> bool {
        loop {
            let current = self.tier.load(Ordering::SeqCst);
            let Some(next) = tier_from_u8(current).demoted() else {
                return false;
            };
            if self
                .tier
                .compare_exchange(current, tier_to_u8(next), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!(tier = %next, "Model tier demoted");
                return true;
            }
        }
    }

    pub fn reset_tier(&self) {
        self.tier
            .store(tier_to_u8(ModelTier::Primary), Ordering::SeqCst);
        info!("Model tier reset to primary");
    }

    /// Replaces every registered secret occurring in `text` with a marker.
    pub fn redact(&self, text: &str) -> String {
        let state = self.lock_state();
        let mut redacted = text.to_string();
        for record in &state.credentials {
            if !record.secret.is_empty() {
                redacted = redacted.replace(&record.secret, "[redacted]");
            }
        }
        redacted
    }

    fn redact_with(&self, extra_secret: &str, text: &str) -> String {
        self.redact(text).replace(extra_secret, "[redacted]")
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn tier_to_u8(tier: ModelTier) -> u8 {
    match tier {
        ModelTier::Primary => 0,
        ModelTier::Secondary => 1,
        ModelTier::Tertiary => 2,
    }
}

fn tier_from_u8(value: u8) -> ModelTier {
    match value {
        0 => ModelTier::Primary,
        1 => ModelTier::Secondary,
        _ => ModelTier::Tertiary,
    }
}

/// Short suffix identifying a secret in logs and admin listings without
/// exposing it.
fn fingerprint(secret: &str) -> String {
    let suffix: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ProviderReply;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl InferenceProvider for AlwaysOk {
        async fn generate(
            &self,
            _model: &str,
            _credential: &str,
            _prompt: &str,
        ) -> EngineResult<ProviderReply> {
            Ok(ProviderReply {
                text: "ok".to_string(),
                tokens_used: Some(1),
            })
        }
    }

    struct AlwaysErr;

    #[async_trait]
    impl InferenceProvider for AlwaysErr {
        async fn generate(
            &self,
            _model: &str,
            credential: &str,
            _prompt: &str,
        ) -> EngineResult<ProviderReply> {
            Err(EngineError::Provider(format!("invalid key {credential}")))
        }
    }

    #[test]
    fn round_robin_visits_every_credential_before_repeating() {
        let pool = CredentialPool::new();
        for secret in ["key-a", "key-b", "key-c"] {
            pool.insert_unchecked(secret);
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.next().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["key-a", "key-b", "key-c"]);
        assert_eq!(pool.next().unwrap(), "key-a");
    }

    #[test]
    fn next_on_empty_pool_fails() {
        let pool = CredentialPool::new();
        assert!(matches!(
            pool.next(),
            Err(EngineError::NoCredentialsAvailable)
        ));
    }

    #[test]
    fn tier_demotion_is_monotonic_and_terminal() {
        let pool = CredentialPool::new();
        assert_eq!(pool.current_tier(), ModelTier::Primary);
        assert!(pool.demote_tier());
        assert_eq!(pool.current_tier(), ModelTier::Secondary);
        assert!(pool.demote_tier());
        assert_eq!(pool.current_tier(), ModelTier::Tertiary);
        assert!(!pool.demote_tier());
        assert!(!pool.demote_tier());
        assert_eq!(pool.current_tier(), ModelTier::Tertiary);
        pool.reset_tier();
        assert_eq!(pool.current_tier(), ModelTier::Primary);
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let pool = CredentialPool::new();
        pool.register("key-a", &AlwaysOk, "model").await.unwrap();
        let err = pool.register("key-a", &AlwaysOk, "model").await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn register_rejects_failed_probe_and_redacts_secret() {
        let pool = CredentialPool::new();
        let err = pool
            .register("sk-secret-1234", &AlwaysErr, "model")
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("sk-secret-1234"));
        assert!(err.to_string().contains("[redacted]"));
        assert!(pool.is_empty());
    }

    #[test]
    fn ensure_fallback_repopulates_empty_pool() {
        let pool = CredentialPool::new();
        pool.ensure_fallback(Some("fallback-key"));
        assert_eq!(pool.len(), 1);
        pool.insert_unchecked("other");
        pool.ensure_fallback(Some("fallback-key"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn usage_counters_accumulate_per_credential() {
        let pool = CredentialPool::new();
        pool.insert_unchecked("key-a");
        pool.record_usage("key-a", 120);
        pool.record_usage("key-a", 30);
        let usage = pool.usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].calls_made, 2);
        assert_eq!(usage[0].tokens_used, 150);
        assert_eq!(usage[0].fingerprint, "…ey-a");
        assert!(usage[0].last_used.is_some());
        pool.reset_counters();
        assert_eq!(pool.usage()[0].calls_made, 0);
    }
}
