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

use crate::llm::credential_pool::CredentialPool;
use crate::llm::provider::InferenceProvider;
use crate::llm::utils::strip_code_fence;
use analysis_contracts::{EngineConfig, EngineError, EngineResult, TierModels};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provider error fragments classified as quota/rate-limit pressure.
const LIMIT_SIGNALS: [&str; 7] = [
    "quota",
    "rate limit",
    "429",
    "resource exhausted",
    "resource_exhausted",
    "unavailable",
    "503",
];

/// Wraps one inference call: credential selection, tier-to-model resolution,
/// fence stripping, limit classification with a single demote-and-retry, and
/// secret redaction on every propagated error.
pub struct InferenceGateway {
    pool: Arc<CredentialPool>,
    provider: Arc<dyn InferenceProvider>,
    tier_models: TierModels,
    fallback_credential: Option<String>,
    calls_made: AtomicU64,
    tokens_used: AtomicU64,
}

impl InferenceGateway {
    pub fn new(
        pool: Arc<CredentialPool>,
        provider: Arc<dyn InferenceProvider>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            tier_models: config.tier_models.clone(),
            fallback_credential: config.fallback_credential.clone(),
            calls_made: AtomicU64::new(0),
            tokens_used: AtomicU64::new(0),
        }
    }

    /// Issues one model call. A limit-classified failure demotes the global
    /// tier once and retries the same credential once; anything else
    /// propagates redacted.
    pub async fn call(&self, prompt: &str, credential: Option<&str>) -> EngineResult<String> {
        self.pool.ensure_fallback(self.fallback_credential.as_deref());
        let secret = match credential {
            Some(given) => given.to_string(),
            None => self.pool.next()?,
        };

        let mut demoted_once = false;
        loop {
            let tier = self.pool.current_tier();
            let model = self.tier_models.model_for(tier);
            debug!(%tier, model, "Dispatching inference call");
            self.calls_made.fetch_add(1, Ordering::SeqCst);

            match self.provider.generate(model, &secret, prompt).await {
                Ok(reply) => {
                    let tokens = reply.tokens_used.unwrap_or(0);
                    self.tokens_used.fetch_add(tokens, Ordering::SeqCst);
                    self.pool.record_usage(&secret, tokens);
                    return Ok(strip_code_fence(&reply.text));
                }
                Err(e) => {
                    let detail = e.to_string();
                    if !demoted_once && is_limit_error(&detail) {
                        demoted_once = true;
                        let changed = self.pool.demote_tier();
                        warn!(
                            demoted = changed,
                            "Limit-classified provider error; retrying once on current tier"
                        );
                        continue;
                    }
                    return Err(EngineError::Provider(self.pool.redact(&detail)));
                }
            }
        }
    }

    pub fn calls_made(&self) -> u64 {
        self.calls_made.load(Ordering::SeqCst)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.calls_made.store(0, Ordering::SeqCst);
        self.tokens_used.store(0, Ordering::SeqCst);
        info!("Gateway call counters reset");
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }
}

fn is_limit_error(detail: &str) -> bool {
    let lowered = detail.to_lowercase();
    LIMIT_SIGNALS.iter().any(|signal| lowered.contains(signal))
}
