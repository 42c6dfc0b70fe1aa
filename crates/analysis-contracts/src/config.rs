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

use crate::types::ModelTier;
use serde::{Deserialize, Serialize};

/// Model name resolved for each fallback tier. The tier itself is owned by
/// the credential pool; this is only the tier-to-model mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierModels {
    pub primary: String,
    pub secondary: String,
    pub tertiary: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            primary: "gemini-2.0-flash".to_string(),
            secondary: "gemini-2.0-flash-lite".to_string(),
            tertiary: "gemini-1.5-flash".to_string(),
        }
    }
}

impl TierModels {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.primary,
            ModelTier::Secondary => &self.secondary,
            ModelTier::Tertiary => &self.tertiary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub tier_models: TierModels,
    pub max_code_generation_attempts: usize,
    pub max_execution_attempts: usize,
    pub max_synthesis_attempts: usize,
    pub sample_rows_per_table: usize,
    pub history_cap: usize,
    pub session_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Credential re-inserted whenever the pool would otherwise be empty.
    pub fallback_credential: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tier_models: TierModels::default(),
            max_code_generation_attempts: 2,
            max_execution_attempts: 3,
            max_synthesis_attempts: 2,
            sample_rows_per_table: 2,
            history_cap: 20,
            session_timeout_secs: 3600,
            request_timeout_secs: 30,
            fallback_credential: None,
        }
    }
}

impl EngineConfig {
    /// Builds a config from the process environment, falling back to the
    /// defaults for anything unset. `.env` files are honoured.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self {
            fallback_credential: std::env::var("GEMINI_API_KEY").ok(),
            ..Self::default()
        };

        if let Ok(model) = std::env::var("TABULA_PRIMARY_MODEL") {
            config.tier_models.primary = model;
        }
        if let Ok(model) = std::env::var("TABULA_SECONDARY_MODEL") {
            config.tier_models.secondary = model;
        }
        if let Ok(model) = std::env::var("TABULA_TERTIARY_MODEL") {
            config.tier_models.tertiary = model;
        }
        if let Some(timeout) = env_parse("TABULA_SESSION_TIMEOUT_SECS") {
            config.session_timeout_secs = timeout;
        }
        if let Some(cap) = env_parse("TABULA_HISTORY_CAP") {
            config.history_cap = cap;
        }
        if let Some(timeout) = env_parse("TABULA_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = timeout;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ceilings_match_documented_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_code_generation_attempts, 2);
        assert_eq!(config.max_execution_attempts, 3);
        assert_eq!(config.max_synthesis_attempts, 2);
        assert_eq!(config.history_cap, 20);
        assert_eq!(config.session_timeout_secs, 3600);
    }

    #[test]
    fn tier_models_resolve_in_order() {
        let models = TierModels::default();
        assert_eq!(models.model_for(ModelTier::Primary), "gemini-2.0-flash");
        assert_ne!(
            models.model_for(ModelTier::Secondary),
            models.model_for(ModelTier::Tertiary)
        );
    }
}
