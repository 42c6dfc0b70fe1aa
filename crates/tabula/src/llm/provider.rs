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

use analysis_contracts::{EngineError, EngineResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// One completion from the external inference service.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub text: String,
    pub tokens_used: Option<u64>,
}

/// Abstract "call the model" capability. Transport failures must carry the
/// provider's own error text so the gateway can classify quota pressure.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        credential: &str,
        prompt: &str,
    ) -> EngineResult<ProviderReply>;
}

/// Gemini REST client. The credential travels as a query parameter, so it is
/// never logged here; the gateway additionally redacts it from error text.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

impl GeminiClient {
    pub fn new(request_timeout: Duration) -> EngineResult<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, request_timeout)
    }

    pub fn with_base_url(base_url: &str, request_timeout: Duration) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl InferenceProvider for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        credential: &str,
        prompt: &str,
    ) -> EngineResult<ProviderReply> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, credential
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.1 }
        });

        debug!(model, "Sending generateContent request");
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("request failed: {e}")))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Provider(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            let detail = payload["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            return Err(EngineError::Provider(format!("{status}: {detail}")));
        }

        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                EngineError::Provider("response contained no candidate text".to_string())
            })?
            .to_string();
        let tokens_used = payload["usageMetadata"]["totalTokenCount"].as_u64();

        debug!(model, tokens = ?tokens_used, "Received completion");
        Ok(ProviderReply { text, tokens_used })
    }
}
