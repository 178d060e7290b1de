use crate::constants::{GENERATION_INFO_MAX_ATTEMPTS, GENERATION_INFO_RETRY_DELAY_MS, MAX_ERROR_BODY_CHARS};
use crate::hardening::{is_not_found, RetryPolicy};
use crate::specs::openai::GenerationResponse;
use crate::types::*;
use std::time::Duration;

/// Looks up authoritative usage for an OpenRouter generation.
///
/// The record usually appears a moment after the stream ends, so a 404 is
/// retried on a fixed delay. Every other failure gives up at once, and giving
/// up is never an error for the caller.
pub struct GenerationInfoFetcher {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl GenerationInfoFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            policy: RetryPolicy::fixed(
                GENERATION_INFO_MAX_ATTEMPTS,
                Duration::from_millis(GENERATION_INFO_RETRY_DELAY_MS),
            )
            .retry_on(is_not_found),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, generation_id: &str, api_key: &str) -> Option<GenerationInfo> {
        let url = format!("{}/generation", self.base_url.trim_end_matches('/'));
        let url = url.as_str();
        tracing::debug!("[⚙️  -> ☁️ ] Fetching generation info for {}", generation_id);

        match self
            .policy
            .execute_with_retry(move || self.fetch_once(url, generation_id, api_key))
            .await
        {
            Ok(info) => {
                tracing::info!(
                    "[☁️  -> ⚙️ ] Generation {}: {} prompt + {} completion tokens, ${:.6}",
                    generation_id,
                    info.tokens_prompt,
                    info.tokens_completion,
                    info.total_cost
                );
                Some(info)
            }
            Err(e) => {
                tracing::warn!("No usage data for generation {}: {}", generation_id, e);
                None
            }
        }
    }

    async fn fetch_once(&self, url: &str, generation_id: &str, api_key: &str) -> Result<GenerationInfo> {
        let response = self
            .client
            .get(url)
            .query(&[("id", generation_id)])
            .bearer_auth(api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(ColloquyError::Upstream(status, body).into());
        }

        let parsed: GenerationResponse = response.json().await?;
        Ok(parsed.data)
    }
}
