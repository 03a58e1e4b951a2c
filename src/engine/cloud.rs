//! Gemini `generateContent` backend.
//!
//! One POST per turn:
//!
//! ```text
//! POST {base_url}/models/{model}:generateContent?key={api_key}
//! { "contents": [{"parts": [{"text": prompt}]}],
//!   "generationConfig": {"temperature", "topP", "maxOutputTokens"},
//!   "safetySettings": [{"category", "threshold"}, ...] }
//! ```
//!
//! The reply is `candidates[0].content.parts[0].text`, returned verbatim.

use super::{GenerateOptions, GenerationBackend, GenerationResult};
use crate::config::CloudConfig;
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Safety categories the request always carries.
const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_p: f64,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting<'a> {
    category: &'a str,
    threshold: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Cloud generation backend.
#[derive(Debug, Clone)]
pub struct CloudBackend {
    client: reqwest::Client,
    config: CloudConfig,
}

impl CloudBackend {
    pub fn new(config: CloudConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Endpoint URL with the key as a query parameter.
    fn endpoint(&self, api_key: &str) -> Result<url::Url> {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = url::Url::parse(&format!(
            "{base}/models/{}:generateContent",
            self.config.model
        ))
        .map_err(|e| CompanionError::Config(format!("invalid cloud endpoint: {e}")))?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    fn build_body<'a>(&'a self, prompt: &'a str) -> GenerateContentRequest<'a> {
        GenerateContentRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                max_output_tokens: self.config.max_output_tokens,
            },
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: &self.config.safety_threshold,
                })
                .collect(),
        }
    }

    /// Perform the request and extract the first candidate's text.
    async fn request(&self, prompt: &str, api_key: &str) -> Result<String> {
        let url = self.endpoint(api_key)?;
        let body = self.build_body(prompt);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CompanionError::Network(format!("generation request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let excerpt: String = body_text.chars().take(300).collect();
            return Err(CompanionError::Network(format!("HTTP {status}: {excerpt}")));
        }

        let decoded: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| CompanionError::Protocol(format!("undecodable response: {}", e.without_url())))?;

        decoded
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| CompanionError::Protocol("response has no candidate text".into()))
    }
}

#[async_trait]
impl GenerationBackend for CloudBackend {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> GenerationResult {
        let Some(api_key) = options.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            warn!("cloud generation skipped: no API key configured");
            return GenerationResult::NoOutput;
        };

        debug!("cloud generation: prompt_chars={}", prompt.chars().count());
        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, self.request(prompt, api_key)).await {
            Ok(Ok(text)) => GenerationResult::from_text(text),
            Ok(Err(e)) => {
                warn!("cloud generation failed: {e}");
                GenerationResult::NoOutput
            }
            Err(_) => {
                warn!("cloud generation timed out after {}s", timeout.as_secs());
                GenerationResult::NoOutput
            }
        }
    }
}
