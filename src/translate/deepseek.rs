//! DeepSeek API batch translation client.
//! Connection pooling via reqwest, simple min-interval rate limiting, retry
//! on 429/5xx/timeout. One call translates a whole batch: the request carries
//! a JSON array of placeholder-protected strings and the reply must be an
//! array of the same length.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::glossary::Glossary;
use super::normalize::{PlaceholderEntry, PlaceholderProtector};
use super::{GlossaryEntry, TranslationClient};
use crate::config::ApiConfig;
use crate::error::TranslateError;

const MAX_429_RETRIES: u32 = 3;
const MAX_5XX_RETRIES: u32 = 2;

const SYSTEM_PROMPT: &str = "You translate short engineering drawing annotations. \
Input is JSON {\"l\":target language,\"t\":[texts],\"g\":{term:translation}}. \
Reply with JSON {\"t\":[translations]} with exactly one translation per input, same order. \
Keep <<PHn>> tags unchanged. Use the glossary terms when they occur.";

/// DeepSeek chat/completions client.
pub struct DeepSeekClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens_cap: u32,
    glossary: Arc<Glossary>,
    protector: PlaceholderProtector,
    /// Tracks the next allowed request time.
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
}

impl DeepSeekClient {
    /// Build a client from configuration. A missing key is not an error here;
    /// it is reported through `has_api_key` and fails each call.
    pub fn new(config: &ApiConfig, glossary: Arc<Glossary>) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout())
            .build()
            .map_err(|e| TranslateError::Api(e.to_string()))?;

        Ok(Self {
            http,
            api_key: config.resolve_api_key(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens_cap: config.max_tokens.max(64),
            glossary,
            protector: PlaceholderProtector::new(),
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval: config.min_interval(),
        })
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// Send request with retry logic.
    /// 429: Retry-After or 1s/2s/4s (max 3).
    /// 5xx: exponential backoff (max 2).
    /// Timeout: immediate retry once.
    async fn send_with_retry(
        &self,
        api_key: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TranslateError> {
        let mut attempt: u32 = 0;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= MAX_429_RETRIES {
                        return Err(TranslateError::RateLimited { retry_after_ms: 0 });
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= MAX_5XX_RETRIES {
                        return Err(TranslateError::Api(format!(
                            "server error: {}",
                            resp.status()
                        )));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(TranslateError::Api(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(TranslateError::Timeout);
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(TranslateError::Api(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl TranslationClient for DeepSeekClient {
    fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn test_connection(&self) -> bool {
        let Some(api_key) = self.api_key.as_deref() else {
            return false;
        };
        match self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "connection test failed");
                false
            }
        }
    }

    async fn translate_batch(
        &self,
        texts: &[String],
        target_lang: &str,
    ) -> Result<Vec<String>, TranslateError> {
        let api_key = self.api_key.as_deref().ok_or(TranslateError::MissingApiKey)?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if target_lang.trim().is_empty() {
            return Err(TranslateError::InvalidInput("empty target language".into()));
        }

        let (protected, placeholders): (Vec<String>, Vec<Vec<PlaceholderEntry>>) =
            texts.iter().map(|t| self.protector.protect(t)).unzip();
        let glossary = self.glossary.match_batch(texts);

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(&protected, target_lang, &glossary)}
            ],
            "max_tokens": estimate_max_tokens(texts, self.max_tokens_cap),
            "response_format": {"type": "json_object"},
            "stream": false,
            "temperature": 0.1
        });

        self.rate_limit_wait().await;
        let start = Instant::now();
        let response = self.send_with_retry(api_key, &body).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| TranslateError::MalformedResponse(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TranslateError::MalformedResponse("no choices".into()))?;

        let translated = parse_reply(&content, texts.len())?;
        debug!(
            count = texts.len(),
            tokens = completion.usage.map(|u| u.total_tokens).unwrap_or(0),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch translated"
        );

        Ok(translated
            .iter()
            .zip(&placeholders)
            .map(|(t, entries)| self.protector.restore(t.trim(), entries))
            .collect())
    }
}

// --- Prompt construction ---

#[derive(Serialize)]
struct UserPrompt<'a> {
    l: &'a str,
    t: &'a [String],
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    g: serde_json::Map<String, serde_json::Value>,
}

/// Compact prompt: {"l":"en","t":["..."],"g":{"src":"tgt"}}
fn build_user_prompt(texts: &[String], target_lang: &str, glossary: &[GlossaryEntry]) -> String {
    let g = glossary
        .iter()
        .map(|e| (e.source.clone(), serde_json::Value::String(e.target.clone())))
        .collect();
    let prompt = UserPrompt {
        l: target_lang,
        t: texts,
        g,
    };
    // Serializing plain strings cannot fail.
    serde_json::to_string(&prompt).unwrap_or_default()
}

/// Estimate max_tokens: (input_tokens * 1.15 + 32 per item), within [64, cap].
fn estimate_max_tokens(texts: &[String], cap: u32) -> u32 {
    // Rough: ~3 bytes/token across Latin and CJK
    let estimated: f64 = texts
        .iter()
        .map(|t| t.len() as f64 / 3.0 * 1.15 + 32.0)
        .sum();
    (estimated as u32).clamp(64, cap)
}

#[derive(Deserialize)]
struct BatchReply {
    t: Vec<String>,
}

/// Parse `{"t":[...]}` and check it answers every input.
fn parse_reply(content: &str, expected: usize) -> Result<Vec<String>, TranslateError> {
    let content = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let reply: BatchReply = serde_json::from_str(content)
        .map_err(|e| TranslateError::MalformedResponse(e.to_string()))?;
    if reply.t.len() != expected {
        return Err(TranslateError::MalformedResponse(format!(
            "expected {expected} translations, got {}",
            reply.t.len()
        )));
    }
    Ok(reply.t)
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}
