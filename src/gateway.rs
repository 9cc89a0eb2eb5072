// src/gateway.rs
//! LLM gateway: the single call-and-validate boundary between the pipeline
//! and any language-model provider.
//!
//! Two operations exist behind it: semantic rule matching and digest
//! summarization. The gateway owns per-call timeouts, bounded retries with
//! exponential backoff, and response-shape validation; callers never see a
//! provider's wire format. Policy split: `match_semantic` fails open (a
//! degraded dependency must not cause alert storms), `summarize` fails
//! closed (never emit a partial digest).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// Low-level provider: performs one remote completion call. Separated from
/// the gateway so production and tests share the same retry/validation
/// wrapper.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, GatewayError>;
    fn name(&self) -> &'static str;
}

pub type DynProvider = Arc<dyn LlmProvider>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-attempt deadline.
    pub call_timeout: Duration,
    /// Total attempts, first call included.
    pub max_attempts: u32,
    /// Backoff base; attempt n sleeps base * 2^n.
    pub backoff_base: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(20),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/// One group's share of a digest draft, as returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupDraft {
    pub headline: String,
    pub detail: String,
}

/// Validated summarization output: one entry per story group, in input
/// order, plus the overall "what changed" narrative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DigestDraft {
    pub groups: Vec<GroupDraft>,
    pub narrative: String,
}

/// Input for one story group handed to `summarize`.
#[derive(Debug, Clone, Serialize)]
pub struct GroupInput {
    /// Multilingual member texts, earliest first.
    pub texts: Vec<String>,
    /// Channel addresses that carried the story.
    pub sources: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SemanticVerdict {
    #[serde(rename = "match")]
    is_match: bool,
    confidence: f32,
}

pub struct LlmGateway {
    provider: DynProvider,
    cfg: GatewayConfig,
}

impl LlmGateway {
    pub fn new(provider: DynProvider, cfg: GatewayConfig) -> Self {
        Self { provider, cfg }
    }

    /// Does `text` satisfy the natural-language `criterion`?
    ///
    /// Fail-open: timeout, exhausted retries, or persistent shape trouble
    /// all yield `(false, 0.0)` — logged, never surfaced as an error.
    pub async fn match_semantic(&self, text: &str, criterion: &str) -> (bool, f32) {
        let prompt = semantic_prompt(text, criterion);
        match self.call_validated::<SemanticVerdict, _>(&prompt, |_| Ok(())).await {
            Ok(v) => {
                let confidence = v.confidence.clamp(0.0, 1.0);
                (v.is_match, confidence)
            }
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "semantic match degraded, failing open");
                (false, 0.0)
            }
        }
    }

    /// Summarize story groups into a single-language digest draft.
    ///
    /// Fail-closed: after the retry budget the error surfaces to the digest
    /// generator, which must not deliver a partial digest.
    pub async fn summarize(
        &self,
        groups: &[GroupInput],
        target_lang: &str,
    ) -> Result<DigestDraft, GatewayError> {
        let prompt = summary_prompt(groups, target_lang);
        let expected = groups.len();
        self.call_validated(&prompt, |d: &DigestDraft| {
            if d.groups.len() == expected {
                Ok(())
            } else {
                Err(GatewayError::InvalidResponse(format!(
                    "expected {expected} group summaries, got {}",
                    d.groups.len()
                )))
            }
        })
        .await
    }

    /// Retry loop shared by both operations: timeout per attempt, exponential
    /// backoff between attempts, JSON and shape validation. A malformed or
    /// wrongly-shaped response is retried like a transient failure (the
    /// re-ask), then surfaced.
    async fn call_validated<T, F>(&self, prompt: &str, validate: F) -> Result<T, GatewayError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&T) -> Result<(), GatewayError>,
    {
        let mut last: GatewayError = GatewayError::Timeout;
        for attempt in 0..self.cfg.max_attempts {
            if attempt > 0 {
                let delay = self.cfg.backoff_base * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
            let outcome = tokio::time::timeout(self.cfg.call_timeout, self.provider.complete(prompt)).await;
            match outcome {
                Err(_) => {
                    debug!(attempt, "gateway call timed out");
                    last = GatewayError::Timeout;
                }
                Ok(Err(e)) => {
                    debug!(attempt, error = %e, "provider call failed");
                    last = e;
                }
                Ok(Ok(raw)) => match parse_json_payload::<T>(&raw) {
                    Ok(v) => match validate(&v) {
                        Ok(()) => return Ok(v),
                        Err(e) => {
                            debug!(attempt, error = %e, "provider response failed validation");
                            last = e;
                        }
                    },
                    Err(e) => {
                        debug!(attempt, error = %e, "malformed provider response");
                        last = e;
                    }
                },
            }
        }
        Err(GatewayError::Exhausted(Box::new(last)))
    }
}

/// Models wrap JSON in prose or code fences often enough that we cut the
/// payload out of the first `{` .. last `}` span before parsing.
fn parse_json_payload<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, GatewayError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let slice = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => {
            return Err(GatewayError::InvalidResponse(
                "no JSON object in response".to_string(),
            ))
        }
    };
    serde_json::from_str(slice).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

fn semantic_prompt(text: &str, criterion: &str) -> String {
    format!(
        "You are a precise content classifier.\n\
         Decide whether the POST satisfies the CRITERION.\n\n\
         CRITERION: {criterion}\n\n\
         POST:\n{text}\n\n\
         Respond with ONLY a JSON object: {{\"match\": true|false, \"confidence\": 0.0-1.0}}"
    )
}

fn summary_prompt(groups: &[GroupInput], target_lang: &str) -> String {
    let mut body = String::new();
    for (i, g) in groups.iter().enumerate() {
        use std::fmt::Write as _;
        let _ = writeln!(&mut body, "=== STORY {} (sources: {}) ===", i + 1, g.sources.join(", "));
        for t in &g.texts {
            let _ = writeln!(&mut body, "- {t}");
        }
    }
    format!(
        "You are a professional news editor. The stories below were collected \
         from monitored channels in multiple languages. Write the digest \
         entirely in language '{target_lang}'.\n\n{body}\n\
         For EVERY story produce a concise headline and 1-3 sentences of \
         supporting detail, preserving concrete facts. Then write a short \
         'what changed' narrative across all stories.\n\
         Respond with ONLY a JSON object:\n\
         {{\"groups\": [{{\"headline\": \"...\", \"detail\": \"...\"}}, ...], \"narrative\": \"...\"}}\n\
         The groups array MUST have exactly one entry per story, in order."
    )
}

// ------------------------------------------------------------
// Providers
// ------------------------------------------------------------

/// OpenAI-compatible chat-completions provider. Requires `OPENAI_API_KEY`.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiProvider {
    /// `model_override`: pass Some("gpt-4o") to override; defaults to gpt-4o-mini.
    pub fn new(model_override: Option<&str>) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let http = reqwest::Client::builder()
            .user_agent("channelwatch/0.1 (+github.com/lumlich/channelwatch)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key,
            model: model_override.unwrap_or("gpt-4o-mini").to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, GatewayError> {
        if self.api_key.is_empty() {
            return Err(GatewayError::Provider("OPENAI_API_KEY not set".to_string()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
            temperature: 0.1,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Provider(format!("http {}", resp.status())));
        }

        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::InvalidResponse("empty choices".to_string()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Deterministic scripted provider for tests and offline runs. Responses
/// are consumed front-to-back; once the script is empty the fallback is
/// returned forever.
pub struct StubProvider {
    script: Mutex<std::collections::VecDeque<Result<String, GatewayError>>>,
    fallback: String,
}

impl StubProvider {
    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(std::collections::VecDeque::new()),
            fallback: fallback.into(),
        }
    }

    pub fn scripted(
        script: Vec<Result<String, GatewayError>>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: fallback.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, GatewayError> {
        let mut script = self.script.lock().await;
        match script.pop_front() {
            Some(r) => r,
            None => Ok(self.fallback.clone()),
        }
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}
