//! Turning captured page content into structured treatment records.
//!
//! The acquisition side never calls this module; the orchestrator hands finished
//! snapshots over once a site's acquisition has terminated.

use async_trait::async_trait;
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::config::{ExtractionConfig, ExtractionProvider};
use crate::fingerprint::{text_outside, NON_VISIBLE_TAGS};
use crate::models::{generate_id, parse_price_value, ContentSnapshot, IndividualTreatment, TreatmentProduct};
use crate::prompts::{PromptCatalog, PromptTemplate};
use crate::utils::error::{AppError, Result};

const EXTRACTION_EXCLUDED_TAGS: &[&str] = &["nav", "footer", "header"];

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid fence pattern"));
static BARE_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid object pattern"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma pattern"));

/// What the extractor knows about the site a snapshot came from.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub site_id: String,
    pub site_name: String,
}

#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Records found in one snapshot. Pages with too little text yield an empty list.
    async fn extract(&self, context: &ExtractionContext, snapshot: &ContentSnapshot) -> Result<Vec<TreatmentProduct>>;
}

/// Visible page text with navigation chrome removed, cut to `max_chars`. `None` when
/// fewer than `min_chars` remain.
pub fn prepare_text(html: &str, max_chars: usize, min_chars: usize) -> Option<String> {
    let excluded: Vec<&str> = NON_VISIBLE_TAGS
        .iter()
        .chain(EXTRACTION_EXCLUDED_TAGS)
        .copied()
        .collect();
    let text = text_outside(html, &excluded);
    let text = text.trim();

    if text.chars().count() < min_chars {
        return None;
    }

    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => Some(format!("{}...", &text[..cut])),
        None => Some(text.to_string()),
    }
}

/// Pull the JSON object out of a model reply: a ```json fence if present, else the
/// outermost braces. Trailing commas are forgiven.
pub fn parse_model_reply(reply: &str) -> Result<Value> {
    let candidate = if reply.contains("```json") {
        match FENCED_JSON.captures(reply).and_then(|c| c.get(1)) {
            Some(body) => body.as_str().to_string(),
            // unterminated fence
            None => reply.split_once("```json").map(|(_, rest)| rest.trim().to_string()).unwrap_or_default(),
        }
    } else {
        BARE_OBJECT
            .find(reply)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| AppError::Validation("no JSON object in model reply".to_string()))?
    };

    match serde_json::from_str(&candidate) {
        Ok(value) => Ok(value),
        Err(first) => {
            let repaired = TRAILING_COMMA.replace_all(&candidate, "$1");
            serde_json::from_str(&repaired).map_err(|_| AppError::Serialization(first))
        }
    }
}

/// Map the model's JSON to records. Products without a name or without any named
/// treatment are dropped.
pub fn products_from_json(data: &Value, context: &ExtractionContext, snapshot: &ContentSnapshot) -> Vec<TreatmentProduct> {
    let text = |v: &Value, key: &str| -> Option<String> {
        v.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let strings = |v: &Value, key: &str| -> Vec<String> {
        v.get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };

    let clinic_name = text(data, "clinic_name").unwrap_or_else(|| context.site_name.clone());
    let category = text(data, "category");
    let page_description = text(data, "description");
    let scraped_at = Utc::now();

    let Some(products) = data.get("products").and_then(Value::as_array) else {
        return Vec::new();
    };

    products
        .iter()
        .filter_map(|product| {
            let product_name = text(product, "product_name")?;

            let treatments: Vec<IndividualTreatment> = product
                .get("treatments")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|t| {
                    Some(IndividualTreatment {
                        name: text(t, "name")?,
                        dosage: t.get("dosage").and_then(parse_dosage),
                        unit: text(t, "unit"),
                        equipments: strings(t, "equipments"),
                        medications: strings(t, "medications"),
                        target_area: strings(t, "target_area"),
                        description: text(t, "description"),
                    })
                })
                .collect();
            if treatments.is_empty() {
                return None;
            }

            Some(TreatmentProduct {
                id: generate_id(),
                site_id: context.site_id.clone(),
                clinic_name: clinic_name.clone(),
                source_url: snapshot.source_url.clone(),
                product_name,
                category: category.clone(),
                original_price: product.get("product_original_price").and_then(parse_price_value),
                event_price: product.get("product_event_price").and_then(parse_price_value),
                description: text(product, "product_description").or_else(|| page_description.clone()),
                treatments,
                captured_at_step: snapshot.captured_at_step,
                scraped_at,
            })
        })
        .collect()
}

fn parse_dosage(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![GeminiPart { text: text.to_string() }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model-backed extraction over HTTP. The wire format follows
/// `ExtractionConfig::provider`; prompts come from a versioned template file.
pub struct HttpExtractionService {
    client: reqwest::Client,
    config: ExtractionConfig,
    system_prompt: PromptTemplate,
    extraction_prompt: PromptTemplate,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl HttpExtractionService {
    pub fn new(config: ExtractionConfig) -> Result<Self> {
        let prompts = match &config.prompts_path {
            Some(path) => PromptCatalog::load(path)?,
            None => PromptCatalog::builtin()?,
        };
        Self::with_prompts(config, &prompts)
    }

    pub fn with_prompts(config: ExtractionConfig, prompts: &PromptCatalog) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()?;
        let limiter = Quota::with_period(config.request_spacing()).map(RateLimiter::direct);

        info!(
            provider = %config.provider,
            model = %config.model,
            prompts_version = %prompts.version,
            "Extraction client ready"
        );

        Ok(Self {
            client,
            system_prompt: prompts.get("system")?.clone(),
            extraction_prompt: prompts.get("extraction")?.clone(),
            config,
            limiter,
        })
    }

    fn api_base(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        match self.config.provider {
            ExtractionProvider::OpenAi => self.complete_chat(prompt).await,
            ExtractionProvider::Anthropic => self.complete_messages(prompt).await,
            ExtractionProvider::Gemini => self.complete_gemini(prompt).await,
        }
    }

    async fn complete_chat(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt.template.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.api_base()))
            .json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let body: ChatResponse = builder.send().await?.error_for_status()?.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AppError::Validation("model reply had no choices".to_string()))
    }

    async fn complete_messages(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.config.model,
            system: &self.system_prompt.template,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/messages", self.api_base()))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("x-api-key", api_key);
        }

        let body: MessagesResponse = builder.send().await?.error_for_status()?.json().await?;
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(AppError::Validation("model reply had no text blocks".to_string()));
        }
        Ok(text)
    }

    async fn complete_gemini(&self, prompt: &str) -> Result<String> {
        let request = GenerateContentRequest {
            system_instruction: GeminiContent::text(None, &self.system_prompt.template),
            contents: vec![GeminiContent::text(Some("user"), prompt)],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_tokens,
            },
        };

        let mut builder = self
            .client
            .post(format!("{}/models/{}:generateContent", self.api_base(), self.config.model))
            .json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("x-goog-api-key", api_key);
        }

        let body: GenerateContentResponse = builder.send().await?.error_for_status()?.json().await?;
        body.candidates
            .into_iter()
            .next()
            .map(|candidate| candidate.content.parts.into_iter().map(|part| part.text).collect::<String>())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| AppError::Validation("model reply had no candidates".to_string()))
    }
}

/// Rate limits, server errors and network hiccups are worth another attempt.
fn is_transient(error: &AppError) -> bool {
    match error {
        AppError::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.status().is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
        }
        _ => false,
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionService {
    async fn extract(&self, context: &ExtractionContext, snapshot: &ContentSnapshot) -> Result<Vec<TreatmentProduct>> {
        let wrap = |message: String| AppError::Extraction {
            source_url: snapshot.source_url.clone(),
            message,
        };

        let Some(text) = prepare_text(
            &snapshot.raw_content,
            self.config.max_content_chars,
            self.config.min_content_chars,
        ) else {
            debug!(site = %context.site_id, url = %snapshot.source_url, "Page text too short, skipping extraction");
            return Ok(Vec::new());
        };

        let prompt = self.extraction_prompt.render(&[
            ("source_url", snapshot.source_url.as_str()),
            ("text_content", text.as_str()),
        ]);

        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.config.retry_delay_ms / 2).max(1))
            .max_delay(Duration::from_secs(60))
            .take(self.config.retry_attempts);

        let prompt = prompt.as_str();
        let reply = RetryIf::spawn(
            strategy,
            move || async move {
                let attempt = self.complete(prompt).await;
                if let Err(e) = &attempt {
                    warn!(site = %context.site_id, url = %snapshot.source_url, error = %e, "Extraction request failed");
                }
                attempt
            },
            is_transient,
        )
        .await
        .map_err(|e| wrap(e.to_string()))?;

        let data = parse_model_reply(&reply).map_err(|e| wrap(e.to_string()))?;
        let products = products_from_json(&data, context, snapshot);

        info!(
            site = %context.site_id,
            url = %snapshot.source_url,
            step = snapshot.captured_at_step,
            products = products.len(),
            chars = text.chars().count(),
            prompt_version = %self.extraction_prompt.version,
            "Extraction complete"
        );
        Ok(products)
    }
}
