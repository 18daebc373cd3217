use std::fmt;

use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiktoken_rs::{CoreBPE, o200k_base};
use tokio::time::Duration;

use crate::config::Settings;
use crate::fallback::first_success;
use crate::retry::{RetryPolicy, retry_with_backoff};

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_MODEL: &str = "gemini-2.0-flash";

/// Tried in order until one answers with text.
pub const DEFAULT_CHAIN: &[(&str, &str)] = &[
    ("v1beta", "gemini-2.5-flash"),
    ("v1", "gemini-2.5-flash"),
    ("v1beta", "gemini-2.0-flash"),
    ("v1", "gemini-2.0-flash"),
    ("v1beta", "gemini-pro"),
    ("v1", "gemini-pro"),
];

/// Preferred models when asking the API which ones this key may use.
pub const DISCOVERY_PREFERENCES: &[&str] = &["gemini-2.5-flash", "gemini-2.0-flash", "gemini-1.5-flash"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Gemini { version: String, model: String },
    OpenAi { model: String },
}

impl Backend {
    pub fn gemini(version: &str, model: &str) -> Self {
        Backend::Gemini {
            version: version.to_string(),
            model: model.trim_start_matches("models/").to_string(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Gemini { version, model } => write!(f, "{version}/{model}"),
            Backend::OpenAi { model } => write!(f, "openai/{model}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub config: Option<GenerationConfig>,
    /// Turn the provider's content filters down to BLOCK_NONE.
    pub relaxed_safety: bool,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        GenerateRequest {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn relaxed(mut self) -> Self {
        self.relaxed_safety = true;
        self
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, rename = "supportedGenerationMethods")]
    pub supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Thin REST client for the Gemini `generateContent` and `models` endpoints.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    root: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, root: &str, api_key: &str) -> Self {
        GeminiClient {
            http,
            root: root.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// `Ok(None)` means the call went through but carried no text.
    pub async fn generate(&self, version: &str, model: &str, req: &GenerateRequest) -> Result<Option<String>> {
        let url = format!("{}/{}/models/{}:generateContent", self.root, version, model);

        let mut body = json!({
            "contents": [{ "parts": [{ "text": req.prompt }] }],
        });
        if let Some(config) = &req.config {
            body["generationConfig"] = serde_json::to_value(config)?;
        }
        if req.relaxed_safety {
            body["safetySettings"] = json!([
                { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE" },
                { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" },
                { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" },
                { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE" }
            ]);
        }

        debug!("POST {} ({} prompt chars)", url, req.prompt.len());
        let response = self
            .http
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .timeout(GENERATE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Request to {version}/{model} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("HTTP {} from {}/{}: {}", status, version, model, truncate(&detail, 200)));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse generateContent response")?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(text)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/v1beta/models", self.root);
        let response = self
            .http
            .get(&url)
            .query(&[("key", &self.api_key)])
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .context("Listing models failed")?
            .error_for_status()
            .context("Listing models was refused")?;
        let list: ModelList = response.json().await.context("Failed to parse model list")?;
        Ok(list.models)
    }

    /// Ask which models this key may call, falling back to a fixed model when the listing fails.
    pub async fn discover_model(&self, preferences: &[&str]) -> String {
        match self.list_models().await {
            Ok(models) => pick_model(&models, preferences, FALLBACK_MODEL),
            Err(e) => {
                debug!("Model discovery failed, using {}: {:#}", FALLBACK_MODEL, e);
                FALLBACK_MODEL.to_string()
            }
        }
    }
}

/// First preferred model that supports `generateContent`, else the first capable one.
pub fn pick_model(models: &[ModelInfo], preferences: &[&str], default: &str) -> String {
    let capable: Vec<&str> = models
        .iter()
        .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
        .map(|m| m.name.trim_start_matches("models/"))
        .collect();

    preferences
        .iter()
        .find(|pref| capable.contains(pref))
        .map(|pref| pref.to_string())
        .or_else(|| capable.first().map(|m| m.to_string()))
        .unwrap_or_else(|| default.to_string())
}

#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    pub fn new(api_key: &str) -> Self {
        let config = OpenAIConfig::default().with_api_key(api_key);
        OpenAiBackend {
            client: Client::with_config(config),
        }
    }

    async fn generate(&self, model: &str, req: &GenerateRequest) -> Result<Option<String>> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(model)
            .messages([ChatCompletionRequestUserMessage::from(req.prompt.clone()).into()]);
        if let Some(max) = req.config.as_ref().and_then(|c| c.max_output_tokens) {
            builder.max_completion_tokens(max);
        }
        if let Some(temperature) = req.config.as_ref().and_then(|c| c.temperature) {
            builder.temperature(temperature);
        }
        let request = builder.build().context("Failed to build OpenAI request")?;

        let start_time = std::time::Instant::now();
        let response = match tokio::time::timeout(GENERATE_TIMEOUT, self.client.chat().create(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(api_error)) => return Err(anyhow!("OpenAI API error: {}", api_error)),
            Err(_) => {
                return Err(anyhow!(
                    "OpenAI API call timed out after {:?}",
                    start_time.elapsed()
                ))
            }
        };
        debug!("OpenAI call completed in {:?}", start_time.elapsed());

        Ok(response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()))
    }
}

/// Generation with model fallback and bounded retries.
#[derive(Clone)]
pub struct TextGenerator {
    gemini: GeminiClient,
    openai: Option<OpenAiBackend>,
    chain: Vec<Backend>,
    retry: RetryPolicy,
}

impl TextGenerator {
    pub fn from_settings(settings: &Settings, http: reqwest::Client) -> Result<Self> {
        let gemini = GeminiClient::new(http, &settings.gemini_api_root, settings.gemini_key()?);
        let mut chain: Vec<Backend> = DEFAULT_CHAIN
            .iter()
            .map(|(version, model)| Backend::gemini(version, model))
            .collect();

        let openai = settings.openai_api_key.as_deref().map(OpenAiBackend::new);
        if openai.is_some() {
            chain.push(Backend::OpenAi {
                model: settings.openai_model.clone(),
            });
        }

        let retry = RetryPolicy::new(settings.ai_max_retries, settings.ai_backoff_base);
        Ok(TextGenerator::new(gemini, openai, chain, retry))
    }

    pub fn new(gemini: GeminiClient, openai: Option<OpenAiBackend>, chain: Vec<Backend>, retry: RetryPolicy) -> Self {
        TextGenerator {
            gemini,
            openai,
            chain,
            retry,
        }
    }

    async fn call(&self, backend: &Backend, req: &GenerateRequest) -> Result<Option<String>> {
        match backend {
            Backend::Gemini { version, model } => self.gemini.generate(version, model, req).await,
            Backend::OpenAi { model } => match &self.openai {
                Some(openai) => openai.generate(model, req).await,
                None => Err(anyhow!("OpenAI backend is not configured")),
            },
        }
    }

    async fn run_chain(&self, chain: &[Backend], req: &GenerateRequest) -> Result<String> {
        retry_with_backoff(self.retry, "Text generation", || async move {
            let (backend, text) = first_success(chain.iter().cloned(), |backend| async move {
                self.call(&backend, req).await
            })
            .await?;
            info!("Generated {} chars with {}", text.len(), backend);
            Ok(text)
        })
        .await
    }

    /// Walk the configured chain until a model answers.
    pub async fn generate(&self, req: &GenerateRequest) -> Result<String> {
        self.run_chain(&self.chain, req).await
    }

    /// Like [`generate`](Self::generate), but first asks the API which model this key supports
    /// and tries that one before the configured chain.
    pub async fn generate_discovered(&self, req: &GenerateRequest) -> Result<String> {
        let discovered = Backend::gemini("v1beta", &self.gemini.discover_model(DISCOVERY_PREFERENCES).await);
        debug!("Discovered model {}", discovered);
        let mut chain = vec![discovered.clone()];
        chain.extend(self.chain.iter().filter(|b| **b != discovered).cloned());
        self.run_chain(&chain, req).await
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn decode_first_n_tokens(bpe: &CoreBPE, s: &str, n: usize) -> String {
    if n == 0 || s.is_empty() {
        return String::new();
    }
    let ids = bpe.encode_with_special_tokens(s);
    let keep = ids.len().min(n);
    bpe.decode(ids[..keep].to_vec()).unwrap_or_default()
}

/// Keep at most `max_tokens` tokens of `text` so source material does not crowd out the prompt.
pub fn trim_to_tokens(text: &str, max_tokens: usize) -> Result<String> {
    let bpe = o200k_base().map_err(|e| anyhow!("Failed to load tokenizer: {e}"))?;
    let count = bpe.encode_with_special_tokens(text).len();
    if count <= max_tokens {
        return Ok(text.to_string());
    }
    debug!("Trimming source text from {} to {} tokens", count, max_tokens);
    Ok(decode_first_n_tokens(&bpe, text, max_tokens))
}
