use crate::error::{CondenseError, ProviderError};
use crate::summarize::config::ProviderConfig;
use crate::summarize::usage::CallKind;
use crate::summarize::util::{truncate_with_ellipsis, word_count};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MAX_ERROR_BODY_CHARS: usize = 300;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub kind: CallKind,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;

    fn label(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    OpenAi,
    Anthropic,
    Gemini,
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn label(self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAiCompatible => "openai-compatible",
        }
    }

    fn default_base_url(self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com"),
            ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com"),
            ProviderKind::Local | ProviderKind::OpenAiCompatible => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSpec")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ProviderSpec {
    fn local(model: &str) -> Self {
        Self {
            kind: ProviderKind::Local,
            model: model.to_string(),
            api_key: None,
            base_url: None,
        }
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

pub fn parse_provider_alias(raw: &str) -> Option<ProviderKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "local" | "offline" => Some(ProviderKind::Local),
        "openai" => Some(ProviderKind::OpenAi),
        "anthropic" | "claude" => Some(ProviderKind::Anthropic),
        "gemini" | "google" => Some(ProviderKind::Gemini),
        "openai-compatible" | "compatible" | "deepseek" => Some(ProviderKind::OpenAiCompatible),
        _ => None,
    }
}

fn parse_prefixed_model(raw: &str) -> (Option<ProviderKind>, String) {
    let trimmed = raw.trim();
    if let Some((prefix, model)) = trimmed.split_once(':')
        && let Some(provider) = parse_provider_alias(prefix)
    {
        return (Some(provider), model.trim().to_string());
    }
    (None, trimmed.to_string())
}

fn infer_provider_from_model(model: &str) -> Option<ProviderKind> {
    let lower = model.trim().to_ascii_lowercase();
    if lower == "local" || lower.starts_with("local-") {
        return Some(ProviderKind::Local);
    }
    if lower.starts_with("deepseek-") {
        return Some(ProviderKind::OpenAiCompatible);
    }
    if lower.starts_with("claude-") {
        return Some(ProviderKind::Anthropic);
    }
    if lower.starts_with("gemini-") {
        return Some(ProviderKind::Gemini);
    }
    if lower.starts_with("gpt-")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4")
    {
        return Some(ProviderKind::OpenAi);
    }
    None
}

fn first_available_provider(lookup: &dyn Fn(&str) -> Option<String>) -> Option<ProviderKind> {
    if lookup("AI_API_KEY").is_some() {
        return Some(ProviderKind::OpenAiCompatible);
    }
    if lookup("OPENAI_API_KEY").is_some() {
        return Some(ProviderKind::OpenAi);
    }
    if lookup("ANTHROPIC_API_KEY").is_some() {
        return Some(ProviderKind::Anthropic);
    }
    if lookup("GEMINI_API_KEY").is_some() {
        return Some(ProviderKind::Gemini);
    }
    None
}

fn resolve_api_key(kind: ProviderKind, lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    match kind {
        ProviderKind::Local => None,
        ProviderKind::OpenAi => lookup("OPENAI_API_KEY").or_else(|| lookup("AI_API_KEY")),
        ProviderKind::Anthropic => lookup("ANTHROPIC_API_KEY").or_else(|| lookup("AI_API_KEY")),
        ProviderKind::Gemini => lookup("GEMINI_API_KEY").or_else(|| lookup("AI_API_KEY")),
        ProviderKind::OpenAiCompatible => lookup("AI_API_KEY")
            .or_else(|| lookup("DEEPSEEK_API_KEY"))
            .or_else(|| lookup("OPENAI_API_KEY")),
    }
}

fn resolve_compatible_base_url(model: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(base) = lookup("AI_BASE_URL") {
        return Some(base);
    }
    if model.trim().to_ascii_lowercase().starts_with("deepseek-") {
        return Some("https://api.deepseek.com".to_string());
    }
    None
}

/// Picks the provider for `model`: explicit override, then a `provider:`
/// prefix, then the model family, then whichever credentials are present.
/// A remote provider without credentials degrades to the local one.
pub fn resolve_provider_spec_with(
    model: &str,
    cfg: &ProviderConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ProviderSpec, CondenseError> {
    let explicit = match cfg.name.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => Some(parse_provider_alias(raw).ok_or_else(|| CondenseError::ProviderSetup {
            model: model.to_string(),
            reason: format!("unknown provider `{raw}`"),
        })?),
        None => None,
    };
    let (prefixed, bare) = parse_prefixed_model(model);
    if bare.is_empty() {
        return Err(CondenseError::ProviderSetup {
            model: model.to_string(),
            reason: "empty model identifier".to_string(),
        });
    }

    let kind = explicit
        .or(prefixed)
        .or_else(|| infer_provider_from_model(&bare))
        .or_else(|| first_available_provider(lookup))
        .unwrap_or(ProviderKind::Local);
    if kind == ProviderKind::Local {
        return Ok(ProviderSpec::local(&bare));
    }

    let Some(api_key) = resolve_api_key(kind, lookup) else {
        warn!(
            provider = kind.label(),
            model = %bare,
            "no provider credentials found; falling back to local provider"
        );
        return Ok(ProviderSpec::local(&bare));
    };

    let base_url = cfg
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| match kind {
            ProviderKind::OpenAiCompatible => resolve_compatible_base_url(&bare, lookup),
            _ => None,
        })
        .or_else(|| kind.default_base_url().map(str::to_string));
    let Some(base_url) = base_url else {
        return Err(CondenseError::ProviderSetup {
            model: model.to_string(),
            reason: "openai-compatible provider requires AI_BASE_URL".to_string(),
        });
    };

    Ok(ProviderSpec {
        kind,
        model: bare,
        api_key: Some(api_key),
        base_url: Some(base_url),
    })
}

pub fn resolve_provider_spec(model: &str, cfg: &ProviderConfig) -> Result<ProviderSpec, CondenseError> {
    resolve_provider_spec_with(model, cfg, &env_non_empty)
}

fn classify_transport(err: &reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout.as_secs())
    } else if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

async fn post_json(builder: RequestBuilder, timeout: Duration) -> Result<Value, ProviderError> {
    let response = builder
        .send()
        .await
        .map_err(|err| classify_transport(&err, timeout))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(
            status.as_u16(),
            truncate_with_ellipsis(&body, MAX_ERROR_BODY_CHARS),
        ));
    }
    response
        .json::<Value>()
        .await
        .map_err(|err| ProviderError::Malformed(format!("invalid json body: {err}")))
}

fn finish(provider: &str, text: Option<String>, usage: Option<TokenUsage>) -> Result<Completion, ProviderError> {
    let text = text.ok_or_else(|| {
        ProviderError::Malformed(format!("{provider} response missing text content"))
    })?;
    if text.trim().is_empty() {
        return Err(ProviderError::EmptyContent(format!(
            "{provider} returned blank text"
        )));
    }
    let usage = usage
        .ok_or_else(|| ProviderError::Malformed(format!("{provider} response missing usage")))?;
    Ok(Completion {
        text: text.trim().to_string(),
        usage,
    })
}

fn join_text_parts(parts: &[Value]) -> Option<String> {
    let chunks: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    }
}

fn usage_pair(json: &Value, root: &str, input: &str, output: &str) -> Option<TokenUsage> {
    let usage = json.get(root)?;
    Some(TokenUsage {
        input_tokens: usage.get(input)?.as_u64()?,
        output_tokens: usage.get(output)?.as_u64()?,
    })
}

pub(crate) fn extract_openai_text(json: &Value) -> Option<String> {
    if let Some(text) = json.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    let mut chunks = Vec::new();
    let output = json.get("output").and_then(Value::as_array)?;
    for item in output {
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        if let Some(text) = join_text_parts(content) {
            chunks.push(text);
        }
    }

    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    }
}

pub(crate) fn extract_anthropic_text(json: &Value) -> Option<String> {
    let content = json.get("content").and_then(Value::as_array)?;
    join_text_parts(content)
}

pub(crate) fn extract_gemini_text(json: &Value) -> Option<String> {
    let parts = json
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("content"))
        .and_then(|v| v.get("parts"))
        .and_then(Value::as_array)?;
    join_text_parts(parts)
}

pub(crate) fn extract_openai_compatible_text(json: &Value) -> Option<String> {
    let choices = json.get("choices").and_then(Value::as_array)?;
    let first = choices.first()?;
    let content = first.get("message")?.get("content")?;
    match content {
        Value::String(s) => Some(s.to_string()),
        Value::Array(parts) => join_text_parts(parts),
        _ => None,
    }
}

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let payload = serde_json::json!({
            "model": self.model,
            "instructions": request.system,
            "input": request.user,
            "max_output_tokens": request.max_tokens,
            "temperature": request.temperature
        });
        let url = format!("{}/v1/responses", self.base_url.trim_end_matches('/'));
        let json = post_json(
            self.client.post(&url).bearer_auth(&self.api_key).json(&payload),
            self.timeout,
        )
        .await?;
        finish(
            self.label(),
            extract_openai_text(&json),
            usage_pair(&json, "usage", "input_tokens", "output_tokens"),
        )
    }

    fn label(&self) -> &str {
        "openai"
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [
                {
                    "role": "user",
                    "content": request.user
                }
            ]
        });
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let json = post_json(
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload),
            self.timeout,
        )
        .await?;
        finish(
            self.label(),
            extract_anthropic_text(&json),
            usage_pair(&json, "usage", "input_tokens", "output_tokens"),
        )
    }

    fn label(&self) -> &str {
        "anthropic"
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let payload = serde_json::json!({
            "systemInstruction": {
                "parts": [{"text": request.system}]
            },
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": request.user}]
                }
            ],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature
            }
        });
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let json = post_json(
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&payload),
            self.timeout,
        )
        .await?;
        finish(
            self.label(),
            extract_gemini_text(&json),
            usage_pair(
                &json,
                "usageMetadata",
                "promptTokenCount",
                "candidatesTokenCount",
            ),
        )
    }

    fn label(&self) -> &str {
        "gemini"
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user}
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature
        });
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let json = post_json(
            self.client.post(&url).bearer_auth(&self.api_key).json(&payload),
            self.timeout,
        )
        .await?;
        finish(
            self.label(),
            extract_openai_compatible_text(&json),
            usage_pair(&json, "usage", "prompt_tokens", "completion_tokens"),
        )
    }

    fn label(&self) -> &str {
        "openai-compatible"
    }
}

/// Offline extractive provider: drops repeated sentences and, for summary
/// calls, keeps the leading sentences up to a third of the source words.
#[derive(Debug, Default)]
pub struct LocalProvider;

const LOCAL_MIN_WORDS: usize = 12;
const LOCAL_KEEP_DIVISOR: usize = 3;

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        current.push(ch);
        let boundary = matches!(ch, '.' | '!' | '?')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        if boundary || ch == '\n' {
            let trimmed = current.split_whitespace().collect::<Vec<_>>().join(" ");
            if !trimmed.is_empty() {
                sentences.push(trimmed);
            }
            current.clear();
        }
    }
    let trimmed = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !trimmed.is_empty() {
        sentences.push(trimmed);
    }
    sentences
}

fn sentence_key(sentence: &str) -> String {
    sentence
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn local_condense(source: &str, kind: CallKind, max_tokens: u32) -> String {
    let mut seen = HashSet::new();
    let unique: Vec<String> = split_sentences(source)
        .into_iter()
        .filter(|sentence| seen.insert(sentence_key(sentence)))
        .collect();

    let output_cap = (max_tokens as usize).saturating_mul(3) / 4;
    let target = match kind {
        CallKind::Postprocess => output_cap,
        CallKind::Summary => (word_count(source) / LOCAL_KEEP_DIVISOR)
            .max(LOCAL_MIN_WORDS)
            .min(output_cap.max(1)),
    };

    let mut kept = Vec::new();
    let mut words = 0usize;
    for sentence in unique {
        if words >= target {
            break;
        }
        words += word_count(&sentence);
        kept.push(sentence);
    }
    kept.join(" ")
}

fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(4) as u64
}

#[async_trait]
impl CompletionProvider for LocalProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let text = local_condense(&request.user, request.kind, request.max_tokens);
        let usage = TokenUsage {
            input_tokens: estimate_tokens(&request.system) + estimate_tokens(&request.user),
            output_tokens: estimate_tokens(&text),
        };
        finish(self.label(), Some(text), Some(usage))
    }

    fn label(&self) -> &str {
        "local"
    }
}

fn build_provider(
    spec: &ProviderSpec,
    timeout: Duration,
) -> Result<Arc<dyn CompletionProvider>, CondenseError> {
    if spec.kind == ProviderKind::Local {
        return Ok(Arc::new(LocalProvider));
    }
    let setup_err = |reason: String| CondenseError::ProviderSetup {
        model: spec.model.clone(),
        reason,
    };
    let api_key = spec
        .api_key
        .clone()
        .ok_or_else(|| setup_err("missing api key".to_string()))?;
    let base_url = spec
        .base_url
        .clone()
        .ok_or_else(|| setup_err("missing base url".to_string()))?;
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| setup_err(format!("http client: {err}")))?;
    let model = spec.model.clone();

    let provider: Arc<dyn CompletionProvider> = match spec.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider {
            client,
            api_key,
            model,
            base_url,
            timeout,
        }),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider {
            client,
            api_key,
            model,
            base_url,
            timeout,
        }),
        ProviderKind::Gemini => Arc::new(GeminiProvider {
            client,
            api_key,
            model,
            base_url,
            timeout,
        }),
        ProviderKind::OpenAiCompatible => Arc::new(OpenAiCompatProvider {
            client,
            api_key,
            model,
            base_url,
            timeout,
        }),
        ProviderKind::Local => Arc::new(LocalProvider),
    };
    Ok(provider)
}

/// Lazily builds one provider client per model identifier and caches it.
pub struct ProviderRegistry {
    config: ProviderConfig,
    timeout: Duration,
    cache: Mutex<HashMap<String, Arc<dyn CompletionProvider>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-registers a provider for `model`, bypassing resolution.
    pub async fn insert(&self, model: &str, provider: Arc<dyn CompletionProvider>) {
        self.cache.lock().await.insert(model.to_string(), provider);
    }

    pub async fn provider_for(&self, model: &str) -> Result<Arc<dyn CompletionProvider>, CondenseError> {
        let mut cache = self.cache.lock().await;
        if let Some(provider) = cache.get(model) {
            return Ok(Arc::clone(provider));
        }
        let spec = resolve_provider_spec(model, &self.config)?;
        let provider = build_provider(&spec, self.timeout)?;
        debug!(model, provider = provider.label(), "provider client created");
        cache.insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }
}
