use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens_per_chunk: usize,
    pub overlap_fraction: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: 2000,
            overlap_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_minute: u64,
    pub safety_ratio: f64,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: 200_000,
            safety_ratio: 0.10,
            poll_interval_secs: 5,
            max_wait_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_concurrent_chunks: usize,
    pub max_concurrent_requests: usize,
    pub context_token_limit: usize,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    pub min_summary_words: usize,
    pub per_call_overhead_tokens: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 8,
            max_concurrent_requests: 64,
            context_token_limit: 100,
            max_output_tokens: 4096,
            temperature: 0.2,
            request_timeout_secs: 300,
            min_summary_words: 10,
            per_call_overhead_tokens: 500,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base: u64,
    pub factor_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base: 2,
            factor_ms: 1000,
            min_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessConfig {
    pub enabled: bool,
    pub min_tokens: usize,
    pub token_factor: f64,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_tokens: 2000,
            token_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub rate_limit: RateLimitConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub postprocess: PostprocessConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPipelineConfig {
    chunking: Option<ChunkingConfig>,
    rate_limit: Option<RateLimitConfig>,
    dispatch: Option<DispatchConfig>,
    retry: Option<RetryConfig>,
    postprocess: Option<PostprocessConfig>,
    provider: Option<ProviderConfig>,
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_f32(var: &str, fallback: f32) -> f32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_option(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

pub fn validate(cfg: &PipelineConfig) -> Result<()> {
    if cfg.chunking.max_tokens_per_chunk == 0 {
        return Err(anyhow!("invalid max tokens per chunk: must be >= 1"));
    }
    let overlap = cfg.chunking.overlap_fraction;
    if !(0.0..1.0).contains(&overlap) {
        return Err(anyhow!("invalid overlap fraction: require 0 <= overlap < 1"));
    }
    if cfg.rate_limit.tokens_per_minute == 0 {
        return Err(anyhow!("invalid tokens per minute: must be >= 1"));
    }
    if !(0.0..1.0).contains(&cfg.rate_limit.safety_ratio) {
        return Err(anyhow!("invalid safety ratio: require 0 <= ratio < 1"));
    }
    if cfg.rate_limit.poll_interval_secs == 0 {
        return Err(anyhow!("invalid budget poll interval: must be >= 1 second"));
    }
    if cfg.dispatch.max_concurrent_chunks == 0 {
        return Err(anyhow!("invalid max concurrent chunks: must be >= 1"));
    }
    if cfg.dispatch.max_concurrent_requests == 0 {
        return Err(anyhow!("invalid max concurrent requests: must be >= 1"));
    }
    if !(0.0..=2.0).contains(&cfg.dispatch.temperature) {
        return Err(anyhow!("invalid temperature: require 0 <= temperature <= 2"));
    }
    if cfg.dispatch.max_output_tokens == 0 {
        return Err(anyhow!("invalid max output tokens: must be >= 1"));
    }
    if cfg.dispatch.request_timeout_secs == 0 {
        return Err(anyhow!("invalid request timeout: must be >= 1 second"));
    }
    if cfg.retry.max_attempts == 0 {
        return Err(anyhow!("invalid retry max attempts: must be >= 1"));
    }
    if cfg.retry.base < 2 {
        return Err(anyhow!("invalid retry base: must be >= 2"));
    }
    if cfg.retry.min_delay_ms > cfg.retry.max_delay_ms {
        return Err(anyhow!("invalid retry delays: require min <= max"));
    }
    if cfg.postprocess.token_factor <= 0.0 {
        return Err(anyhow!("invalid postprocess token factor: must be > 0"));
    }
    Ok(())
}

fn merge_file_config(base: &mut PipelineConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialPipelineConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse condense config {}: {err}", path.display()))?;
    if let Some(chunking) = parsed.chunking {
        base.chunking = chunking;
    }
    if let Some(rate_limit) = parsed.rate_limit {
        base.rate_limit = rate_limit;
    }
    if let Some(dispatch) = parsed.dispatch {
        base.dispatch = dispatch;
    }
    if let Some(retry) = parsed.retry {
        base.retry = retry;
    }
    if let Some(postprocess) = parsed.postprocess {
        base.postprocess = postprocess;
    }
    if let Some(provider) = parsed.provider {
        base.provider = provider;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut PipelineConfig) {
    cfg.chunking.max_tokens_per_chunk = env_or_usize(
        "CONDENSE_MAX_TOKENS_PER_CHUNK",
        cfg.chunking.max_tokens_per_chunk,
    );
    cfg.chunking.overlap_fraction =
        env_or_f64("CONDENSE_OVERLAP_FRACTION", cfg.chunking.overlap_fraction);
    cfg.rate_limit.tokens_per_minute = env_or_u64(
        "CONDENSE_TOKENS_PER_MINUTE",
        cfg.rate_limit.tokens_per_minute,
    );
    cfg.rate_limit.max_wait_secs =
        env_or_u64("CONDENSE_MAX_BUDGET_WAIT_SECS", cfg.rate_limit.max_wait_secs);
    cfg.dispatch.max_concurrent_chunks = env_or_usize(
        "CONDENSE_MAX_CONCURRENT_CHUNKS",
        cfg.dispatch.max_concurrent_chunks,
    );
    cfg.dispatch.max_concurrent_requests = env_or_usize(
        "CONDENSE_MAX_CONCURRENT_REQUESTS",
        cfg.dispatch.max_concurrent_requests,
    );
    cfg.dispatch.context_token_limit = env_or_usize(
        "CONDENSE_CONTEXT_TOKEN_LIMIT",
        cfg.dispatch.context_token_limit,
    );
    cfg.dispatch.max_output_tokens = env_or_u64(
        "CONDENSE_MAX_OUTPUT_TOKENS",
        u64::from(cfg.dispatch.max_output_tokens),
    )
    .min(u64::from(u32::MAX)) as u32;
    cfg.dispatch.temperature = env_or_f32("CONDENSE_TEMPERATURE", cfg.dispatch.temperature);
    cfg.dispatch.request_timeout_secs = env_or_u64(
        "CONDENSE_REQUEST_TIMEOUT_SECS",
        cfg.dispatch.request_timeout_secs,
    );
    cfg.retry.max_attempts = env_or_usize("CONDENSE_RETRY_MAX_ATTEMPTS", cfg.retry.max_attempts);
    cfg.postprocess.enabled = env_or_bool("CONDENSE_POSTPROCESS", cfg.postprocess.enabled);
    cfg.postprocess.min_tokens = env_or_usize(
        "CONDENSE_POSTPROCESS_MIN_TOKENS",
        cfg.postprocess.min_tokens,
    );
    cfg.provider.name = env_or_option("CONDENSE_PROVIDER", cfg.provider.name.take());
    cfg.provider.base_url = env_or_option("CONDENSE_BASE_URL", cfg.provider.base_url.take());
}

/// Defaults, then the TOML file at `path` (when present), then environment
/// overrides. Validation runs last so callers applying CLI flags should call
/// [`validate`] again afterwards.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let mut cfg = PipelineConfig::default();
    merge_file_config(&mut cfg, path)?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}
