pub mod checkpoint;
pub mod config_show;
pub mod plan;
pub mod summarize;

use anyhow::Result;
use serde::Serialize;

use crate::summarize::config::{PipelineConfig, load_config, validate};
use crate::summarize::paths::CondensePaths;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            body: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn body(&mut self, text: impl Into<String>) {
        self.body = Some(text.into());
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("command={}\nok={}\n", self.command, self.ok);
        for detail in &self.details {
            out.push_str(detail);
            out.push('\n');
        }
        for issue in &self.issues {
            out.push_str("issue: ");
            out.push_str(issue);
            out.push('\n');
        }
        if let Some(body) = &self.body {
            out.push('\n');
            out.push_str(body.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Per-invocation overrides layered over the loaded configuration.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Tuning {
    /// Maximum tokens per chunk
    #[arg(long = "chunk-tokens")]
    pub chunk_tokens: Option<usize>,
    /// Fraction of each chunk shared with the previous one (0 <= f < 1)
    #[arg(long)]
    pub overlap: Option<f64>,
    /// Provider token budget per minute
    #[arg(long = "tokens-per-minute")]
    pub tokens_per_minute: Option<u64>,
    /// Chunks dispatched per group
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Tokens of prior summary passed as context to each group
    #[arg(long = "context-tokens")]
    pub context_tokens: Option<usize>,
}

impl Tuning {
    pub fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(v) = self.chunk_tokens {
            cfg.chunking.max_tokens_per_chunk = v;
        }
        if let Some(v) = self.overlap {
            cfg.chunking.overlap_fraction = v;
        }
        if let Some(v) = self.tokens_per_minute {
            cfg.rate_limit.tokens_per_minute = v;
        }
        if let Some(v) = self.concurrency {
            cfg.dispatch.max_concurrent_chunks = v;
        }
        if let Some(v) = self.context_tokens {
            cfg.dispatch.context_token_limit = v;
        }
    }
}

/// Config file and environment, then `tuning`, validated once more.
pub fn resolve_config(paths: &CondensePaths, tuning: &Tuning) -> Result<PipelineConfig> {
    let mut cfg = load_config(&paths.config_file)?;
    tuning.apply(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}
