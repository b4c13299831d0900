use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::commands::{CommandReport, Tuning, resolve_config};
use crate::summarize::chunker::Chunker;
use crate::summarize::dispatcher::estimate_call_tokens;
use crate::summarize::paths::resolve_paths;
use crate::summarize::provider::resolve_provider_spec;
use crate::summarize::tokenizer::{BpeTokenizer, Tokenizer};

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub input: PathBuf,
    pub model: String,
    pub tuning: Tuning,
}

pub fn run(opts: PlanOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = resolve_config(&paths, &opts.tuning)?;
    let text = fs::read_to_string(&opts.input)
        .with_context(|| format!("failed to read input {}", opts.input.display()))?;

    let mut report = CommandReport::new("plan");
    let tokenizer = BpeTokenizer::for_model(&opts.model)?;
    report.detail(format!("model={}", opts.model));
    report.detail(format!("tokenizer={}", tokenizer.name()));
    match resolve_provider_spec(&opts.model, &cfg.provider) {
        Ok(spec) => report.detail(format!("provider={}", spec.kind.label())),
        Err(err) => report.issue(err.to_string()),
    }

    let total = tokenizer.count_tokens(&text);
    report.detail(format!("tokens={total}"));
    report.detail(format!(
        "chunk_tokens={} overlap={}",
        cfg.chunking.max_tokens_per_chunk, cfg.chunking.overlap_fraction
    ));

    let chunks = Chunker::new(
        &tokenizer,
        cfg.chunking.max_tokens_per_chunk,
        cfg.chunking.overlap_fraction,
    )
    .split(&text);
    if chunks.is_empty() {
        report.issue("input is empty; nothing to summarize");
        return Ok(report);
    }

    let group_size = cfg.dispatch.max_concurrent_chunks;
    let groups = chunks.len().div_ceil(group_size);
    report.detail(format!("chunks={}", chunks.len()));
    report.detail(format!("groups={groups} (up to {group_size} chunk(s) each)"));

    let overhead = cfg.dispatch.per_call_overhead_tokens;
    let usable = cfg.rate_limit.tokens_per_minute as f64 * (1.0 - cfg.rate_limit.safety_ratio);
    for chunk in &chunks {
        report.detail(format!("chunk[{}] tokens={}", chunk.index, chunk.token_count));
    }
    for (group_no, group) in chunks.chunks(group_size).enumerate() {
        let estimate: u64 = group
            .iter()
            .map(|chunk| estimate_call_tokens(&chunk.text, overhead))
            .sum();
        report.detail(format!(
            "group[{group_no}] chunks={}..={} est_tokens={estimate}",
            group[0].index,
            group[group.len() - 1].index
        ));
        if estimate as f64 > usable {
            report.detail(format!(
                "group[{group_no}] exceeds the usable per-minute budget ({usable:.0}); it will wait for a full bucket"
            ));
        }
    }
    Ok(report)
}
