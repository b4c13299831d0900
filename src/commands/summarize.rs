use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands::{CommandReport, Tuning, resolve_config};
use crate::summarize::job::{JobRequest, Pipeline};
use crate::summarize::paths::resolve_paths;
use crate::summarize::prompts::{SummaryLevel, default_summary_prompt};

#[derive(Debug, Clone)]
pub struct SummarizeOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub model: String,
    pub provider: Option<String>,
    pub prompt_file: Option<PathBuf>,
    pub level: SummaryLevel,
    pub no_postprocess: bool,
    pub tuning: Tuning,
}

async fn cancel_on_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received Ctrl+C, cancelling job");
            cancel.cancel();
        }
        Err(err) => warn!(error = %err, "failed to install Ctrl+C handler"),
    }
}

async fn load_prompt(opts: &SummarizeOptions) -> Result<String> {
    match &opts.prompt_file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read prompt file {}", path.display())),
        None => Ok(default_summary_prompt(opts.level)),
    }
}

pub async fn run(opts: SummarizeOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut cfg = resolve_config(&paths, &opts.tuning)?;
    if let Some(provider) = &opts.provider {
        cfg.provider.name = Some(provider.clone());
    }
    if opts.no_postprocess {
        cfg.postprocess.enabled = false;
    }

    let text = tokio::fs::read_to_string(&opts.input)
        .await
        .with_context(|| format!("failed to read input {}", opts.input.display()))?;
    let prompt = load_prompt(&opts).await?;

    let pipeline = Pipeline::new(cfg).with_audit(paths);
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));
    let outcome = pipeline
        .run(
            JobRequest {
                text,
                model: opts.model.clone(),
                prompt,
                summary_path: opts.output.clone(),
            },
            &cancel,
        )
        .await;
    watcher.abort();

    let mut report = CommandReport::new("summarize");
    report.detail(format!("model={}", opts.model));
    report.detail(format!("state={}", outcome.state.label()));
    report.detail(format!("summary_path={}", opts.output.display()));
    report.detail(format!("chunks={}", outcome.chunks));
    report.detail(format!("failed_chunks={}", outcome.failed_chunks));
    report.detail(format!(
        "groups={}/{}",
        outcome.groups_completed, outcome.groups_total
    ));
    report.detail(format!("input_tokens={}", outcome.usage.input_tokens()));
    report.detail(format!("output_tokens={}", outcome.usage.output_tokens()));
    report.detail(format!("checkpoint_kept={}", outcome.checkpoint_kept));
    if outcome.success {
        report.detail(outcome.message);
    } else {
        report.issue(outcome.message);
    }
    Ok(report)
}
