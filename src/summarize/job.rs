use crate::error::CondenseError;
use crate::summarize::audit;
use crate::summarize::checkpoint::CheckpointStore;
use crate::summarize::chunker::Chunker;
use crate::summarize::config::{self, PipelineConfig};
use crate::summarize::dispatcher::{ChunkDispatcher, DispatchOutcome, DispatchStatus};
use crate::summarize::paths::CondensePaths;
use crate::summarize::postprocess::{CleanStatus, Cleaned, Postprocessor};
use crate::summarize::provider::ProviderRegistry;
use crate::summarize::rate_limit::RateLimiter;
use crate::summarize::tokenizer::{BpeTokenizer, Tokenizer};
use crate::summarize::usage::{CallKind, UsageLedger, UsageReport, UsageSink};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CANCELLED_PREFIX: &str = "Partial summary due to cancellation:";
pub const ERROR_PREFIX: &str = "Partial summary due to error:";
const NO_SUMMARY: &str = "No summary produced.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Chunking,
    Summarizing,
    Postprocessing,
    Complete,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn label(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Chunking => "CHUNKING",
            JobState::Summarizing => "SUMMARIZING",
            JobState::Postprocessing => "POSTPROCESSING",
            JobState::Complete => "COMPLETE",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub text: String,
    pub model: String,
    pub prompt: String,
    pub summary_path: PathBuf,
}

/// What a job hands back to its caller. Job-level problems land here instead
/// of being returned as errors.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub success: bool,
    pub summary: String,
    pub message: String,
    pub state: JobState,
    pub usage: UsageReport,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub groups_completed: usize,
    pub groups_total: usize,
    pub checkpoint_kept: bool,
}

impl JobOutcome {
    fn rejected(err: &CondenseError) -> Self {
        Self {
            success: false,
            summary: String::new(),
            message: err.to_string(),
            state: JobState::Failed,
            usage: UsageReport::default(),
            chunks: 0,
            failed_chunks: 0,
            groups_completed: 0,
            groups_total: 0,
            checkpoint_kept: false,
        }
    }
}

#[async_trait]
pub trait SummaryWriter: Send + Sync {
    async fn write(&self, path: &Path, text: &str) -> Result<(), CondenseError>;
}

#[derive(Debug, Default)]
pub struct FsSummaryWriter;

#[async_trait]
impl SummaryWriter for FsSummaryWriter {
    async fn write(&self, path: &Path, text: &str) -> Result<(), CondenseError> {
        let to_err = |err: std::io::Error| CondenseError::SummaryWrite {
            path: path.display().to_string(),
            reason: err.to_string(),
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
        }
        tokio::fs::write(path, text).await.map_err(to_err)
    }
}

/// Process-wide pieces shared by every job: the token bucket, the provider
/// call semaphore and the provider client cache.
pub struct Pipeline {
    config: PipelineConfig,
    limiter: Arc<RateLimiter>,
    semaphore: Arc<Semaphore>,
    registry: Arc<ProviderRegistry>,
    writer: Arc<dyn SummaryWriter>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    audit_paths: Option<CondensePaths>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let semaphore = Arc::new(Semaphore::new(config.dispatch.max_concurrent_requests));
        let registry = Arc::new(ProviderRegistry::new(
            config.provider.clone(),
            config.dispatch.request_timeout(),
        ));
        Self {
            config,
            limiter,
            semaphore,
            registry,
            writer: Arc::new(FsSummaryWriter),
            usage_sink: None,
            tokenizer: None,
            audit_paths: None,
        }
    }

    pub fn with_writer(mut self, writer: Arc<dyn SummaryWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    /// Uses `tokenizer` for every job instead of resolving one per model.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_audit(mut self, paths: CondensePaths) -> Self {
        self.audit_paths = Some(paths);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn resolve_tokenizer(&self, model: &str) -> Result<Arc<dyn Tokenizer>, CondenseError> {
        if let Some(tokenizer) = &self.tokenizer {
            return Ok(Arc::clone(tokenizer));
        }
        Ok(Arc::new(BpeTokenizer::for_model(model)?))
    }

    async fn audit(&self, phase: &'static str, status: &'static str, message: String) {
        let Some(paths) = self.audit_paths.clone() else {
            return;
        };
        let joined =
            tokio::task::spawn_blocking(move || audit::append_event(&paths, phase, status, &message)).await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "audit append failed"),
            Err(err) => warn!(error = %err, "audit task failed"),
        }
    }

    fn validate(&self, request: &JobRequest) -> Result<(), CondenseError> {
        config::validate(&self.config)
            .map_err(|err| CondenseError::InvalidConfig(format!("{err:#}")))?;
        if request.text.trim().is_empty() {
            return Err(CondenseError::Validation("source text is empty".to_string()));
        }
        if request.summary_path.as_os_str().is_empty() {
            return Err(CondenseError::Validation("summary path is empty".to_string()));
        }
        if request.summary_path.is_dir() {
            return Err(CondenseError::Validation(format!(
                "summary path {} is a directory",
                request.summary_path.display()
            )));
        }
        if request.prompt.trim().is_empty() {
            return Err(CondenseError::Validation("prompt is empty".to_string()));
        }
        Ok(())
    }

    pub async fn run(&self, request: JobRequest, cancel: &CancellationToken) -> JobOutcome {
        debug!(state = JobState::Pending.label(), model = %request.model, "job received");
        let prepared = self.validate(&request).and_then(|()| self.resolve_tokenizer(&request.model));
        let tokenizer = match prepared {
            Ok(tokenizer) => tokenizer,
            Err(err) => return self.reject(err).await,
        };
        let provider = match self.registry.provider_for(&request.model).await {
            Ok(provider) => provider,
            Err(err) => return self.reject(err).await,
        };

        info!(state = JobState::Chunking.label(), tokenizer = tokenizer.name(), "chunking source text");
        let chunks = Chunker::new(
            tokenizer.as_ref(),
            self.config.chunking.max_tokens_per_chunk,
            self.config.chunking.overlap_fraction,
        )
        .split(&request.text);
        let chunk_count = chunks.len();
        self.audit(
            "job",
            "start",
            format!(
                "model={} provider={} chunks={chunk_count} path={}",
                request.model,
                provider.label(),
                request.summary_path.display()
            ),
        )
        .await;

        info!(state = JobState::Summarizing.label(), chunks = chunk_count, "summarizing");
        let ledger = Arc::new(UsageLedger::new());
        let dispatcher = ChunkDispatcher::new(
            provider,
            Arc::clone(&tokenizer),
            Arc::clone(&self.limiter),
            Arc::clone(&self.semaphore),
            Arc::clone(&ledger),
            &self.config,
        );
        let checkpoint = CheckpointStore::for_summary(&request.summary_path);
        match checkpoint.clear().await {
            Ok(true) => info!(path = %checkpoint.partial_path().display(), "removed stale checkpoint"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "stale checkpoint could not be removed"),
        }
        let dispatched = dispatcher
            .run(
                chunks,
                &request.prompt,
                CallKind::Summary,
                Some(&checkpoint),
                cancel,
            )
            .await;

        let mut outcome = match dispatched.status {
            DispatchStatus::Complete => {
                info!(state = JobState::Postprocessing.label(), "postprocessing");
                let postprocessor = Postprocessor::new(
                    dispatcher.clone(),
                    self.config.chunking.clone(),
                    self.config.postprocess.clone(),
                );
                let cleaned = postprocessor.clean(&dispatched.summary, cancel).await;
                if cleaned.status == CleanStatus::Cancelled {
                    // every group finished, so one uncancellable pass still runs
                    info!("cancelled during postprocessing, running a best-effort pass");
                    let cleaned = postprocessor
                        .clean(&dispatched.summary, &CancellationToken::new())
                        .await;
                    self.finish_cancelled_with_summary(&request, &dispatched, cleaned, &ledger)
                        .await
                } else {
                    let note = match &cleaned.status {
                        CleanStatus::Applied => "postprocess applied".to_string(),
                        CleanStatus::Skipped(why) => format!("postprocess skipped ({why})"),
                        CleanStatus::Fallback(why) => format!("postprocess fallback ({why})"),
                        CleanStatus::Cancelled => String::new(),
                    };
                    self.finish_complete(&request, &dispatched, cleaned.text, note, &checkpoint, &ledger)
                        .await
                }
            }
            DispatchStatus::Cancelled => {
                self.finish_degraded(&request, &dispatched, JobState::Cancelled, None, &checkpoint, &ledger)
                    .await
            }
            DispatchStatus::Failed(ref err) => {
                error!(error = %err, "summarization failed");
                self.finish_degraded(
                    &request,
                    &dispatched,
                    JobState::Failed,
                    Some(err.to_string()),
                    &checkpoint,
                    &ledger,
                )
                .await
            }
        };

        outcome.chunks = chunk_count;
        self.report_usage(&request.model, &outcome).await;
        outcome
    }

    async fn reject(&self, err: CondenseError) -> JobOutcome {
        warn!(error = %err, fail_fast = err.is_fail_fast(), "job rejected before chunking");
        self.audit("job", "rejected", err.to_string()).await;
        JobOutcome::rejected(&err)
    }

    fn base_outcome(dispatched: &DispatchOutcome, ledger: &UsageLedger) -> JobOutcome {
        JobOutcome {
            success: false,
            summary: String::new(),
            message: String::new(),
            state: JobState::Failed,
            usage: ledger.report(),
            chunks: 0,
            failed_chunks: dispatched.failed_chunks(),
            groups_completed: dispatched.groups_completed,
            groups_total: dispatched.groups_total,
            checkpoint_kept: true,
        }
    }

    async fn finish_complete(
        &self,
        request: &JobRequest,
        dispatched: &DispatchOutcome,
        summary: String,
        note: String,
        checkpoint: &CheckpointStore,
        ledger: &UsageLedger,
    ) -> JobOutcome {
        let mut outcome = Self::base_outcome(dispatched, ledger);
        if let Err(err) = self.writer.write(&request.summary_path, &summary).await {
            error!(error = %err, "final summary write failed; checkpoint kept");
            outcome.summary = summary;
            outcome.message = err.to_string();
            outcome.state = JobState::Failed;
            return outcome;
        }
        match checkpoint.clear().await {
            Ok(_) => outcome.checkpoint_kept = false,
            Err(err) => warn!(error = %err, "checkpoint cleanup failed"),
        }
        outcome.success = true;
        outcome.state = JobState::Complete;
        outcome.message = format!(
            "summary complete: {} chunk(s), {} failed, {note}",
            dispatched.results.len(),
            outcome.failed_chunks
        );
        outcome.summary = summary;
        info!(
            state = JobState::Complete.label(),
            tokens = outcome.usage.total_tokens(),
            "job complete"
        );
        self.audit("job", "complete", outcome.message.clone()).await;
        outcome
    }

    async fn finish_cancelled_with_summary(
        &self,
        request: &JobRequest,
        dispatched: &DispatchOutcome,
        cleaned: Cleaned,
        ledger: &UsageLedger,
    ) -> JobOutcome {
        let mut outcome = Self::base_outcome(dispatched, ledger);
        outcome.state = JobState::Cancelled;
        outcome.summary = format!("{CANCELLED_PREFIX}\n{}", cleaned.text);
        outcome.message = match cleaned.status {
            CleanStatus::Applied => "cancelled during postprocessing; best-effort pass applied".to_string(),
            CleanStatus::Skipped(why) => {
                format!("cancelled during postprocessing; best-effort pass skipped ({why})")
            }
            CleanStatus::Fallback(why) => {
                format!("cancelled during postprocessing; returning the summary without postprocessing ({why})")
            }
            CleanStatus::Cancelled => {
                "cancelled during postprocessing; returning the summary without postprocessing".to_string()
            }
        };
        self.write_degraded(request, &mut outcome).await;
        outcome
    }

    async fn finish_degraded(
        &self,
        request: &JobRequest,
        dispatched: &DispatchOutcome,
        state: JobState,
        error: Option<String>,
        checkpoint: &CheckpointStore,
        ledger: &UsageLedger,
    ) -> JobOutcome {
        let mut outcome = Self::base_outcome(dispatched, ledger);
        outcome.state = state;
        let prefix = if state == JobState::Cancelled {
            CANCELLED_PREFIX
        } else {
            ERROR_PREFIX
        };
        let cause = error.unwrap_or_else(|| "processing cancelled".to_string());

        if dispatched.groups_completed == 0 {
            outcome.summary = format!("{NO_SUMMARY} {cause} before any group completed.");
            outcome.message = format!("{cause}; no summary produced");
            outcome.checkpoint_kept = false;
        } else {
            let assembled = &dispatched.summary;
            match checkpoint.load().await {
                Ok(Some(saved)) if saved == *assembled => {}
                other => {
                    if let Err(err) = other {
                        warn!(error = %err, "checkpoint unreadable");
                    }
                    warn!("checkpoint does not match completed groups, rewriting it");
                    if let Err(err) = checkpoint.save(assembled).await {
                        warn!(error = %err, "checkpoint rewrite failed");
                        outcome.checkpoint_kept = false;
                    }
                }
            }
            outcome.summary = format!("{prefix}\n{assembled}");
            outcome.message = format!(
                "{cause}; partial summary of {} of {} group(s)",
                dispatched.groups_completed, dispatched.groups_total
            );
            self.write_degraded(request, &mut outcome).await;
        }
        info!(state = state.label(), message = %outcome.message, "job ended early");
        self.audit("job", "degraded", outcome.message.clone()).await;
        outcome
    }

    async fn write_degraded(&self, request: &JobRequest, outcome: &mut JobOutcome) {
        if let Err(err) = self.writer.write(&request.summary_path, &outcome.summary).await {
            warn!(error = %err, "degraded summary write failed");
            outcome.message = format!("{}; {err}", outcome.message);
        }
    }

    async fn report_usage(&self, model: &str, outcome: &JobOutcome) {
        let usage = &outcome.usage;
        self.audit(
            "usage",
            "ok",
            format!(
                "model={model} summary_in={} summary_out={} postprocess_in={} postprocess_out={}",
                usage.summary.input_tokens,
                usage.summary.output_tokens,
                usage.postprocess.input_tokens,
                usage.postprocess.output_tokens
            ),
        )
        .await;
        if let Some(sink) = &self.usage_sink
            && let Err(err) = sink.record(model, usage)
        {
            warn!(error = %err, "usage sink rejected report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CANCELLED_PREFIX, ERROR_PREFIX, JobRequest, JobState, Pipeline};
    use crate::error::ProviderError;
    use crate::summarize::checkpoint::CheckpointStore;
    use crate::summarize::config::PipelineConfig;
    use crate::summarize::paths::CondensePaths;
    use crate::summarize::provider::CompletionProvider;
    use crate::summarize::testing::{CharTokenizer, ScriptedProvider, test_config};
    use crate::summarize::usage::{CallKind, UsageReport, UsageSink};
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    const MODEL: &str = "scripted-model";

    async fn pipeline(cfg: PipelineConfig, provider: Arc<ScriptedProvider>) -> Pipeline {
        let pipeline = Pipeline::new(cfg).with_tokenizer(Arc::new(CharTokenizer));
        let provider: Arc<dyn CompletionProvider> = provider;
        pipeline.registry().insert(MODEL, provider).await;
        pipeline
    }

    fn request(text: &str, path: &Path) -> JobRequest {
        JobRequest {
            text: text.to_string(),
            model: MODEL.to_string(),
            prompt: "Summarize.".to_string(),
            summary_path: path.to_path_buf(),
        }
    }

    fn text_of(len: usize) -> String {
        (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect()
    }

    #[tokio::test]
    async fn empty_text_fails_fast() {
        let tmp = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::echo());
        let p = pipeline(test_config(), Arc::clone(&provider)).await;
        let outcome = p
            .run(request("   ", &tmp.path().join("out.txt")), &CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.message.contains("source text is empty"));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = test_config();
        cfg.chunking.overlap_fraction = 1.5;
        let provider = Arc::new(ScriptedProvider::echo());
        let p = pipeline(cfg, Arc::clone(&provider)).await;
        let outcome = p
            .run(request("some text", &tmp.path().join("out.txt")), &CancellationToken::new())
            .await;
        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.message.starts_with("config invalid"));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn worked_example_completes_and_clears_checkpoint() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let provider = Arc::new(ScriptedProvider::new(|req| Ok(format!("len={}", req.user.len()))));
        let p = pipeline(test_config(), Arc::clone(&provider)).await;
        let outcome = p
            .run(request(&text_of(1000), &out), &CancellationToken::new())
            .await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.state, JobState::Complete);
        assert_eq!(outcome.chunks, 5);
        assert_eq!(outcome.groups_total, 1);
        assert_eq!(provider.calls(), 5);
        assert_eq!(fs::read_to_string(&out).expect("summary"), outcome.summary);
        let store = CheckpointStore::for_summary(&out);
        assert!(!store.partial_path().exists());
        assert!(!store.backup_path().exists());
        assert!(!outcome.checkpoint_kept);
        assert_eq!(outcome.usage.summary.calls, 5);
    }

    #[tokio::test]
    async fn single_failed_chunk_still_completes() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let provider = Arc::new(ScriptedProvider::new(|req| {
            if req.user.len() == 60 {
                Err(ProviderError::RateLimited("busy".to_string()))
            } else {
                Ok("chunk summary".to_string())
            }
        }));
        let p = pipeline(test_config(), Arc::clone(&provider)).await;
        let outcome = p
            .run(request(&text_of(1000), &out), &CancellationToken::new())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.state, JobState::Complete);
        assert_eq!(outcome.failed_chunks, 1);
        assert_eq!(outcome.summary.lines().count(), 5);
    }

    #[tokio::test]
    async fn cancellation_returns_checkpointed_groups() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let mut cfg = test_config();
        cfg.chunking.max_tokens_per_chunk = 100;
        cfg.chunking.overlap_fraction = 0.0;
        cfg.dispatch.max_concurrent_chunks = 2;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(Mutex::new(0usize));
        let seen = Arc::clone(&calls);
        let provider = Arc::new(
            ScriptedProvider::new(move |_| {
                let mut n = seen.lock();
                *n += 1;
                // fifth call belongs to the third group
                if *n == 5 {
                    trigger.cancel();
                }
                Ok(format!("part{n}"))
            })
            .with_delay(|_| Duration::from_millis(2)),
        );
        let p = pipeline(cfg, Arc::clone(&provider)).await;
        let outcome = p.run(request(&text_of(800), &out), &cancel).await;

        assert!(!outcome.success);
        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.groups_completed, 2);
        assert!(outcome.checkpoint_kept);
        let saved = fs::read_to_string(CheckpointStore::for_summary(&out).partial_path())
            .expect("checkpoint kept");
        assert_eq!(saved.lines().count(), 4);
        assert_eq!(outcome.summary, format!("{CANCELLED_PREFIX}\n{saved}"));
        assert_eq!(fs::read_to_string(&out).expect("degraded summary"), outcome.summary);
    }

    #[tokio::test]
    async fn stale_checkpoint_from_an_earlier_job_is_not_returned() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let store = CheckpointStore::for_summary(&out);
        store.save("STALE TEXT FROM AN EARLIER JOB").await.expect("seed checkpoint");

        let provider = Arc::new(ScriptedProvider::echo());
        let p = pipeline(test_config(), Arc::clone(&provider)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = p.run(request(&text_of(50), &out), &cancel).await;

        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.groups_completed, 0);
        assert!(!outcome.summary.contains("STALE"));
        assert!(outcome.summary.starts_with("No summary produced."));
        assert!(!store.partial_path().exists());
        assert!(!store.backup_path().exists());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn stale_checkpoint_is_replaced_by_completed_groups() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let store = CheckpointStore::for_summary(&out);
        store.save("STALE TEXT FROM AN EARLIER JOB").await.expect("seed checkpoint");

        let mut cfg = test_config();
        cfg.chunking.max_tokens_per_chunk = 100;
        cfg.chunking.overlap_fraction = 0.0;
        cfg.dispatch.max_concurrent_chunks = 1;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let provider = Arc::new(ScriptedProvider::new(move |_| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                trigger.cancel();
            }
            Ok(format!("part{n}"))
        }));
        let p = pipeline(cfg, Arc::clone(&provider)).await;
        let outcome = p.run(request(&text_of(300), &out), &cancel).await;

        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.groups_completed, 1);
        assert_eq!(outcome.summary, format!("{CANCELLED_PREFIX}\npart1"));
        assert_eq!(fs::read_to_string(store.partial_path()).expect("checkpoint"), "part1");
        assert_eq!(fs::read_to_string(store.backup_path()).expect("backup"), "part1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_checkpoint_write_still_returns_completed_groups() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let store = CheckpointStore::for_summary(&out);
        // a directory at the checkpoint path makes every save fail
        fs::create_dir_all(store.partial_path()).expect("block partial");
        fs::write(store.backup_path(), "STALE TEXT FROM AN EARLIER JOB").expect("stale backup");

        let mut cfg = test_config();
        cfg.chunking.max_tokens_per_chunk = 100;
        cfg.chunking.overlap_fraction = 0.0;
        cfg.dispatch.max_concurrent_chunks = 1;
        cfg.dispatch.per_call_overhead_tokens = 0;
        cfg.rate_limit.tokens_per_minute = 2_000;
        cfg.rate_limit.max_wait_secs = 10;
        let provider = Arc::new(ScriptedProvider::new(|_| Ok("x".repeat(2_000))));
        let p = pipeline(cfg, Arc::clone(&provider)).await;
        let outcome = p
            .run(request(&text_of(300), &out), &CancellationToken::new())
            .await;

        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.groups_completed, 1);
        assert_eq!(outcome.summary, format!("{ERROR_PREFIX}\n{}", "x".repeat(2_000)));
        assert!(!outcome.checkpoint_kept);
        assert_eq!(fs::read_to_string(&out).expect("degraded summary"), outcome.summary);
    }

    #[tokio::test]
    async fn cancellation_during_postprocessing_still_runs_one_pass() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let mut cfg = test_config();
        cfg.postprocess.enabled = true;
        cfg.postprocess.min_tokens = 1;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let passes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&passes);
        let provider = Arc::new(ScriptedProvider::new(move |req| match req.kind {
            CallKind::Summary => Ok("alpha beta gamma delta".to_string()),
            CallKind::Postprocess => {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    trigger.cancel();
                }
                Ok("alpha beta gamma".to_string())
            }
        }));
        let p = pipeline(cfg, Arc::clone(&provider)).await;
        let outcome = p.run(request(&text_of(100), &out), &cancel).await;

        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(!outcome.success);
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.summary, format!("{CANCELLED_PREFIX}\nalpha beta gamma"));
        assert!(outcome.message.contains("best-effort pass applied"));
        assert_eq!(fs::read_to_string(&out).expect("degraded summary"), outcome.summary);
    }

    #[tokio::test]
    async fn cancellation_before_any_group_reports_no_summary() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let provider = Arc::new(ScriptedProvider::echo());
        let p = pipeline(test_config(), Arc::clone(&provider)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = p.run(request(&text_of(50), &out), &cancel).await;
        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(outcome.summary.starts_with("No summary produced."));
        assert!(!out.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_timeout_fails_and_preserves_checkpoint() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let mut cfg = test_config();
        cfg.chunking.max_tokens_per_chunk = 100;
        cfg.chunking.overlap_fraction = 0.0;
        cfg.dispatch.max_concurrent_chunks = 1;
        cfg.dispatch.per_call_overhead_tokens = 0;
        cfg.rate_limit.tokens_per_minute = 2_000;
        cfg.rate_limit.max_wait_secs = 10;
        // each call burns the whole bucket
        let provider = Arc::new(ScriptedProvider::new(|_| Ok("x".repeat(2_000))));
        let p = pipeline(cfg, Arc::clone(&provider)).await;
        let outcome = p
            .run(request(&text_of(300), &out), &CancellationToken::new())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.groups_completed, 1);
        assert!(outcome.summary.starts_with(ERROR_PREFIX));
        assert!(outcome.message.contains("token budget wait exceeded"));
        assert!(CheckpointStore::for_summary(&out).partial_path().exists());
    }

    struct RecordingSink(Mutex<Vec<(String, UsageReport)>>);

    impl UsageSink for RecordingSink {
        fn record(&self, model: &str, report: &UsageReport) -> anyhow::Result<()> {
            self.0.lock().push((model.to_string(), report.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn usage_is_reported_to_sink_and_audit_log() {
        let tmp = tempdir().expect("tempdir");
        let out = tmp.path().join("out.txt");
        let paths = CondensePaths {
            condense_home: tmp.path().to_path_buf(),
            logs_dir: tmp.path().join("logs"),
            config_file: tmp.path().join("condense.toml"),
        };
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let provider = Arc::new(ScriptedProvider::echo());
        let p = pipeline(test_config(), Arc::clone(&provider))
            .await
            .with_usage_sink(sink.clone())
            .with_audit(paths.clone());
        let outcome = p
            .run(request(&text_of(120), &out), &CancellationToken::new())
            .await;
        assert!(outcome.success);

        let recorded = sink.0.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, MODEL);
        assert_eq!(recorded[0].1.summary.calls, 1);

        let audit = fs::read_to_string(paths.audit_log()).expect("audit log");
        assert!(audit.contains("\"phase\":\"usage\""));
        assert!(audit.contains("\"status\":\"complete\""));
    }
}
