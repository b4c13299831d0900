use crate::error::{CondenseError, ProviderError};
use crate::summarize::checkpoint::CheckpointStore;
use crate::summarize::chunker::Chunk;
use crate::summarize::config::{DispatchConfig, PipelineConfig};
use crate::summarize::prompts::chunk_system_prompt;
use crate::summarize::provider::{Completion, CompletionProvider, CompletionRequest};
use crate::summarize::rate_limit::{BudgetWait, RateLimiter};
use crate::summarize::retry::{Attempted, RetryPolicy};
use crate::summarize::tokenizer::Tokenizer;
use crate::summarize::usage::{CallKind, CallUsage, UsageLedger};
use crate::summarize::util::word_count;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PLACEHOLDER_PREFIX: &str = "[chunk ";
const PLACEHOLDER_MARKER: &str = " failed: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Summary(String),
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub index: usize,
    pub outcome: ChunkOutcome,
    pub tokens_used: u64,
}

impl ChunkResult {
    pub fn failed(index: usize, reason: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            index,
            outcome: ChunkOutcome::Failed {
                reason: reason.into(),
            },
            tokens_used,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Failed { .. })
    }

    /// Summary text, or the placeholder line standing in for a failed chunk.
    pub fn text(&self) -> String {
        match &self.outcome {
            ChunkOutcome::Summary(text) => text.clone(),
            ChunkOutcome::Failed { reason } => placeholder(self.index, reason),
        }
    }
}

pub fn placeholder(index: usize, reason: &str) -> String {
    format!("{PLACEHOLDER_PREFIX}{index}{PLACEHOLDER_MARKER}{reason}]")
}

pub fn is_placeholder_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with(PLACEHOLDER_PREFIX)
        && trimmed.ends_with(']')
        && trimmed.contains(PLACEHOLDER_MARKER)
}

/// Joins results by chunk index, whatever order they completed in.
pub fn assemble(results: &[ChunkResult]) -> String {
    let mut ordered: Vec<&ChunkResult> = results.iter().collect();
    ordered.sort_by_key(|result| result.index);
    ordered
        .iter()
        .map(|result| result.text())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug)]
pub enum DispatchStatus {
    Complete,
    Cancelled,
    Failed(CondenseError),
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub summary: String,
    pub tokens_used: u64,
    pub status: DispatchStatus,
    pub results: Vec<ChunkResult>,
    pub groups_completed: usize,
    pub groups_total: usize,
}

impl DispatchOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, DispatchStatus::Complete)
    }

    pub fn failed_chunks(&self) -> usize {
        self.results.iter().filter(|r| r.is_failed()).count()
    }
}

struct DispatchShared {
    provider: Arc<dyn CompletionProvider>,
    tokenizer: Arc<dyn Tokenizer>,
    limiter: Arc<RateLimiter>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    ledger: Arc<UsageLedger>,
    settings: DispatchConfig,
    max_budget_wait: Duration,
}

/// Budget estimate for one call: a quarter token per character plus the fixed
/// per-call overhead.
pub fn estimate_call_tokens(text: &str, overhead: u64) -> u64 {
    text.chars().count().div_ceil(4) as u64 + overhead
}

/// Runs chunks through the provider in sequential groups of
/// `max_concurrent_chunks`, with calls inside a group running concurrently
/// under the shared semaphore.
#[derive(Clone)]
pub struct ChunkDispatcher {
    shared: Arc<DispatchShared>,
}

struct ChunkTask {
    shared: Arc<DispatchShared>,
    chunk: Chunk,
    system: Arc<str>,
    kind: CallKind,
    cancel: CancellationToken,
}

impl ChunkDispatcher {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tokenizer: Arc<dyn Tokenizer>,
        limiter: Arc<RateLimiter>,
        semaphore: Arc<Semaphore>,
        ledger: Arc<UsageLedger>,
        cfg: &PipelineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                provider,
                tokenizer,
                limiter,
                semaphore,
                retry: RetryPolicy::from_config(&cfg.retry),
                ledger,
                settings: cfg.dispatch.clone(),
                max_budget_wait: cfg.rate_limit.max_wait(),
            }),
        }
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.shared.tokenizer
    }

    pub fn settings(&self) -> &DispatchConfig {
        &self.shared.settings
    }

    pub fn estimate_group_tokens(&self, group: &[Chunk]) -> u64 {
        let overhead = self.shared.settings.per_call_overhead_tokens;
        group
            .iter()
            .map(|chunk| estimate_call_tokens(&chunk.text, overhead))
            .sum()
    }

    /// The last `context_token_limit` tokens of `assembled`.
    pub fn rolling_context(&self, assembled: &str) -> String {
        let limit = self.shared.settings.context_token_limit;
        if limit == 0 || assembled.is_empty() {
            return String::new();
        }
        let tokens = self.shared.tokenizer.encode(assembled);
        let start = tokens.len().saturating_sub(limit);
        self.shared.tokenizer.decode(&tokens[start..])
    }

    pub async fn run(
        &self,
        chunks: Vec<Chunk>,
        prompt: &str,
        kind: CallKind,
        checkpoint: Option<&CheckpointStore>,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let group_size = self.shared.settings.max_concurrent_chunks.max(1);
        let groups_total = chunks.len().div_ceil(group_size);
        let mut results: Vec<ChunkResult> = Vec::with_capacity(chunks.len());
        let mut texts: Vec<String> = Vec::with_capacity(chunks.len());
        let mut tokens_used = 0u64;
        let mut groups_completed = 0usize;
        let mut status = DispatchStatus::Complete;

        for (group_no, group) in chunks.chunks(group_size).enumerate() {
            if cancel.is_cancelled() {
                status = DispatchStatus::Cancelled;
                break;
            }

            let needed = self.estimate_group_tokens(group);
            match self
                .shared
                .limiter
                .wait_for(needed, cancel, self.shared.max_budget_wait)
                .await
            {
                BudgetWait::Granted => {}
                BudgetWait::Cancelled => {
                    status = DispatchStatus::Cancelled;
                    break;
                }
                BudgetWait::TimedOut { waited } => {
                    warn!(group = group_no, needed, waited_secs = waited.as_secs(), "token budget wait exceeded");
                    status = DispatchStatus::Failed(CondenseError::BudgetWaitExceeded {
                        needed,
                        waited_secs: waited.as_secs(),
                    });
                    break;
                }
            }

            let context = self.rolling_context(&texts.join("\n"));
            let system: Arc<str> = Arc::from(chunk_system_prompt(prompt, &context));
            debug!(
                group = group_no,
                first = group[0].index,
                last = group[group.len() - 1].index,
                needed,
                "dispatching group"
            );

            let mut set = JoinSet::new();
            for chunk in group {
                let task = ChunkTask {
                    shared: Arc::clone(&self.shared),
                    chunk: chunk.clone(),
                    system: Arc::clone(&system),
                    kind,
                    cancel: cancel.clone(),
                };
                set.spawn(task.run());
            }

            let mut group_results = Vec::with_capacity(group.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Some(result)) => group_results.push(result),
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "chunk task aborted"),
                }
            }

            let group_tokens: u64 = group_results.iter().map(|r| r.tokens_used).sum();
            self.shared.limiter.deduct(group_tokens);
            tokens_used += group_tokens;

            // Results of a group interrupted by cancellation are discarded so the
            // assembled text only ever covers whole groups.
            if cancel.is_cancelled() {
                status = DispatchStatus::Cancelled;
                break;
            }

            let returned: BTreeSet<usize> = group_results.iter().map(|r| r.index).collect();
            for chunk in group {
                if !returned.contains(&chunk.index) {
                    group_results.push(ChunkResult::failed(chunk.index, "task did not complete", 0));
                }
            }
            group_results.sort_by_key(|r| r.index);
            texts.extend(group_results.iter().map(ChunkResult::text));
            results.extend(group_results);
            groups_completed += 1;

            info!(
                group = group_no + 1,
                groups = groups_total,
                group_tokens,
                available = self.shared.limiter.available(),
                "group complete"
            );

            if let Some(store) = checkpoint
                && let Err(err) = store.save(&texts.join("\n")).await
            {
                warn!(error = %err, "checkpoint write failed");
            }
        }

        DispatchOutcome {
            summary: texts.join("\n"),
            tokens_used,
            status,
            results,
            groups_completed,
            groups_total,
        }
    }
}

impl ChunkTask {
    /// `None` when cancellation was observed before a result was produced.
    async fn run(self) -> Option<ChunkResult> {
        let shared = &self.shared;
        let _permit = tokio::select! {
            permit = Arc::clone(&shared.semaphore).acquire_owned() => permit.ok()?,
            _ = self.cancel.cancelled() => return None,
        };

        let request = CompletionRequest {
            kind: self.kind,
            system: self.system.to_string(),
            user: self.chunk.text.clone(),
            max_tokens: shared.settings.max_output_tokens,
            temperature: shared.settings.temperature,
        };
        let timeout = shared.settings.request_timeout();
        let provider = &shared.provider;
        let request_ref = &request;
        let attempted = shared
            .retry
            .run(&self.cancel, || async move {
                match tokio::time::timeout(timeout, provider.complete(request_ref)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout.as_secs())),
                }
            })
            .await;

        let index = self.chunk.index;
        match attempted {
            Attempted::Done(completion) => Some(self.accept(completion, &request)),
            Attempted::Failed { error, attempts } => {
                warn!(chunk = index, attempts, error = %error, "chunk failed");
                Some(ChunkResult::failed(
                    index,
                    format!("{error} (after {attempts} attempt(s))"),
                    0,
                ))
            }
            Attempted::Cancelled => None,
        }
    }

    fn accept(&self, completion: Completion, request: &CompletionRequest) -> ChunkResult {
        let shared = &self.shared;
        shared.ledger.record(CallUsage {
            kind: self.kind,
            system_prompt_tokens: shared.tokenizer.count_tokens(&request.system) as u64,
            user_prompt_tokens: shared.tokenizer.count_tokens(&request.user) as u64,
            input_tokens: completion.usage.input_tokens,
            output_tokens: completion.usage.output_tokens,
        });
        let tokens_used = completion.usage.total();
        let words = word_count(&completion.text);
        if words < shared.settings.min_summary_words {
            warn!(chunk = self.chunk.index, words, "chunk summary too short");
            return ChunkResult::failed(
                self.chunk.index,
                format!("summary too short ({words} words)"),
                tokens_used,
            );
        }
        debug!(chunk = self.chunk.index, tokens_used, "chunk summarized");
        ChunkResult {
            index: self.chunk.index,
            outcome: ChunkOutcome::Summary(completion.text),
            tokens_used,
        }
    }
}
