use crate::summarize::chunker::{Chunk, Chunker};
use crate::summarize::config::{ChunkingConfig, PostprocessConfig};
use crate::summarize::dispatcher::{ChunkDispatcher, DispatchStatus, is_placeholder_line};
use crate::summarize::prompts::POSTPROCESS_INSTRUCTION;
use crate::summarize::usage::CallKind;
use crate::summarize::util::word_count;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanStatus {
    Applied,
    Skipped(&'static str),
    Fallback(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cleaned {
    pub text: String,
    pub status: CleanStatus,
}

impl Cleaned {
    fn unchanged(text: String, status: CleanStatus) -> Self {
        Self { text, status }
    }
}

pub fn strip_placeholders(summary: &str) -> String {
    summary
        .lines()
        .filter(|line| !is_placeholder_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Redundancy-removal pass. Never fails: any problem returns the input
/// (minus placeholder lines) untouched.
pub struct Postprocessor {
    dispatcher: ChunkDispatcher,
    chunking: ChunkingConfig,
    settings: PostprocessConfig,
}

impl Postprocessor {
    pub fn new(dispatcher: ChunkDispatcher, chunking: ChunkingConfig, settings: PostprocessConfig) -> Self {
        Self {
            dispatcher,
            chunking,
            settings,
        }
    }

    pub async fn clean(&self, summary: &str, cancel: &CancellationToken) -> Cleaned {
        let input = strip_placeholders(summary);
        if input.trim().is_empty() {
            return Cleaned::unchanged(input, CleanStatus::Skipped("empty summary"));
        }
        if !self.settings.enabled {
            return Cleaned::unchanged(input, CleanStatus::Skipped("disabled"));
        }

        let tokenizer = self.dispatcher.tokenizer();
        let tokens = tokenizer.count_tokens(&input);
        if tokens < self.settings.min_tokens {
            info!(tokens, min = self.settings.min_tokens, "summary below postprocess minimum");
            return Cleaned::unchanged(input, CleanStatus::Skipped("below token minimum"));
        }

        let settings = self.dispatcher.settings();
        let needed = (tokens as f64 * self.settings.token_factor).ceil() as u64
            + settings.per_call_overhead_tokens;
        let chunks = if needed <= u64::from(settings.max_output_tokens) {
            vec![Chunk {
                index: 0,
                text: input.clone(),
                token_count: tokens,
            }]
        } else {
            Chunker::new(
                tokenizer.as_ref(),
                self.chunking.max_tokens_per_chunk,
                self.chunking.overlap_fraction,
            )
            .split(&input)
        };
        info!(tokens, calls = chunks.len(), "postprocessing summary");

        let outcome = self
            .dispatcher
            .run(chunks, POSTPROCESS_INSTRUCTION, CallKind::Postprocess, None, cancel)
            .await;
        let reason = match outcome.status {
            DispatchStatus::Cancelled => {
                return Cleaned::unchanged(input, CleanStatus::Cancelled);
            }
            DispatchStatus::Failed(err) => err.to_string(),
            DispatchStatus::Complete if outcome.failed_chunks() > 0 => {
                format!("{} postprocess call(s) failed", outcome.failed_chunks())
            }
            DispatchStatus::Complete => {
                let before = word_count(&input);
                let after = word_count(&outcome.summary);
                if after < before / 4 {
                    format!("result too short ({after} of {before} words)")
                } else {
                    return Cleaned {
                        text: outcome.summary,
                        status: CleanStatus::Applied,
                    };
                }
            }
        };
        warn!(reason = %reason, "postprocess skipped, keeping assembled summary");
        Cleaned::unchanged(input, CleanStatus::Fallback(reason))
    }
}
