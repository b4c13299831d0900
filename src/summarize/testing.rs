use crate::error::ProviderError;
use crate::summarize::config::PipelineConfig;
use crate::summarize::provider::{Completion, CompletionProvider, CompletionRequest, TokenUsage};
use crate::summarize::tokenizer::{TokenId, Tokenizer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One token per Unicode scalar.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(|c| c as u32).collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        tokens.iter().filter_map(|t| char::from_u32(*t)).collect()
    }

    fn name(&self) -> &str {
        "chars"
    }
}

type Respond = dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync;
type Delay = dyn Fn(&CompletionRequest) -> Duration + Send + Sync;

pub struct ScriptedProvider {
    respond: Box<Respond>,
    delay: Box<Delay>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(
        respond: impl Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Box::new(|_| Duration::ZERO),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with `<user text>` wrapped in angle brackets.
    pub fn echo() -> Self {
        Self::new(|req| Ok(format!("<{}>", req.user)))
    }

    pub fn with_delay(
        mut self,
        delay: impl Fn(&CompletionRequest) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = Box::new(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = (self.delay)(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = (self.respond)(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let text = outcome?;
        Ok(Completion {
            usage: TokenUsage {
                input_tokens: (request.system.chars().count() + request.user.chars().count()) as u64,
                output_tokens: text.chars().count() as u64,
            },
            text,
        })
    }

    fn label(&self) -> &str {
        "scripted"
    }
}

/// Pipeline settings sized for character tokens and instant retries.
pub fn test_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.chunking.max_tokens_per_chunk = 300;
    cfg.chunking.overlap_fraction = 0.2;
    cfg.dispatch.min_summary_words = 1;
    cfg.dispatch.context_token_limit = 10;
    cfg.retry.max_attempts = 3;
    cfg.retry.min_delay_ms = 1;
    cfg.retry.factor_ms = 1;
    cfg.retry.max_delay_ms = 10;
    cfg.postprocess.enabled = false;
    cfg
}
