use thiserror::Error;

/// Job-level failures. Chunk-level provider problems never surface here;
/// they degrade into placeholders inside the assembled summary.
#[derive(Debug, Error)]
pub enum CondenseError {
    #[error("config invalid: {0}")]
    InvalidConfig(String),
    #[error("unknown model identifier `{0}`: no tokenizer mapping")]
    UnknownModel(String),
    #[error("tokenizer unavailable for `{model}`: {reason}")]
    Tokenizer { model: String, reason: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("provider unavailable for `{model}`: {reason}")]
    ProviderSetup { model: String, reason: String },
    #[error("token budget wait exceeded {waited_secs}s for {needed} tokens")]
    BudgetWaitExceeded { needed: u64, waited_secs: u64 },
    #[error("checkpoint io failed for {path}: {source}")]
    Checkpoint {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("summary write failed for {path}: {reason}")]
    SummaryWrite { path: String, reason: String },
}

/// A single provider call failure, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("provider call timed out after {0}s")]
    Timeout(u64),
    #[error("provider server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("provider rejected request {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider returned no usable content: {0}")]
    EmptyContent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Connection(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited(body),
            500..=599 => Self::Server { status, body },
            _ => Self::Rejected { status, body },
        }
    }
}

impl CondenseError {
    /// Config and validation problems are raised before any chunk is sent.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::UnknownModel(_)
                | Self::Tokenizer { .. }
                | Self::Validation(_)
                | Self::ProviderSetup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{CondenseError, ProviderError};

    #[test]
    fn config_errors_are_fail_fast() {
        assert!(CondenseError::UnknownModel("x".to_string()).is_fail_fast());
        assert!(CondenseError::Validation("empty".to_string()).is_fail_fast());
        assert!(
            !CondenseError::BudgetWaitExceeded {
                needed: 10,
                waited_secs: 300
            }
            .is_fail_fast()
        );
    }

    #[test]
    fn budget_error_message_names_the_wait() {
        let err = CondenseError::BudgetWaitExceeded {
            needed: 4200,
            waited_secs: 300,
        };
        assert_eq!(
            err.to_string(),
            "token budget wait exceeded 300s for 4200 tokens"
        );
    }

    #[test]
    fn status_classification_drives_retry() {
        assert!(ProviderError::from_status(429, String::new()).is_transient());
        assert!(ProviderError::from_status(503, String::new()).is_transient());
        assert!(!ProviderError::from_status(400, String::new()).is_transient());
        assert!(!ProviderError::Malformed("no usage".to_string()).is_transient());
        assert!(!ProviderError::EmptyContent("blank".to_string()).is_transient());
    }
}
