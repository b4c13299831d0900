use crate::error::CondenseError;
use std::fmt;
use tiktoken_rs::CoreBPE;

pub type TokenId = u32;

/// Model-specific text <-> token mapping. Implementations are shared across
/// concurrent tasks and must be deterministic for a given model.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Decodes a token window. A multibyte character split at either edge of
    /// the window is dropped rather than reported as an error.
    fn decode(&self, tokens: &[TokenId]) -> String;

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    fn name(&self) -> &str;
}

// Families without a published BPE that are close enough to cl100k for
// budgeting purposes.
const CL100K_APPROXIMATED_PREFIXES: &[&str] = &["claude-", "gemini-", "deepseek-", "local"];

pub struct BpeTokenizer {
    bpe: CoreBPE,
    name: String,
}

impl fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpeTokenizer").field("name", &self.name).finish()
    }
}

fn strip_provider_prefix(model: &str) -> &str {
    match model.split_once(':') {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim(),
        _ => model.trim(),
    }
}

impl BpeTokenizer {
    pub fn for_model(model: &str) -> Result<Self, CondenseError> {
        let bare = strip_provider_prefix(model);
        if bare.is_empty() {
            return Err(CondenseError::UnknownModel(model.to_string()));
        }

        if let Ok(bpe) = tiktoken_rs::get_bpe_from_model(bare) {
            return Ok(Self {
                bpe,
                name: bare.to_string(),
            });
        }

        let lower = bare.to_ascii_lowercase();
        if CL100K_APPROXIMATED_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
        {
            let bpe = tiktoken_rs::cl100k_base().map_err(|err| CondenseError::Tokenizer {
                model: model.to_string(),
                reason: format!("{err}"),
            })?;
            return Ok(Self {
                bpe,
                name: format!("cl100k_base~{bare}"),
            });
        }

        Err(CondenseError::UnknownModel(model.to_string()))
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        self.bpe.encode_with_special_tokens(text)
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        if tokens.is_empty() {
            return String::new();
        }
        // A window edge can cut through a multibyte character; shrink by up to
        // three tokens on each side until the bytes form valid UTF-8.
        let len = tokens.len();
        for trim in 0..=6usize {
            for lead in 0..=trim.min(3) {
                let trail = trim - lead;
                if trail > 3 || lead + trail >= len {
                    continue;
                }
                if let Ok(text) = self.bpe.decode(tokens[lead..len - trail].to_vec()) {
                    return text;
                }
            }
        }
        String::new()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::{BpeTokenizer, Tokenizer, strip_provider_prefix};
    use crate::error::CondenseError;

    #[test]
    fn provider_prefix_is_ignored_for_lookup() {
        assert_eq!(strip_provider_prefix("openai:gpt-4o"), "gpt-4o");
        assert_eq!(strip_provider_prefix("gpt-4o"), "gpt-4o");
        assert_eq!(strip_provider_prefix("openai:"), "openai:");
    }

    #[test]
    fn known_openai_model_round_trips_ascii() {
        let tok = BpeTokenizer::for_model("gpt-4o").expect("tokenizer");
        let ids = tok.encode("The quick brown fox jumps over the lazy dog.");
        assert!(!ids.is_empty());
        assert_eq!(
            tok.decode(&ids),
            "The quick brown fox jumps over the lazy dog."
        );
    }

    #[test]
    fn claude_models_use_cl100k_approximation() {
        let tok = BpeTokenizer::for_model("anthropic:claude-3-5-sonnet-latest").expect("tokenizer");
        assert!(tok.name().starts_with("cl100k_base~"));
        assert!(tok.count_tokens("hello world") > 0);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let err = BpeTokenizer::for_model("mystery-model-9000").expect_err("must fail");
        assert!(matches!(err, CondenseError::UnknownModel(_)));
        assert!(err.is_fail_fast());
    }

    #[test]
    fn split_multibyte_edges_do_not_panic() {
        let tok = BpeTokenizer::for_model("gpt-4").expect("tokenizer");
        let ids = tok.encode("naïve café 東京 résumé");
        for start in 0..ids.len() {
            let _ = tok.decode(&ids[start..]);
            let _ = tok.decode(&ids[..ids.len() - start]);
        }
        assert_eq!(tok.decode(&[]), "");
    }
}
