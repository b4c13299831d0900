use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryLevel {
    VeryConcise,
    #[default]
    Concise,
    Moderate,
    Detailed,
    VeryDetailed,
}

impl SummaryLevel {
    pub fn word_limit(self) -> u32 {
        match self {
            SummaryLevel::VeryConcise => 100,
            SummaryLevel::Concise => 200,
            SummaryLevel::Moderate => 300,
            SummaryLevel::Detailed => 400,
            SummaryLevel::VeryDetailed => 500,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SummaryLevel::VeryConcise => "very-concise",
            SummaryLevel::Concise => "concise",
            SummaryLevel::Moderate => "moderate",
            SummaryLevel::Detailed => "detailed",
            SummaryLevel::VeryDetailed => "very-detailed",
        }
    }
}

impl fmt::Display for SummaryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SummaryLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "very-concise" => Ok(SummaryLevel::VeryConcise),
            "concise" => Ok(SummaryLevel::Concise),
            "moderate" => Ok(SummaryLevel::Moderate),
            "detailed" => Ok(SummaryLevel::Detailed),
            "very-detailed" => Ok(SummaryLevel::VeryDetailed),
            other => Err(format!("unknown summary level `{other}`")),
        }
    }
}

pub const POSTPROCESS_INSTRUCTION: &str = "You are an expert editor who improves texts by removing redundancy. \
Remove only sentences or ideas that repeat something already stated. \
Do not shorten, reinterpret or restructure the remaining content, and keep its original language and order. \
Return only the edited text.";

/// Summary instruction used when the caller supplies no prompt template.
pub fn default_summary_prompt(level: SummaryLevel) -> String {
    format!(
        "You are an expert summarizer. Summarize the text you are given completely, \
highlighting its main themes, key points and overall purpose in about {} words. \
Write in the language of the text and return only the summary.",
        level.word_limit()
    )
}

fn context_prompt(previous: &str) -> String {
    format!(
        "The following is the end of the summary written so far for earlier parts of the same text. \
Continue it without repeating it, keeping names and narrative consistent:\n{previous}"
    )
}

/// System message for one chunk call: the shared prompt plus, when present,
/// the rolling context from the assembled summary.
pub fn chunk_system_prompt(prompt: &str, previous_context: &str) -> String {
    if previous_context.trim().is_empty() {
        prompt.to_string()
    } else {
        format!("{prompt}\n{}", context_prompt(previous_context))
    }
}
