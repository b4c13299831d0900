use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Summary,
    Postprocess,
}

impl CallKind {
    pub fn label(self) -> &'static str {
        match self {
            CallKind::Summary => "summary",
            CallKind::Postprocess => "postprocess",
        }
    }
}

/// One successful provider call. Prompt sizes are measured locally with the
/// job tokenizer; input/output come from the provider's own counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUsage {
    pub kind: CallKind,
    pub system_prompt_tokens: u64,
    pub user_prompt_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTotals {
    fn add(&mut self, call: &CallUsage) {
        self.calls += 1;
        self.input_tokens += call.input_tokens;
        self.output_tokens += call.output_tokens;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub summary: UsageTotals,
    pub postprocess: UsageTotals,
    pub calls: Vec<CallUsage>,
}

impl UsageReport {
    pub fn input_tokens(&self) -> u64 {
        self.summary.input_tokens + self.postprocess.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.summary.output_tokens + self.postprocess.output_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens() + self.output_tokens()
    }
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    calls: Mutex<Vec<CallUsage>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: CallUsage) {
        self.calls.lock().push(call);
    }

    pub fn report(&self) -> UsageReport {
        let calls = self.calls.lock().clone();
        let mut report = UsageReport::default();
        for call in &calls {
            match call.kind {
                CallKind::Summary => report.summary.add(call),
                CallKind::Postprocess => report.postprocess.add(call),
            }
        }
        report.calls = calls;
        report
    }
}

/// Receives per-job token counters. Pricing happens on the other side.
pub trait UsageSink: Send + Sync {
    fn record(&self, model: &str, report: &UsageReport) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::{CallKind, CallUsage, UsageLedger};

    fn call(kind: CallKind, input: u64, output: u64) -> CallUsage {
        CallUsage {
            kind,
            system_prompt_tokens: 10,
            user_prompt_tokens: input - 10,
            input_tokens: input,
            output_tokens: output,
        }
    }

    #[test]
    fn report_splits_totals_by_kind() {
        let ledger = UsageLedger::new();
        ledger.record(call(CallKind::Summary, 120, 40));
        ledger.record(call(CallKind::Summary, 100, 30));
        ledger.record(call(CallKind::Postprocess, 80, 60));

        let report = ledger.report();
        assert_eq!(report.summary.calls, 2);
        assert_eq!(report.summary.input_tokens, 220);
        assert_eq!(report.postprocess.output_tokens, 60);
        assert_eq!(report.input_tokens(), 300);
        assert_eq!(report.output_tokens(), 130);
        assert_eq!(report.total_tokens(), 430);
        assert_eq!(report.calls.len(), 3);
    }

    #[test]
    fn call_kind_serializes_snake_case() {
        let raw = serde_json::to_string(&CallKind::Postprocess).expect("serialize");
        assert_eq!(raw, "\"postprocess\"");
    }
}
