use anyhow::Result;
use std::path::Path;

use crate::commands::CommandReport;
use crate::summarize::checkpoint::CheckpointStore;
use crate::summarize::util::truncate_with_ellipsis;

const PREVIEW_LINES: usize = 20;
const PREVIEW_LINE_CHARS: usize = 160;

/// The last few lines of a checkpoint, each clipped for the terminal.
fn preview(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(PREVIEW_LINES);
    lines[start..]
        .iter()
        .map(|line| truncate_with_ellipsis(line, PREVIEW_LINE_CHARS))
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn show(summary_path: &Path) -> Result<CommandReport> {
    let store = CheckpointStore::for_summary(summary_path);
    let mut report = CommandReport::new("checkpoint-show");
    report.detail(format!("partial={}", store.partial_path().display()));
    report.detail(format!("backup={}", store.backup_path().display()));

    match store.load().await? {
        Some(text) => {
            report.detail(format!("lines={}", text.lines().count()));
            report.detail(format!("chars={}", text.chars().count()));
            report.body(preview(&text));
        }
        None => report.detail("no checkpoint"),
    }
    Ok(report)
}

pub async fn clear(summary_path: &Path) -> Result<CommandReport> {
    let store = CheckpointStore::for_summary(summary_path);
    let mut report = CommandReport::new("checkpoint-clear");
    if store.clear().await? {
        report.detail(format!("removed={}", store.partial_path().display()));
    } else {
        report.detail("no checkpoint");
    }
    Ok(report)
}
