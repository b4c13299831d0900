use crate::summarize::paths::CondensePaths;
use crate::summarize::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub at_utc: String,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(paths: &CondensePaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        at_utc: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.audit_log();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::append_event;
    use crate::summarize::paths::CondensePaths;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn append_event_writes_one_json_line_per_call() {
        let tmp = tempdir().expect("tempdir");
        let paths = CondensePaths {
            condense_home: tmp.path().to_path_buf(),
            logs_dir: tmp.path().join("logs"),
            config_file: tmp.path().join("condense.toml"),
        };

        append_event(&paths, "job", "ok", "first").expect("append first");
        append_event(&paths, "usage", "ok", "second").expect("append second");

        let raw = fs::read_to_string(paths.audit_log()).expect("read audit log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(parsed["phase"], "usage");
        assert_eq!(parsed["message"], "second");
    }
}
