use anyhow::Result;
use std::env;

use crate::commands::CommandReport;
use crate::summarize::config::load_config;
use crate::summarize::paths::resolve_paths;

include!(concat!(env!("OUT_DIR"), "/condense_env_allowlist.rs"));

/// Environment variables with the `CONDENSE_` prefix that are set and
/// recognized by this build.
pub fn active_env_overrides() -> Vec<&'static str> {
    GENERATED_CONDENSE_ENV_ALLOWLIST
        .iter()
        .copied()
        .filter(|key| env::var_os(key).is_some())
        .collect()
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("config");
    report.detail(format!("build={}", env!("BUILD_UUID")));
    report.detail(format!("condense_home={}", paths.condense_home.display()));
    report.detail(format!(
        "config_file={} (exists={})",
        paths.config_file.display(),
        paths.config_file.exists()
    ));
    report.detail(format!("audit_log={}", paths.audit_log().display()));
    for key in active_env_overrides() {
        report.detail(format!("env_override={key}"));
    }

    match load_config(&paths.config_file) {
        Ok(cfg) => report.body(toml::to_string_pretty(&cfg)?),
        Err(err) => report.issue(format!("{err:#}")),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::GENERATED_CONDENSE_ENV_ALLOWLIST;

    #[test]
    fn allowlist_covers_config_overrides() {
        for key in [
            "CONDENSE_HOME",
            "CONDENSE_TOKENS_PER_MINUTE",
            "CONDENSE_MAX_CONCURRENT_CHUNKS",
        ] {
            assert!(GENERATED_CONDENSE_ENV_ALLOWLIST.contains(&key), "{key}");
        }
    }
}
