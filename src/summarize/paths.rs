use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CondensePaths {
    pub condense_home: PathBuf,
    pub logs_dir: PathBuf,
    pub config_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<CondensePaths> {
    let condense_home = match env::var("CONDENSE_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".condense"),
    };
    let logs_dir = env_or_default_path("CONDENSE_LOGS_DIR", condense_home.join("logs"));
    let config_file = env_or_default_path(
        "CONDENSE_CONFIG_PATH",
        condense_home.join("condense.toml"),
    );

    Ok(CondensePaths {
        condense_home,
        logs_dir,
        config_file,
    })
}

impl CondensePaths {
    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }
}
