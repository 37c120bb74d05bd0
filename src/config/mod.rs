pub mod schema;

pub use schema::Config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load configuration, checking (in order):
/// 1. an explicit path (the `--config` flag)
/// 2. `$TOOLGATE_CONFIG` env var
/// 3. `~/.toolgate/config.yaml`
/// 4. Built-in defaults
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(resolve_config_path);

    let mut config = match path {
        Some(p) if p.exists() => {
            tracing::info!(path = %p.display(), "loading config");
            let raw = std::fs::read_to_string(&p)
                .with_context(|| format!("reading config from {}", p.display()))?;
            serde_yaml::from_str::<Config>(&raw)
                .with_context(|| format!("parsing config from {}", p.display()))?
        }
        Some(p) if explicit.is_some() => {
            anyhow::bail!("config file {} does not exist", p.display());
        }
        _ => {
            tracing::debug!("no config file found, using defaults");
            Config::default()
        }
    };

    resolve_env_vars(&mut config);
    Ok(config)
}

/// Determine the config file path.
fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TOOLGATE_CONFIG") {
        let p = PathBuf::from(path);
        if !p.as_os_str().is_empty() {
            return Some(p);
        }
    }

    dirs::home_dir().map(|h| h.join(".toolgate").join("config.yaml"))
}

/// Resolve `${ENV_VAR}` references in the path-valued fields. Directory sets
/// in the policy are resolved by the path guard itself.
fn resolve_env_vars(config: &mut Config) {
    let resolve = |p: &mut Option<PathBuf>| {
        if let Some(path) = p.as_ref().and_then(|p| p.to_str()) {
            *p = Some(PathBuf::from(substitute_env_vars(path)));
        }
    };
    resolve(&mut config.root);
    resolve(&mut config.exec.log_path);
    resolve(&mut config.files.backup_dir);
}

/// Substitute `${VAR}` patterns with environment variable values.
/// Unset variables expand to the empty string, except when the whole value is
/// a single reference, which is then left unchanged.
pub fn substitute_env_vars(input: &str) -> String {
    if let Some(inner) = extract_env_ref(input) {
        return std::env::var(inner).unwrap_or_else(|_| input.to_string());
    }
    let mut result = input.to_string();
    let mut search_from = 0;
    while let Some(offset) = result[search_from..].find("${") {
        let start = search_from + offset;
        let rest = &result[start + 2..];
        let Some(end) = rest.find('}') else { break };
        let var_name = &rest[..end];
        let replacement = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], replacement, &rest[end + 1..]);
        search_from = start + replacement.len();
    }
    result
}

/// If the entire string is `${VAR}`, return the variable name.
fn extract_env_ref(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.len() > 3 {
        let inner = &trimmed[2..trimmed.len() - 1];
        if !inner.contains('{') && !inner.contains('}') {
            return Some(inner);
        }
    }
    None
}
