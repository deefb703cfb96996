//! Configuration loading

use anyhow::Result;
use std::path::Path;

use crate::Config;

/// Load and validate configuration
///
/// Config file search order:
/// 1. `explicit_path` (the `--config` flag)
/// 2. FEEDRELAY_CONFIG_PATH environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. Fall back to environment variables only
///
/// A path given by 1 or 2 must exist; only the default locations are
/// optional. Runs before logging is initialized, so progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let requested = explicit_path
        .map(ToString::to_string)
        .or_else(|| std::env::var("FEEDRELAY_CONFIG_PATH").ok())
        .filter(|p| !p.is_empty());

    let config_path = match requested {
        Some(path) if !Path::new(&path).exists() => {
            return Err(anyhow::anyhow!("Config file {path} does not exist"));
        }
        Some(path) => Some(path),
        None => ["config.yaml", "/config/config.yaml"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .map(ToString::to_string),
    };

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_path_fails() {
        let err = load_config(Some("/nonexistent/feedrelay.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/feedrelay.yaml"));
    }
}
