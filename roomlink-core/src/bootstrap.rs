//! Configuration loading and process identity

use anyhow::Result;
use tracing::info;

use crate::Config;

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. explicit path (CLI flag)
/// 2. `ROOMLINK_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. environment variables only
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var("ROOMLINK_CONFIG_PATH").ok())
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        // Logging is not initialized yet
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
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

/// Resolve the identifier this media server reports to the balancer
#[must_use]
pub fn resolve_server_id(config: &Config) -> String {
    if !config.server.server_id.is_empty() {
        return config.server.server_id.clone();
    }

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let server_id = format!("{hostname}-{}", nanoid::nanoid!(6));
    info!(server_id = %server_id, "Generated server id");
    server_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_server_id_wins() {
        let mut config = Config::default();
        config.server.server_id = "media-1".to_string();
        assert_eq!(resolve_server_id(&config), "media-1");
    }

    #[test]
    fn test_generated_server_ids_are_unique() {
        let config = Config::default();
        let a = resolve_server_id(&config);
        let b = resolve_server_id(&config);
        assert_ne!(a, b);
    }
}
