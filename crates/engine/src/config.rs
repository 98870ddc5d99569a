use std::path::Path;

use factory_common::config::EngineConfig;
use factory_common::{FactoryError, Result};

/// Load engine configuration from an optional TOML file; absent fields
/// (or an absent file) fall back to the protocol defaults.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                FactoryError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            toml::from_str(&raw).map_err(|e| {
                FactoryError::Config(format!("failed to parse {}: {}", path.display(), e))
            })?
        }
        None => EngineConfig::default(),
    };

    validate(&config)?;
    Ok(config)
}

/// Reject configurations the engine cannot operate under.
pub fn validate(config: &EngineConfig) -> Result<()> {
    if config.lifecycle.default_node_capacity < 1 {
        return Err(FactoryError::Config(
            "lifecycle.default_node_capacity must be at least 1".to_string(),
        ));
    }
    if config.lifecycle.node_scatter < 1 || config.lifecycle.claim_scatter < 1 {
        return Err(FactoryError::Config(
            "lifecycle scatter widths must be at least 1".to_string(),
        ));
    }
    if config.lifecycle.agent_heartbeat_interval_secs < 1
        || config.lifecycle.claim_heartbeat_timeout_secs < 1
    {
        return Err(FactoryError::Config(
            "lifecycle heartbeat periods must be at least 1 second".to_string(),
        ));
    }
    if config.scheduling.max_claim_retries < 1 || config.scheduling.max_claim_candidates < 1 {
        return Err(FactoryError::Config(
            "scheduling retry and candidate limits must be at least 1".to_string(),
        ));
    }
    if config.pump.cycle_interval_secs < 1 {
        return Err(FactoryError::Config(
            "pump.cycle_interval_secs must be at least 1".to_string(),
        ));
    }
    if config.messaging.schedule_queue_name.is_empty()
        || config.messaging.node_queue_prefix.is_empty()
    {
        return Err(FactoryError::Config(
            "messaging queue names must not be empty".to_string(),
        ));
    }
    if config.executor.image.is_empty() {
        return Err(FactoryError::Config(
            "executor.image must not be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_errors() {
        let err = load_config(Some(Path::new("/does/not/exist.toml"))).unwrap_err();
        assert!(matches!(err, FactoryError::Config(_)));
    }

    #[test]
    fn no_file_yields_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.scheduling.max_claim_retries, 10);
    }

    #[test]
    fn zero_scatter_is_rejected() {
        let mut config = EngineConfig::default();
        config.lifecycle.claim_scatter = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        let mut config = EngineConfig::default();
        config.messaging.schedule_queue_name.clear();
        assert!(validate(&config).is_err());
    }
}
