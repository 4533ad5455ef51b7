use std::path::Path;

use anyhow::{Context, Result};
use chronicle_core::Channel;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Pipeline settings loaded from YAML. Every field defaults, so a minimal
/// document still yields a working offline pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub enrichment: EnrichmentConfig,
    pub notification_channels: Vec<Channel>,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enrichment: EnrichmentConfig::default(),
            notification_channels: vec![Channel::InApp, Channel::Email],
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EnrichmentConfig {
    /// Base URL of an OpenAI-compatible API. Absent selects the offline
    /// heuristic provider.
    pub endpoint: Option<String>,
    pub model: String,
    pub embedding_model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key_env: "CHRONICLE_API_KEY".to_string(),
        }
    }
}

/// Load pipeline configuration from a YAML file.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCFG-001
    #[test]
    fn defaults_cover_channels_and_retry() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.notification_channels,
            vec![Channel::InApp, Channel::Email]
        );
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.enrichment.endpoint.is_none());
        assert_eq!(config.enrichment.api_key_env, "CHRONICLE_API_KEY");
    }

    // Test IDs: TCFG-002
    #[test]
    fn partial_yaml_fills_missing_fields_with_defaults() {
        let parsed: PipelineConfig = match serde_yaml::from_str(
            "enrichment:\n  endpoint: http://localhost:8080/v1\nnotification_channels: [in-app]\n",
        ) {
            Ok(parsed) => parsed,
            Err(err) => panic!("expected config to parse: {err}"),
        };
        assert_eq!(
            parsed.enrichment.endpoint.as_deref(),
            Some("http://localhost:8080/v1")
        );
        assert_eq!(parsed.enrichment.model, "gpt-4o-mini");
        assert_eq!(parsed.notification_channels, vec![Channel::InApp]);
        assert_eq!(parsed.retry.initial_delay_ms, 500);
    }

    // Test IDs: TCFG-003
    #[test]
    fn unknown_fields_are_rejected() {
        let parsed = serde_yaml::from_str::<PipelineConfig>("telemetry: true\n");
        assert!(parsed.is_err());
    }

    // Test IDs: TCFG-004
    #[test]
    fn load_config_reports_a_missing_file() {
        let missing = Path::new("/nonexistent/chronicle/config.yaml");
        let loaded = load_config(missing);
        assert!(loaded.is_err());
    }
}
