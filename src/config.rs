/// Top-level configuration.
///
/// Every section has working defaults, so an empty JSON object is a valid
/// config file:
///
/// ```ignore
/// use koru_recall::RecallConfig;
///
/// let config = RecallConfig::from_json_file("recall.json")?;
/// let core = koru_recall::MemoryCore::open(config, store).await?;
/// ```
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cache::CacheConfig;
use crate::error::{RecallError, RecallResult};
use crate::maintenance::SchedulerConfig;
use crate::vector::IndexConfig;
use crate::weight::WeightConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub weights: WeightConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub maintenance: SchedulerConfig,
}

impl RecallConfig {
    /// Parse and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> RecallResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            RecallError::InvalidConfig(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON string.
    pub fn from_json_str(json: &str) -> RecallResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RecallError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> RecallResult<()> {
        self.weights.validate()?;
        self.cache.validate()?;
        self.index.validate()?;
        self.maintenance.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::IndexKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        assert!(RecallConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = RecallConfig::from_json_str("{}").unwrap();
        assert_eq!(config.maintenance.workers, 3);
        assert_eq!(config.index.kind, IndexKind::Flat);
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = RecallConfig::default();
        config.index = IndexConfig::graph(8);
        config.maintenance.workers = 5;
        config.cache.promote_after_hits = 7;

        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = RecallConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_sections() {
        let config = RecallConfig::from_json_str(
            r#"{"index": {"dimension": 4}, "maintenance": {"workers": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.index.dimension, 4);
        assert_eq!(config.maintenance.workers, 2);
        assert_eq!(config.maintenance.queue_depth(), 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{"maintenance": {"workers": 0}}"#,
            r#"{"index": {"dimension": 0}}"#,
            r#"{"weights": {"min_weight": 5.0, "max_weight": 1.0}}"#,
            r#"{"cache": {"hot": {"max_items": 0, "max_bytes": 10}}}"#,
        ] {
            assert!(
                matches!(RecallConfig::from_json_str(json), Err(RecallError::InvalidConfig(_))),
                "accepted {json}"
            );
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            RecallConfig::from_json_str("{not json"),
            Err(RecallError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"maintenance": {{"shutdown_grace_secs": 2}}}}"#).unwrap();
        let config = RecallConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.maintenance.shutdown_grace_secs, 2);
    }
}
