//! Engine configuration with command-line overrides

use binsight_classifiers::{EngineConfig, ModelSourceSpec};
use std::path::Path;
use tracing::{info, warn};

/// Load the engine configuration from `config_path` (defaults when the file is absent)
/// and apply command-line overrides
pub fn load(config_path: &Path, cli: &crate::Cli) -> anyhow::Result<EngineConfig> {
    let mut config = if config_path.exists() {
        info!("Loading configuration from {}", config_path.display());
        EngineConfig::from_file(config_path)?
    } else {
        warn!(
            "Configuration file {} not found, using defaults",
            config_path.display()
        );
        EngineConfig::default()
    };

    apply_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut EngineConfig, cli: &crate::Cli) {
    if let Some(model) = &cli.model {
        config.model = Some(ModelSourceSpec::Local { path: model.clone() });
    }

    if cli.augment {
        config.defaults.augment = true;
    }

    if let Some(threshold) = cli.threshold {
        config.defaults.confidence_threshold = threshold;
    }

    if let Some(top_k) = cli.top_k {
        config.defaults.top_k = top_k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binsight.yaml");
        std::fs::write(
            &path,
            "model:\n  path: ./models/old.pth\ndefaults:\n  confidence_threshold: 0.6\n",
        )
        .unwrap();

        let cli = crate::Cli::parse_from([
            "binsight",
            "--model",
            "./models/new.safetensors",
            "--augment",
            "--top-k",
            "5",
            "bottle.jpg",
        ]);
        let config = load(&path, &cli).unwrap();

        assert!(matches!(
            config.model,
            Some(ModelSourceSpec::Local { ref path }) if path.ends_with("new.safetensors")
        ));
        assert!(config.defaults.augment);
        assert_eq!(config.defaults.confidence_threshold, 0.6);
        assert_eq!(config.defaults.top_k, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cli = crate::Cli::parse_from(["binsight", "can.png"]);
        let config = load(Path::new("/nonexistent/binsight.yaml"), &cli).unwrap();
        assert!(config.model.is_none());
        assert_eq!(config.cache_capacity, 500);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = crate::Cli::parse_from(["binsight", "--threshold", "0", "can.png"]);
        assert!(load(Path::new("/nonexistent/binsight.yaml"), &cli).is_err());
    }
}
