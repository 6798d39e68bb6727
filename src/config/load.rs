//! Reading a run configuration from YAML

use super::schema::AutoRoundConfig;
use super::validate::validate_config;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Parse and validate a YAML configuration document
pub fn parse_config(yaml: &str) -> Result<AutoRoundConfig> {
    let config: AutoRoundConfig = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;
    validate_config(&config).map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))?;
    Ok(config)
}

/// Load a run configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<AutoRoundConfig> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;
    parse_config(&yaml_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_valid_config() {
        let yaml = r#"
bits: 4
group_size: 32
iters: 100
batch_size: 4
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.group_size, 32);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.resolved_lr(), 0.01);
    }

    #[test]
    fn test_load_invalid_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"batch_size: 0\n").unwrap();

        let result = load_config(temp_file.path());
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_load_malformed_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"this is not valid yaml: [}").unwrap();

        assert!(load_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/autoround.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
