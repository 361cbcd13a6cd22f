use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SchemaSettings {
    /// TOML or JSON schema document.
    pub path: PathBuf,
    /// Data model to crack or generate. Defaults to the first model in the document.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CrackerSettings {
    #[serde(default = "default_choice_cache")]
    pub choice_cache: bool,
    /// Bytes of upcoming data fingerprinted for a choice-cache key.
    #[serde(default = "default_cache_window_bytes")]
    pub cache_window_bytes: usize,
    /// Entries kept before the cache is cleared.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Bytes requested from a streaming source per pull.
    #[serde(default = "default_pull_chunk_bytes")]
    pub pull_chunk_bytes: usize,
}

fn default_choice_cache() -> bool {
    true
}

fn default_cache_window_bytes() -> usize {
    8
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_pull_chunk_bytes() -> usize {
    4096
}

impl Default for CrackerSettings {
    fn default() -> Self {
        Self {
            choice_cache: default_choice_cache(),
            cache_window_bytes: default_cache_window_bytes(),
            cache_capacity: default_cache_capacity(),
            pull_chunk_bytes: default_pull_chunk_bytes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default)]
    pub seed: u64,
}

pub fn default_iterations() -> u64 {
    100
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FathomConfig {
    #[serde(default)]
    pub schema: Option<SchemaSettings>,
    #[serde(default)]
    pub cracker: CrackerSettings,
    #[serde(default)]
    pub mutator: MutatorSettings,
}

impl FathomConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FathomConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[schema]
path = "models/tlv.toml"
model = "Tlv"

[cracker]
choice-cache = false
cache-window-bytes = 16

[mutator]
iterations = 5
seed = 42
"#
        )
        .unwrap();
        let config = FathomConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        let schema = config.schema.expect("schema section");
        assert_eq!(schema.path, PathBuf::from("models/tlv.toml"));
        assert_eq!(schema.model.as_deref(), Some("Tlv"));
        assert!(!config.cracker.choice_cache);
        assert_eq!(config.cracker.cache_window_bytes, 16);
        assert_eq!(config.cracker.cache_capacity, 4096, "unset keys keep their defaults");
        assert_eq!(config.mutator.iterations, 5);
        assert_eq!(config.mutator.seed, 42);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: FathomConfig = toml::from_str("").unwrap();
        assert!(config.schema.is_none());
        assert!(config.cracker.choice_cache);
        assert_eq!(config.cracker.cache_window_bytes, 8);
        assert_eq!(config.mutator.iterations, 100);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let result: Result<FathomConfig, _> = toml::from_str("[cracker]\nwindow = 3\n");
        assert!(result.is_err(), "deny_unknown_fields must reject typos");
    }

    #[test]
    fn test_missing_file_reports_path() {
        let path = PathBuf::from("/nonexistent/fathom.toml");
        let err = FathomConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"), "{err}");
    }
}
