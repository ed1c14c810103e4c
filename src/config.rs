//! Suite configuration file types.
//!
//! `enginetest.yaml` (or `enginetest.toml`) in the working directory sets
//! defaults for a run. Command-line flags override anything set here.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Run defaults loaded from `enginetest.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HarnessConfig {
    /// Schema version (must match crate major version).
    #[serde(default = "default_version")]
    pub version: u32,

    /// Suite root directory (default: `ENGINE_TEST`). Purged at the start of
    /// every run.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Append a `.YYYYmmdd-HHMMSS` suffix to the suite root.
    #[serde(default)]
    pub timestamp: bool,

    /// Keep the fixture directories of passing tests too.
    #[serde(default)]
    pub preserve: bool,

    /// Console verbosity, 0 (quiet) to 3 (every setup and teardown).
    #[serde(default)]
    pub verbose: Option<u8>,

    /// Number of worker processes. 1 runs everything in this process.
    #[serde(default)]
    pub parallel: Option<usize>,

    /// Include tests registered as long.
    #[serde(default)]
    pub long: bool,

    /// Extra engine configuration appended to every connection open,
    /// e.g. `log=(enabled=false)`.
    #[serde(default)]
    pub conn_config: Option<String>,

    /// Seconds before a worker process is killed and its unreported tests
    /// are failed.
    #[serde(default)]
    pub worker_timeout: Option<u64>,
}

fn default_version() -> u32 {
    1
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            dir: None,
            timestamp: false,
            preserve: false,
            verbose: None,
            parallel: None,
            long: false,
            conn_config: None,
            worker_timeout: None,
        }
    }
}

/// Generate the JSON schema for the configuration file.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(HarnessConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: HarnessConfig = serde_yaml::from_str("version: 1\n").unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
version: 1
dir: /tmp/engine-runs
timestamp: true
preserve: true
verbose: 2
parallel: 4
long: true
conn_config: log=(enabled=false)
worker_timeout: 600
"#;
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.dir, Some(PathBuf::from("/tmp/engine-runs")));
        assert!(config.timestamp && config.preserve && config.long);
        assert_eq!(config.verbose, Some(2));
        assert_eq!(config.parallel, Some(4));
        assert_eq!(config.conn_config.as_deref(), Some("log=(enabled=false)"));
        assert_eq!(config.worker_timeout, Some(600));
    }

    #[test]
    fn version_defaults_when_missing() {
        let config: HarnessConfig = toml::from_str("preserve = true").unwrap();
        assert_eq!(config.version, 1);
        assert!(config.preserve);
    }

    #[test]
    fn schema_names_every_field() {
        let schema = serde_json::to_value(generate_schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for field in ["version", "dir", "parallel", "conn_config", "worker_timeout"] {
            assert!(properties.contains_key(field), "missing {field}");
        }
    }
}
