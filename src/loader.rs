//! Configuration file loader.
//!
//! Finds and parses the suite configuration file.

use crate::config::HarnessConfig;
use std::path::Path;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum LoadError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse YAML.
    Yaml(serde_yaml::Error),
    /// Failed to parse TOML.
    Toml(toml::de::Error),
    /// The file was written for another major version.
    Version(u32),
    /// Unsupported file extension.
    UnsupportedFormat(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "failed to read file: {e}"),
            LoadError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            LoadError::Toml(e) => write!(f, "invalid TOML: {e}"),
            LoadError::Version(v) => {
                write!(f, "unsupported config version {v} (expected {CONFIG_VERSION})")
            }
            LoadError::UnsupportedFormat(ext) => {
                write!(
                    f,
                    "unsupported file format: {ext} (expected .yaml, .yml, or .toml)"
                )
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Configuration file names, in lookup order.
pub const CONFIG_FILENAMES: [&str; 2] = ["enginetest.yaml", "enginetest.toml"];

/// The configuration version this build understands.
pub const CONFIG_VERSION: u32 = 1;

/// Load a configuration file by path.
pub fn load_config(path: &Path) -> Result<HarnessConfig, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(LoadError::Io)?;

    let config: HarnessConfig = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(LoadError::Yaml)?,
        "toml" => toml::from_str(&contents).map_err(LoadError::Toml)?,
        other => return Err(LoadError::UnsupportedFormat(other.to_string())),
    };
    if config.version != CONFIG_VERSION {
        return Err(LoadError::Version(config.version));
    }
    Ok(config)
}

/// Look for a configuration file in a directory.
///
/// Returns `None` if there is none, `Err` if one exists but is invalid.
pub fn find_config(dir: &Path) -> Result<Option<HarnessConfig>, LoadError> {
    for name in CONFIG_FILENAMES {
        let path = dir.join(name);
        if path.exists() {
            return load_config(&path).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn load_valid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enginetest.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
version: 1
parallel: 3
preserve: true
"#
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.parallel, Some(3));
        assert!(config.preserve);
    }

    #[test]
    fn load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "invalid: [yaml: {").unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn load_valid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enginetest.toml");
        std::fs::write(
            &path,
            r#"
version = 1
conn_config = "log=(enabled=false)"
worker_timeout = 30
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.conn_config.as_deref(), Some("log=(enabled=false)"));
        assert_eq!(config.worker_timeout, Some(30));
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "invalid = [toml").unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(LoadError::Toml(_))));
    }

    #[test]
    fn unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enginetest.ini");
        std::fs::write(&path, "").unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(LoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enginetest.yaml");
        std::fs::write(&path, "version: 2\n").unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(LoadError::Version(2))));
    }

    #[test]
    fn find_config_not_found() {
        let dir = tempdir().unwrap();
        assert!(find_config(dir.path()).unwrap().is_none());
    }

    #[test]
    fn find_config_prefers_yaml() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("enginetest.yaml"), "parallel: 2\n").unwrap();
        std::fs::write(dir.path().join("enginetest.toml"), "parallel = 5\n").unwrap();

        let config = find_config(dir.path()).unwrap().unwrap();
        assert_eq!(config.parallel, Some(2));
    }
}
