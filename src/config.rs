//! Runtime configuration types.
//!
//! Sources, lowest precedence first: defaults, an optional TOML file,
//! `KILN_*` environment variables, then whatever the CLI overrides.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled; bail-outs are logged as warnings
    On,
    /// JIT enabled where supported, falling back quietly
    #[default]
    Auto,
}

impl std::str::FromStr for JitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "false" => Ok(JitMode::Off),
            "on" | "1" | "true" => Ok(JitMode::On),
            "auto" => Ok(JitMode::Auto),
            other => Err(ConfigError::InvalidValue {
                key: "jit",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Calls a function makes in the interpreter before it is compiled.
    pub jit_threshold: u32,
    pub trace_jit: bool,
    /// Write each compiled function's code and offset map to `dump_dir`.
    pub dump_machine_code: bool,
    /// Defaults to the system temp directory.
    pub dump_dir: Option<PathBuf>,
    /// Append compiled functions to `/tmp/perf-<pid>.map`.
    pub emit_perf_map: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 0,
            trace_jit: false,
            dump_machine_code: false,
            dump_dir: None,
            emit_perf_map: false,
        }
    }
}

impl RuntimeConfig {
    pub fn interpreter_only() -> Self {
        Self {
            jit_mode: JitMode::Off,
            ..Self::default()
        }
    }

    /// Compile every function on its first call and warn on bail-outs.
    pub fn jit_eager() -> Self {
        Self {
            jit_mode: JitMode::On,
            jit_threshold: 0,
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Apply `KILN_JIT`, `KILN_DUMP_JIT` and `KILN_PERF_MAP` from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`apply_env`](Self::apply_env) with an explicit variable lookup.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(mode) = lookup("KILN_JIT") {
            self.jit_mode = mode.parse()?;
        }
        if let Some(dump) = lookup("KILN_DUMP_JIT") {
            match dump.as_str() {
                "" | "0" => self.dump_machine_code = false,
                "1" => self.dump_machine_code = true,
                dir => {
                    self.dump_machine_code = true;
                    self.dump_dir = Some(PathBuf::from(dir));
                }
            }
        }
        if let Some(perf) = lookup("KILN_PERF_MAP") {
            self.emit_perf_map = parse_flag("KILN_PERF_MAP", &perf)?;
        }
        Ok(())
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "on" => Ok(true),
        "" | "0" | "false" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = RuntimeConfig::from_toml_str(
            "jit_mode = \"off\"\nemit_perf_map = true\n",
            Path::new("kiln.toml"),
        )
        .unwrap();
        assert_eq!(config.jit_mode, JitMode::Off);
        assert!(config.emit_perf_map);
        assert!(!config.dump_machine_code);
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        let err = RuntimeConfig::from_toml_str("jit = \"on\"\n", Path::new("kiln.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_env_with(env(&[
                ("KILN_JIT", "on"),
                ("KILN_DUMP_JIT", "/tmp/kiln-dump"),
                ("KILN_PERF_MAP", "1"),
            ]))
            .unwrap();
        assert_eq!(config.jit_mode, JitMode::On);
        assert!(config.dump_machine_code);
        assert_eq!(config.dump_dir, Some(PathBuf::from("/tmp/kiln-dump")));
        assert!(config.emit_perf_map);
    }

    #[test]
    fn test_dump_flag_without_directory() {
        let mut config = RuntimeConfig::default();
        config.apply_env_with(env(&[("KILN_DUMP_JIT", "1")])).unwrap();
        assert!(config.dump_machine_code);
        assert_eq!(config.dump_dir, None);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = RuntimeConfig::default();
        let err = config.apply_env_with(env(&[("KILN_JIT", "sometimes")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "jit", .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        fs::write(&path, "trace_jit = true\njit_threshold = 3\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert!(config.trace_jit);
        assert_eq!(config.jit_threshold, 3);
    }
}
