//! Configuration loading.
//!
//! YAML file with per-section defaults; a missing file means defaults all
//! the way down. `${VAR}` and `${VAR:-default}` references are expanded from
//! the environment before parsing, so credentials stay out of the file.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::session::SessionSettings;
use crate::supervisor::TranscoderSettings;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference (missing '}}')")]
    UnclosedVarReference,
}

// ============================================================================
// Config sections
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Config {
    /// Load from `path`. A missing file is not an error: defaults apply.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path.as_ref()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub ffmpeg_path: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_ms: u32,
    pub stop_grace_seconds: u64,
    pub startup_timeout_seconds: u64,
    pub pause_buffer_frames: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let defaults = TranscoderSettings::default();
        Self {
            ffmpeg_path: defaults.ffmpeg_path,
            sample_rate: defaults.sample_rate,
            channels: defaults.channels,
            frame_ms: defaults.frame_ms,
            stop_grace_seconds: defaults.stop_grace.as_secs(),
            startup_timeout_seconds: defaults.startup_timeout.as_secs(),
            pause_buffer_frames: defaults.pause_buffer_frames,
        }
    }
}

impl PlayerConfig {
    pub fn transcoder_settings(&self) -> TranscoderSettings {
        TranscoderSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_ms: self.frame_ms,
            stop_grace: Duration::from_secs(self.stop_grace_seconds),
            startup_timeout: Duration::from_secs(self.startup_timeout_seconds),
            pause_buffer_frames: self.pause_buffer_frames,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_grace_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            idle_grace_seconds: defaults.idle_grace.as_secs(),
            idle_timeout_seconds: defaults.idle_timeout.as_secs(),
            sweep_interval_seconds: defaults.sweep_interval.as_secs(),
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            idle_grace: Duration::from_secs(self.idle_grace_seconds),
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub youtube_api_key: Option<String>,
    pub endpoint: Option<String>,
    pub max_results: u8,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            youtube_api_key: None,
            endpoint: None,
            max_results: 5,
        }
    }
}

// ============================================================================
// Environment expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` references.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ConfigError::UnclosedVarReference);
        };
        let reference = &after[..end];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(default) => out.push_str(default),
                None => return Err(ConfigError::MissingEnvVar(name.to_string())),
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_settings() {
        let config = Config::default();
        assert_eq!(config.player.ffmpeg_path, "ffmpeg");
        assert_eq!(config.player.transcoder_settings().frame_bytes(), 3840);
        assert_eq!(config.session.settings().idle_grace, Duration::from_secs(30));
        assert_eq!(config.search.max_results, 5);
        assert!(config.search.youtube_api_key.is_none());
    }

    #[test]
    fn parses_partial_yaml_with_section_defaults() {
        let yaml = r#"
player:
  ffmpeg_path: /usr/local/bin/ffmpeg
  stop_grace_seconds: 5
session:
  idle_timeout_seconds: 120
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.player.ffmpeg_path, "/usr/local/bin/ffmpeg");
        assert_eq!(config.player.stop_grace_seconds, 5);
        // untouched fields keep their defaults
        assert_eq!(config.player.sample_rate, 48_000);
        assert_eq!(config.session.idle_timeout_seconds, 120);
        assert_eq!(config.session.idle_grace_seconds, 30);
    }

    #[test]
    fn expands_env_vars_with_defaults() {
        // SAFETY: test-local variable name, no concurrent reader depends on it
        unsafe { std::env::set_var("CADENZA_TEST_KEY", "abc123") };
        let expanded =
            expand_env_vars("key: ${CADENZA_TEST_KEY}\nother: ${CADENZA_TEST_UNSET:-fallback}\n")
                .unwrap();
        assert_eq!(expanded, "key: abc123\nother: fallback\n");
    }

    #[test]
    fn missing_env_var_without_default_is_an_error() {
        let err = expand_env_vars("key: ${CADENZA_TEST_DEFINITELY_UNSET}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "CADENZA_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn unclosed_reference_is_an_error() {
        let err = expand_env_vars("key: ${OOPS").unwrap_err();
        assert!(matches!(err, ConfigError::UnclosedVarReference));
    }

    #[test]
    fn empty_default_yields_empty_string() {
        let expanded = expand_env_vars("key: '${CADENZA_TEST_UNSET_2:-}'").unwrap();
        assert_eq!(expanded, "key: ''");
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let config = Config::load("/nonexistent/cadenza-test.yaml").await.unwrap();
        assert_eq!(config.player.ffmpeg_path, "ffmpeg");
    }
}
