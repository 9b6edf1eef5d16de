//! Caller-supplied run configuration.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ConfigError;

/// Execution mode of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    #[default]
    #[serde(rename = "one-time", alias = "onetime", alias = "one_time")]
    OneTime,
    #[serde(rename = "watch")]
    Watch,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneTime => write!(f, "one-time"),
            Self::Watch => write!(f, "watch"),
        }
    }
}

/// Items the worker should skip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionFilter {
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regular expressions matched against item titles.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl ExclusionFilter {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.patterns.is_empty()
    }
}

/// Input to `RunSupervisor::start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub stop_limit: Option<u32>,
    #[serde(default)]
    pub exclude: ExclusionFilter,
    /// Defaults to `<runs_dir>/<run_id>`. Never taken from request payloads.
    #[serde(skip)]
    pub output_dir: Option<PathBuf>,
    /// Free-form launch parameters. These override everything else.
    #[serde(default, rename = "config")]
    pub overrides: Map<String, Value>,
}

impl RunConfig {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Reject configurations that cannot start a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "targetUrl".to_string(),
                hint: "A run needs a target to scrape.".to_string(),
            });
        }
        if self.stop_limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "stopLimit".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if let Some(run_id) = self.requested_run_id() {
            validate_run_id(run_id)?;
        }
        for pattern in &self.exclude.patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::InvalidValue {
                    key: "exclude.patterns".to_string(),
                    message: format!("{pattern}: {e}"),
                });
            }
        }
        Ok(())
    }

    /// Caller-supplied run id, if it is usable.
    pub fn requested_run_id(&self) -> Option<&str> {
        self.run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Parameters handed to the worker: defaults, then typed fields, then the
    /// override map. Later layers win key by key.
    pub fn launch_params(&self, default_stop_limit: u32) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("stopLimit".into(), json!(default_stop_limit));

        params.insert("targetUrl".into(), json!(self.target_url.trim()));
        params.insert("mode".into(), json!(self.mode));
        if let Some(limit) = self.stop_limit {
            params.insert("stopLimit".into(), json!(limit));
        }
        if !self.exclude.is_empty() {
            params.insert("excludeKeywords".into(), json!(self.exclude.keywords));
            params.insert("excludePatterns".into(), json!(self.exclude.patterns));
        }

        for (key, value) in &self.overrides {
            params.insert(key.clone(), value.clone());
        }
        params
    }

    /// Stop limit the run ends up with, honouring an override-map value.
    pub fn effective_stop_limit(&self, default_stop_limit: u32) -> u32 {
        self.launch_params(default_stop_limit)
            .get("stopLimit")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(default_stop_limit)
    }
}

/// A run id names one directory directly under the runs root.
pub fn validate_run_id(run_id: &str) -> Result<(), ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "runId".to_string(),
        message: format!("{run_id:?} {message}"),
    };
    if run_id.contains(['/', '\\']) {
        return Err(invalid("must not contain path separators"));
    }
    let mut components = Path::new(run_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid("is not a plain directory name")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_is_rejected() {
        let err = RunConfig::new("  ").validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "targetUrl"));
    }

    #[test]
    fn bad_exclusion_pattern_is_rejected() {
        let mut config = RunConfig::new("https://example.com/list");
        config.exclude.patterns.push("([".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn run_ids_stay_inside_the_runs_root() {
        for id in ["abc", "watch_j1_1700000000000", "2026-02-01 shop"] {
            assert!(validate_run_id(id).is_ok(), "{id}");
        }
        for id in ["..", ".", "../../escaped", "a/b", "a\\b", "/abs", ""] {
            assert!(
                matches!(validate_run_id(id), Err(ConfigError::InvalidValue { ref key, .. }) if key == "runId"),
                "{id}"
            );
        }

        let config = RunConfig::new("https://example.com").with_run_id("../../escaped");
        assert!(config.validate().is_err());
    }

    #[test]
    fn payload_cannot_choose_output_dir() {
        let config: RunConfig = serde_json::from_str(
            r#"{"targetUrl":"https://example.com","outputDir":"/tmp/elsewhere"}"#,
        )
        .unwrap();
        assert_eq!(config.output_dir, None);
    }

    #[test]
    fn defaults_fill_in_stop_limit() {
        let params = RunConfig::new("https://example.com/list").launch_params(50);
        assert_eq!(params["stopLimit"], 50);
        assert_eq!(params["mode"], "one-time");
        assert!(!params.contains_key("excludeKeywords"));
    }

    #[test]
    fn caller_values_win() {
        let mut config = RunConfig::new("https://example.com/list");
        config.stop_limit = Some(5);
        let params = config.launch_params(50);
        assert_eq!(params["stopLimit"], 5);

        config.overrides.insert("stopLimit".into(), json!(9));
        config.overrides.insert("headless".into(), json!(false));
        let params = config.launch_params(50);
        assert_eq!(params["stopLimit"], 9);
        assert_eq!(params["headless"], false);
        assert_eq!(config.effective_stop_limit(50), 9);
    }

    #[test]
    fn parses_api_payload() {
        let config: RunConfig = serde_json::from_str(
            r#"{"runId":"abc","targetUrl":"https://example.com","mode":"watch","config":{"stopLimit":20}}"#,
        )
        .unwrap();
        assert_eq!(config.requested_run_id(), Some("abc"));
        assert_eq!(config.mode, RunMode::Watch);
        assert_eq!(config.effective_stop_limit(50), 20);

        let legacy: RunConfig =
            serde_json::from_str(r#"{"targetUrl":"https://example.com","mode":"onetime"}"#).unwrap();
        assert_eq!(legacy.mode, RunMode::OneTime);
        assert_eq!(legacy.requested_run_id(), None);
    }
}
