use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::DEFAULT_BASE_URL;
use crate::engine::{DEFAULT_TIME_FORMAT, EngineSettings};

const CONFIG_FILE_NAME: &str = ".huddle.json";
const DEFAULT_REFRESH_SECS: u64 = 60;
const DEFAULT_MARK_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mark_interval_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub path: PathBuf,
    pub token: Option<String>,
    pub api_base_url: String,
    pub time_format: String,
    pub refresh_interval: Duration,
    pub mark_interval: Duration,
}

impl Config {
    /// Environment over file over defaults. `path` overrides both the
    /// `HUDDLE_CONFIG` variable and `~/.huddle.json`.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| env::var(key).ok())
    }

    pub fn load_with(
        path: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let path = path
            .or_else(|| var("HUDDLE_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| default_path(var("HOME")));
        let file = read_file(&path)?;

        let token = var("HUDDLE_TOKEN").or(file.token.filter(|token| !token.trim().is_empty()));
        let api_base_url = var("HUDDLE_API_BASE_URL")
            .or(file.api_base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let time_format = var("HUDDLE_TIME_FORMAT")
            .or(file.time_format)
            .unwrap_or_else(|| DEFAULT_TIME_FORMAT.to_string());
        let refresh_interval = interval(
            "refreshIntervalSecs",
            file.refresh_interval_secs.unwrap_or(DEFAULT_REFRESH_SECS),
        )?;
        let mark_interval = interval(
            "markIntervalSecs",
            file.mark_interval_secs.unwrap_or(DEFAULT_MARK_SECS),
        )?;

        tracing::debug!(path = %path.display(), has_token = token.is_some(), "configuration loaded");
        Ok(Self {
            path,
            token,
            api_base_url,
            time_format,
            refresh_interval,
            mark_interval,
        })
    }

    pub fn store_token(&mut self, token: &str) -> Result<(), ConfigError> {
        let mut file = read_file(&self.path)?;
        file.token = Some(token.to_string());

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let payload = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, payload)?;
        set_permissions(&self.path, 0o600)?;
        self.token = Some(token.to_string());
        Ok(())
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            refresh_interval: self.refresh_interval,
            mark_interval: self.mark_interval,
            time_format: self.time_format.clone(),
            ..EngineSettings::default()
        }
    }
}

fn default_path(home: Option<String>) -> PathBuf {
    home.map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(err) => return Err(ConfigError::Io(err)),
    };
    Ok(serde_json::from_str(&contents)?)
}

fn interval(field: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn ensure_dir(path: &Path) -> Result<(), io::Error> {
    if path.exists() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    set_permissions(path, 0o700)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_with(None, env(&[("HOME", dir.path().to_str().expect("utf8"))]))
            .expect("config");

        assert_eq!(config.path, dir.path().join(".huddle.json"));
        assert_eq!(config.token, None);
        assert_eq!(config.api_base_url, "https://slack.com/api");
        assert_eq!(config.time_format, "%b %d %H:%M:%S");
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.mark_interval, Duration::from_secs(5));
    }

    #[test]
    fn env_wins_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huddle.json");
        fs::write(
            &path,
            r#"{"token": "xoxp-file", "timeFormat": "%H:%M", "refreshIntervalSecs": 20}"#,
        )
        .expect("write config");

        let config = Config::load_with(
            Some(path.clone()),
            env(&[
                ("HUDDLE_TOKEN", "xoxp-env"),
                ("HUDDLE_API_BASE_URL", "http://localhost:9000/api/"),
                ("HUDDLE_TIME_FORMAT", "  "),
            ]),
        )
        .expect("config");

        assert_eq!(config.token.as_deref(), Some("xoxp-env"));
        assert_eq!(config.api_base_url, "http://localhost:9000/api");
        assert_eq!(config.time_format, "%H:%M");
        assert_eq!(config.settings().refresh_interval, Duration::from_secs(20));
        assert_eq!(config.settings().init_timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_variable_selects_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("other.json");
        fs::write(&path, r#"{"token": "xoxp-other"}"#).expect("write config");

        let config = Config::load_with(
            None,
            env(&[("HUDDLE_CONFIG", path.to_str().expect("utf8"))]),
        )
        .expect("config");
        assert_eq!(config.path, path);
        assert_eq!(config.token.as_deref(), Some("xoxp-other"));
    }

    #[test]
    fn invalid_file_contents_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huddle.json");

        fs::write(&path, "{ not json").expect("write config");
        assert!(matches!(
            Config::load_with(Some(path.clone()), env(&[])),
            Err(ConfigError::Json(_))
        ));

        fs::write(&path, r#"{"markIntervalSecs": 0}"#).expect("write config");
        assert!(matches!(
            Config::load_with(Some(path), env(&[])),
            Err(ConfigError::Invalid { field: "markIntervalSecs", .. })
        ));
    }

    #[test]
    fn store_token_keeps_other_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("huddle.json");
        let mut config = Config::load_with(Some(path.clone()), env(&[])).expect("config");

        config.store_token("xoxp-first").expect("store");
        let mut file = read_file(&path).expect("read back");
        file.time_format = Some("%H:%M".to_string());
        fs::write(&path, serde_json::to_string(&file).expect("json")).expect("write");

        config.store_token("xoxp-second").expect("store again");
        let reloaded = Config::load_with(Some(path.clone()), env(&[])).expect("reload");
        assert_eq!(reloaded.token.as_deref(), Some("xoxp-second"));
        assert_eq!(reloaded.time_format, "%H:%M");
        assert_eq!(config.token.as_deref(), Some("xoxp-second"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let dir_mode = fs::metadata(path.parent().expect("parent"))
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }
}
