use anyhow::{Context, Result};
use chrono::NaiveTime;
use headcount_attendance::{LatePolicy, ReconcilerConfig};
use headcount_core::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_DISTANCE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration: optional TOML file, then `HEADCOUNT_*` overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum confidence for a positive match.
    pub confidence_threshold: f32,
    /// Distance scale of the enrollment-comparison policy.
    pub max_distance: f32,
    /// Seconds during which a repeat recognition of a student is ignored.
    pub duplicate_window_secs: u64,
    /// First time-in after this local time (`HH:MM` or `HH:MM:SS`) is late.
    pub late_after: Option<String>,
    /// Upper bound on one database call, in milliseconds.
    pub store_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("attendance.db"),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_distance: DEFAULT_MAX_DISTANCE,
            duplicate_window_secs: 300,
            late_after: None,
            store_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Load the config file (if present) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("HEADCOUNT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"));

        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `HEADCOUNT_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HEADCOUNT_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env_parse(&lookup, "HEADCOUNT_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse(&lookup, "HEADCOUNT_MAX_DISTANCE", &mut self.max_distance);
        env_parse(&lookup, "HEADCOUNT_DUPLICATE_WINDOW_SECS", &mut self.duplicate_window_secs);
        env_parse(&lookup, "HEADCOUNT_STORE_TIMEOUT_MS", &mut self.store_timeout_ms);
        if let Some(v) = lookup("HEADCOUNT_LATE_AFTER") {
            self.late_after = if v.is_empty() { None } else { Some(v) };
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_distance.is_finite() && self.max_distance > 0.0) {
            anyhow::bail!("max_distance must be positive, got {}", self.max_distance);
        }
        if !self.confidence_threshold.is_finite() {
            anyhow::bail!("confidence_threshold must be a number");
        }
        if self.store_timeout_ms == 0 {
            anyhow::bail!("store_timeout_ms must be at least 1");
        }
        self.duplicate_window()?;
        self.late_cutoff()?;
        Ok(())
    }

    pub fn late_cutoff(&self) -> Result<Option<NaiveTime>> {
        self.late_after
            .as_deref()
            .map(|s| {
                NaiveTime::parse_from_str(s, "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                    .with_context(|| format!("late_after: expected HH:MM, got {s:?}"))
            })
            .transpose()
    }

    pub fn reconciler(&self) -> Result<ReconcilerConfig> {
        Ok(ReconcilerConfig {
            late: LatePolicy {
                cutoff: self.late_cutoff()?,
            },
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        })
    }

    pub fn duplicate_window(&self) -> Result<chrono::Duration> {
        i64::try_from(self.duplicate_window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| {
                format!(
                    "duplicate_window_secs: {} is out of range",
                    self.duplicate_window_secs
                )
            })
    }
}

fn env_parse<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            Path::new(&home).join(fallback)
        })
        .join("headcount")
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.confidence_threshold, 0.6);
        assert_eq!(config.max_distance, 0.6);
        assert_eq!(config.duplicate_window_secs, 300);
        assert!(config.db_path.ends_with("headcount/attendance.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_file() {
        let config = Config::from_toml(
            r#"
            db_path = "/var/lib/headcount/school.db"
            confidence_threshold = 0.7
            late_after = "08:15"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/headcount/school.db"));
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.max_distance, 0.6);
        assert_eq!(
            config.late_cutoff().unwrap(),
            NaiveTime::from_hms_opt(8, 15, 0)
        );
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(Config::from_toml("threshold = 0.5").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HEADCOUNT_DB_PATH", "/tmp/x.db"),
            ("HEADCOUNT_CONFIDENCE_THRESHOLD", "0.45"),
            ("HEADCOUNT_DUPLICATE_WINDOW_SECS", "not-a-number"),
            ("HEADCOUNT_LATE_AFTER", "07:59:30"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.confidence_threshold, 0.45);
        assert_eq!(config.duplicate_window_secs, 300);
        assert_eq!(config.late_after.as_deref(), Some("07:59:30"));

        let rc = config.reconciler().unwrap();
        assert_eq!(rc.late.cutoff, NaiveTime::from_hms_opt(7, 59, 30));
        assert_eq!(rc.store_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            max_distance: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            late_after: Some("quarter past eight".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unusable_durations() {
        let config = Config {
            store_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        for secs in [u64::MAX, i64::MAX as u64, i64::MAX as u64 / 1000 + 1] {
            let config = Config {
                duplicate_window_secs: secs,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "accepted {secs}");
            assert!(config.duplicate_window().is_err());
        }

        let config = Config {
            duplicate_window_secs: 0,
            store_timeout_ms: 1,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.duplicate_window().unwrap(), chrono::Duration::zero());
    }
}
