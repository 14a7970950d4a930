//! Process configuration, resolved once at startup from environment variables.
//!
//! | Env Var                   | Default          |
//! |---------------------------|------------------|
//! | `BIND_ADDR`               | `0.0.0.0:8080`   |
//! | `WORKER_COUNT`            | `2`              |
//! | `POLL_INTERVAL_MS`        | `500`            |
//! | `STATUS_POLL_INTERVAL_MS` | `2000`           |
//! | `VISIBILITY_TIMEOUT_SECS` | `120`            |
//! | `MAX_RECEIVE_COUNT`       | `3`              |
//! | `RETRY_BASE_DELAY_MS`     | `1000`           |
//! | `RETRY_MAX_DELAY_MS`      | `60000`          |
//! | `BACKEND`                 | `simulated`      |
//! | `SOLVER_COMMAND`          | required for `process` |
//! | `ENHANCER_COMMAND`        | unset            |
//! | `ENHANCER_ENABLED`        | `true`           |
//! | `DATABASE_URL`            | unset (in-memory job store) |
//! | `ARTIFACT_DIR`            | unset (in-memory artifacts) |
//! | `DATASET_DIR`             | unset (synthetic datasets)  |
//! | `LOG_FORMAT`              | `json`           |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use timetable_observability::{LogFormat, UnknownLogFormat};

use crate::adapters::ProcessCommand;
use crate::jobs::{DEV_POLL_INTERVAL, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("{var} must be set when {because}")]
    Missing {
        var: &'static str,
        because: &'static str,
    },
}

/// Which solver/enhancer implementation the workers use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Deterministic in-process engines.
    Simulated,
    /// External executables speaking JSON on stdin/stdout.
    Process {
        solver: ProcessCommand,
        enhancer: Option<ProcessCommand>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub worker_count: usize,
    pub poll_interval: Duration,
    /// Period of the status poller behind event streams.
    pub status_poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub retry_policy: RetryPolicy,
    pub backend: Backend,
    pub enhancer_enabled: bool,
    pub database_url: Option<String>,
    pub artifact_dir: Option<PathBuf>,
    pub dataset_dir: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr: SocketAddr = parse_or(
            &get,
            "BIND_ADDR",
            Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
        )?;
        let worker_count: usize = parse_or(&get, "WORKER_COUNT", Some(2))?;
        if worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "must be at least 1"));
        }
        let poll_interval = Duration::from_millis(parse_or(&get, "POLL_INTERVAL_MS", Some(500))?);
        let status_poll_interval = Duration::from_millis(parse_or(
            &get,
            "STATUS_POLL_INTERVAL_MS",
            Some(DEV_POLL_INTERVAL.as_millis() as u64),
        )?);
        if status_poll_interval.is_zero() {
            return Err(invalid("STATUS_POLL_INTERVAL_MS", "must be > 0"));
        }
        let visibility_secs: u64 = parse_or(&get, "VISIBILITY_TIMEOUT_SECS", Some(120))?;
        if visibility_secs == 0 {
            return Err(invalid("VISIBILITY_TIMEOUT_SECS", "must be > 0"));
        }
        let max_receive_count: u32 = parse_or(&get, "MAX_RECEIVE_COUNT", Some(3))?;
        if max_receive_count == 0 {
            return Err(invalid("MAX_RECEIVE_COUNT", "must be at least 1"));
        }

        let base_ms: u64 = parse_or(&get, "RETRY_BASE_DELAY_MS", Some(1_000))?;
        let max_ms: u64 = parse_or(&get, "RETRY_MAX_DELAY_MS", Some(60_000))?;
        if max_ms < base_ms {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                "must not be lower than RETRY_BASE_DELAY_MS",
            ));
        }
        let retry_policy =
            RetryPolicy::exponential(Duration::from_millis(base_ms), Duration::from_millis(max_ms));

        let enhancer_enabled = match get("ENHANCER_ENABLED") {
            None => true,
            Some(raw) => parse_bool(&raw).ok_or_else(|| invalid("ENHANCER_ENABLED", raw))?,
        };

        let backend = match get("BACKEND").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("simulated") => Backend::Simulated,
            Some("process") => {
                let solver = get("SOLVER_COMMAND")
                    .and_then(|raw| ProcessCommand::parse(&raw))
                    .ok_or(ConfigError::Missing {
                        var: "SOLVER_COMMAND",
                        because: "BACKEND=process",
                    })?;
                let enhancer = get("ENHANCER_COMMAND").and_then(|raw| ProcessCommand::parse(&raw));
                Backend::Process { solver, enhancer }
            }
            Some(other) => {
                return Err(invalid(
                    "BACKEND",
                    format!("'{other}' (expected simulated or process)"),
                ));
            }
        };

        let log_format = match get("LOG_FORMAT") {
            None => LogFormat::default(),
            Some(raw) => raw
                .parse()
                .map_err(|e: UnknownLogFormat| invalid("LOG_FORMAT", e.to_string()))?,
        };

        Ok(Self {
            bind_addr,
            worker_count,
            poll_interval,
            status_poll_interval,
            visibility_timeout: Duration::from_secs(visibility_secs),
            max_receive_count,
            retry_policy,
            backend,
            enhancer_enabled,
            database_url: get("DATABASE_URL"),
            artifact_dir: get("ARTIFACT_DIR").map(PathBuf::from),
            dataset_dir: get("DATASET_DIR").map(PathBuf::from),
            log_format,
        })
    }
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(var, format!("'{raw}': {e}"))),
        None => default.ok_or(ConfigError::Missing {
            var,
            because: "no default applies",
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.visibility_timeout, Duration::from_secs(120));
        assert_eq!(cfg.status_poll_interval, DEV_POLL_INTERVAL);
        assert_eq!(cfg.max_receive_count, 3);
        assert_eq!(cfg.backend, Backend::Simulated);
        assert!(cfg.enhancer_enabled);
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn process_backend_requires_solver_command() {
        assert_eq!(
            config(&[("BACKEND", "process")]),
            Err(ConfigError::Missing {
                var: "SOLVER_COMMAND",
                because: "BACKEND=process",
            })
        );

        let cfg = config(&[
            ("BACKEND", "Process"),
            ("SOLVER_COMMAND", "python3 solve.py --quiet"),
            ("ENHANCER_COMMAND", "  "),
        ])
        .unwrap();
        let Backend::Process { solver, enhancer } = cfg.backend else {
            panic!("expected process backend");
        };
        assert_eq!(solver.to_string(), "python3 solve.py --quiet");
        assert!(enhancer.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("WORKER_COUNT", "zero")]),
            Err(ConfigError::Invalid { var: "WORKER_COUNT", .. })
        ));
        assert!(matches!(
            config(&[("WORKER_COUNT", "0")]),
            Err(ConfigError::Invalid { var: "WORKER_COUNT", .. })
        ));
        assert!(matches!(
            config(&[("BACKEND", "gpu")]),
            Err(ConfigError::Invalid { var: "BACKEND", .. })
        ));
        assert!(matches!(
            config(&[("RETRY_BASE_DELAY_MS", "5000"), ("RETRY_MAX_DELAY_MS", "10")]),
            Err(ConfigError::Invalid { var: "RETRY_MAX_DELAY_MS", .. })
        ));
        assert!(matches!(
            config(&[("LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { var: "LOG_FORMAT", .. })
        ));
    }

    #[test]
    fn optional_paths_and_flags() {
        let cfg = config(&[
            ("ENHANCER_ENABLED", "off"),
            ("ARTIFACT_DIR", "/var/lib/timetable/artifacts"),
            ("DATABASE_URL", "postgres://localhost/timetable"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();
        assert!(!cfg.enhancer_enabled);
        assert_eq!(cfg.artifact_dir, Some(PathBuf::from("/var/lib/timetable/artifacts")));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/timetable"));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }
}
