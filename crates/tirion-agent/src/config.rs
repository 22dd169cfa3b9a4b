// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tirion::agent::{AgentConfig, Limits};
use tirion::errors::ConfigError;
use tirion::metric::{self, MetricDefinition};
use tirion::process::Target;
use tirion::sink::SinkConfig;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Agent settings read from `TIRION_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Program to execute and monitor
    pub exec: Option<String>,
    /// Space separated arguments of the program
    pub exec_arguments: Vec<String>,
    /// PID of an already running program to monitor
    pub pid: Option<i32>,
    /// Inline metric definitions, `name,type;name,type`
    pub metrics: Option<String>,
    /// JSON file with metric definitions
    pub metrics_file: Option<PathBuf>,
    /// Run name, defaults to the program
    pub name: Option<String>,
    pub sub_name: String,
    pub interval_ms: u64,
    pub send_interval_secs: u64,
    /// Run server address, metrics go to stdout as CSV without one
    pub server: Option<String>,
    /// Unix socket the instrumented program connects to
    pub socket: Option<PathBuf>,
    pub limit_memory_mb: Option<u64>,
    pub limit_memory_interval_ms: u64,
    pub limit_time_secs: Option<u64>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exec: None,
            exec_arguments: Vec::new(),
            pid: None,
            metrics: None,
            metrics_file: None,
            name: None,
            sub_name: String::new(),
            interval_ms: 250,
            send_interval_secs: 5,
            server: None,
            socket: None,
            limit_memory_mb: None,
            limit_memory_interval_ms: 5,
            limit_time_secs: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            exec: string_var("TIRION_EXEC"),
            exec_arguments: string_var("TIRION_EXEC_ARGUMENTS")
                .map(|args| split_arguments(&args))
                .unwrap_or_default(),
            pid: parse_var("TIRION_PID")?,
            metrics: string_var("TIRION_METRICS"),
            metrics_file: string_var("TIRION_METRICS_FILE").map(PathBuf::from),
            name: string_var("TIRION_NAME"),
            sub_name: string_var("TIRION_SUB_NAME").unwrap_or_default(),
            interval_ms: parse_var("TIRION_INTERVAL_MS")?.unwrap_or(defaults.interval_ms),
            send_interval_secs: parse_var("TIRION_SEND_INTERVAL_SECS")?
                .unwrap_or(defaults.send_interval_secs),
            server: string_var("TIRION_SERVER"),
            socket: string_var("TIRION_SOCKET").map(PathBuf::from),
            // zero disables a limit
            limit_memory_mb: parse_var("TIRION_LIMIT_MEMORY_MB")?.filter(|mb| *mb > 0),
            limit_memory_interval_ms: parse_var("TIRION_LIMIT_MEMORY_INTERVAL_MS")?
                .unwrap_or(defaults.limit_memory_interval_ms),
            limit_time_secs: parse_var("TIRION_LIMIT_TIME_SECS")?.filter(|secs| *secs > 0),
            log_level: log_level_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.exec, self.pid) {
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "Either TIRION_EXEC or TIRION_PID must be set".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "TIRION_EXEC and TIRION_PID cannot be used together".to_string(),
                ))
            }
            _ => {}
        }

        if self.metrics.is_none() && self.metrics_file.is_none() {
            return Err(ConfigError::Invalid(
                "Either TIRION_METRICS or TIRION_METRICS_FILE must be set".to_string(),
            ));
        }

        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "TIRION_INTERVAL_MS must be a positive number".to_string(),
            ));
        }
        if self.send_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "TIRION_SEND_INTERVAL_SECS must be a positive number".to_string(),
            ));
        }
        if self.limit_memory_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "TIRION_LIMIT_MEMORY_INTERVAL_MS must be a positive number".to_string(),
            ));
        }

        if self.exec.is_none() {
            if self.limit_time_secs.is_some() {
                return Err(ConfigError::Invalid(
                    "TIRION_LIMIT_TIME_SECS only works in combination with TIRION_EXEC"
                        .to_string(),
                ));
            }
            if self.limit_memory_mb.is_some() {
                return Err(ConfigError::Invalid(
                    "TIRION_LIMIT_MEMORY_MB only works in combination with TIRION_EXEC"
                        .to_string(),
                ));
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Inline definitions win over the metrics file.
    pub fn metric_definitions(&self) -> Result<Vec<MetricDefinition>, ConfigError> {
        match (&self.metrics, &self.metrics_file) {
            (Some(raw), _) => metric::parse_definitions(raw),
            (None, Some(path)) => metric::load_definitions(path),
            (None, None) => Ok(Vec::new()),
        }
    }

    pub fn agent_config(&self) -> Result<AgentConfig, ConfigError> {
        let target = match (&self.exec, self.pid) {
            (Some(program), _) => Target::Spawn {
                program: program.clone(),
                args: self.exec_arguments.clone(),
            },
            (None, Some(pid)) => Target::Attach { pid },
            (None, None) => {
                return Err(ConfigError::Invalid("No program to monitor".to_string()))
            }
        };

        let mut config = AgentConfig::new(target, self.metric_definitions()?);
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        config.sub_name = self.sub_name.clone();
        config.interval = Duration::from_millis(self.interval_ms);
        config.send_interval = Duration::from_secs(self.send_interval_secs);
        config.sink = SinkConfig::from_server(self.server.as_deref());
        config.socket = self.socket.clone();
        config.limits = Limits {
            time: self.limit_time_secs.map(Duration::from_secs),
            memory_mb: self.limit_memory_mb,
            memory_interval: Duration::from_millis(self.limit_memory_interval_ms),
        };

        config.validate()?;
        Ok(config)
    }
}

/// `TIRION_LOG_LEVEL`, raised to `debug` by `TIRION_VERBOSE=true`.
pub fn log_level_from_env() -> String {
    let verbose = env::var("TIRION_VERBOSE")
        .map(|val| val.to_lowercase() == "true")
        .unwrap_or(false);
    if verbose {
        return "debug".to_string();
    }

    env::var("TIRION_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string())
}

fn split_arguments(args: &str) -> Vec<String> {
    args.split(' ')
        .filter(|arg| !arg.is_empty())
        .map(str::to_string)
        .collect()
}

fn string_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.trim().is_empty())
}

fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    string_var(key)
        .map(|val| {
            val.trim().parse::<T>().map_err(|e| {
                ConfigError::Invalid(format!("{key} has an invalid value '{val}': {e}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const VARS: [&str; 16] = [
        "TIRION_EXEC",
        "TIRION_EXEC_ARGUMENTS",
        "TIRION_PID",
        "TIRION_METRICS",
        "TIRION_METRICS_FILE",
        "TIRION_NAME",
        "TIRION_SUB_NAME",
        "TIRION_INTERVAL_MS",
        "TIRION_SEND_INTERVAL_SECS",
        "TIRION_SERVER",
        "TIRION_SOCKET",
        "TIRION_LIMIT_MEMORY_MB",
        "TIRION_LIMIT_MEMORY_INTERVAL_MS",
        "TIRION_LIMIT_TIME_SECS",
        "TIRION_LOG_LEVEL",
        "TIRION_VERBOSE",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    fn exec_config() -> Config {
        Config {
            exec: Some("/bin/sleep".to_string()),
            metrics: Some("a,int".to_string()),
            ..Default::default()
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("TIRION_EXEC", "/usr/bin/app");
        env::set_var("TIRION_EXEC_ARGUMENTS", "--port  8080");
        env::set_var("TIRION_METRICS", "proc.stat.utime,int;requests,float");
        env::set_var("TIRION_INTERVAL_MS", "100");
        env::set_var("TIRION_SOCKET", "/tmp/tirion.sock");
        env::set_var("TIRION_LIMIT_MEMORY_MB", "0");
        env::set_var("TIRION_LIMIT_TIME_SECS", "30");

        let config = Config::from_env().unwrap();
        assert_eq!(config.exec.as_deref(), Some("/usr/bin/app"));
        assert_eq!(config.exec_arguments, vec!["--port", "8080"]);
        assert_eq!(config.interval_ms, 100);
        assert_eq!(config.send_interval_secs, 5);
        assert_eq!(config.limit_memory_mb, None);
        assert_eq!(config.limit_time_secs, Some(30));

        let agent = config.agent_config().unwrap();
        assert_eq!(agent.name, "/usr/bin/app");
        assert_eq!(agent.interval, Duration::from_millis(100));
        assert_eq!(agent.metrics.len(), 2);
        assert_eq!(agent.sink, SinkConfig::Csv);
        assert_eq!(agent.limits.time, Some(Duration::from_secs(30)));
        assert_eq!(agent.socket, Some(PathBuf::from("/tmp/tirion.sock")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_invalid_number() {
        clear_env();
        env::set_var("TIRION_PID", "abc");
        env::set_var("TIRION_METRICS", "a,int");

        let error = Config::from_env().unwrap_err();
        assert!(error.to_string().contains("TIRION_PID"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_requires_target() {
        clear_env();
        env::set_var("TIRION_METRICS", "a,int");
        assert_eq!(
            Config::from_env().unwrap_err().to_string(),
            "Invalid configuration: Either TIRION_EXEC or TIRION_PID must be set"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_verbose_raises_log_level() {
        clear_env();
        env::set_var("TIRION_LOG_LEVEL", "WARN");
        assert_eq!(log_level_from_env(), "warn");
        env::set_var("TIRION_VERBOSE", "true");
        assert_eq!(log_level_from_env(), "debug");
        clear_env();
    }

    #[test]
    fn test_validate() {
        assert!(exec_config().validate().is_ok());

        let attach = Config {
            exec: None,
            pid: Some(42),
            limit_time_secs: Some(1),
            ..exec_config()
        };
        assert!(attach.validate().is_err());

        let both = Config {
            pid: Some(42),
            ..exec_config()
        };
        assert!(both.validate().is_err());

        let no_metrics = Config {
            metrics: None,
            ..exec_config()
        };
        assert!(no_metrics.validate().is_err());

        let zero_interval = Config {
            interval_ms: 0,
            ..exec_config()
        };
        assert!(zero_interval.validate().is_err());

        let bad_level = Config {
            log_level: "loud".to_string(),
            ..exec_config()
        };
        assert!(bad_level.validate().is_err());
    }

    #[test]
    fn test_metrics_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"Name": "requests", "Type": "int"}, {"Name": "proc.io.rchar", "Type": "int"}]"#,
        )
        .unwrap();
        let config = Config {
            metrics: None,
            metrics_file: Some(file.path().to_path_buf()),
            ..exec_config()
        };

        let definitions = config.metric_definitions().unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0], MetricDefinition::new("requests", "int"));
    }

    #[test]
    fn test_server_selects_remote_sink() {
        let config = Config {
            server: Some("localhost:8000".to_string()),
            name: Some("bench".to_string()),
            ..exec_config()
        };
        let agent = config.agent_config().unwrap();
        assert_eq!(agent.name, "bench");
        assert_eq!(
            agent.sink,
            SinkConfig::Remote {
                server: "localhost:8000".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_metric_definition() {
        let config = Config {
            metrics: Some("a,int;broken".to_string()),
            ..exec_config()
        };
        assert!(matches!(
            config.agent_config(),
            Err(ConfigError::MetricsDefinition(_))
        ));
    }
}
