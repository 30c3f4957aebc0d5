//! Command line configuration
//!
//! Flags follow `--name value` or `--name=value`. Anything not given keeps
//! its default.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default server listen port
pub const DEFAULT_PORT: u16 = 8081;

/// Default address the client dials
pub const DEFAULT_SERVER_ADDR: &str = "localhost:8081";

/// Wait between a Shutdown notice and session teardown
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(5);

/// Deadline for graceful shutdown on SIGINT
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of each participant's outbound queue
pub const DEFAULT_PARTICIPANT_QUEUE: usize = 32;

const DEFAULT_SERVER_LOGFILE: &str = "chat-server.log";
const DEFAULT_CLIENT_LOGFILE: &str = "chat-client.log";

/// Where log records go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    File(PathBuf),
}

/// Logging options shared by both binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Enable debug records
    pub debug: bool,
    pub destination: LogDestination,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            destination: LogDestination::Stdout,
        }
    }
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub grace_delay: Duration,
    pub shutdown_timeout: Duration,
    pub participant_queue: usize,
    pub room_queue: usize,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            grace_delay: DEFAULT_GRACE_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            participant_queue: DEFAULT_PARTICIPANT_QUEUE,
            room_queue: crate::manager::DEFAULT_ROOM_QUEUE,
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse `--port`, `--debug`, `--log-dst` and `--logfile-path`
    ///
    /// `args` excludes the program name.
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut log = LogFlags::new(DEFAULT_SERVER_LOGFILE);

        let mut flags = Flags::new(args);
        while let Some(flag) = flags.next_flag()? {
            match flag.as_str() {
                "--port" => {
                    let value = flags.value(&flag)?;
                    config.port = value.parse().map_err(|_| ConfigError::InvalidValue {
                        flag: flag.clone(),
                        value,
                    })?;
                }
                _ => log.apply(&flag, &mut flags)?,
            }
        }

        config.log = log.finish()?;
        Ok(config)
    }

    /// Address the listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse `--server-addr`, `--debug`, `--log-dst` and `--logfile-path`
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut log = LogFlags::new(DEFAULT_CLIENT_LOGFILE);

        let mut flags = Flags::new(args);
        while let Some(flag) = flags.next_flag()? {
            match flag.as_str() {
                "--server-addr" => config.server_addr = flags.value(&flag)?,
                _ => log.apply(&flag, &mut flags)?,
            }
        }

        config.log = log.finish()?;
        Ok(config)
    }

    /// WebSocket URL of the server
    pub fn server_url(&self) -> String {
        format!("ws://{}", self.server_addr)
    }
}

/// Log flags collected before validation
struct LogFlags {
    debug: bool,
    destination: String,
    file_name: String,
}

impl LogFlags {
    fn new(default_file: &str) -> Self {
        Self {
            debug: false,
            destination: "stdout".to_string(),
            file_name: default_file.to_string(),
        }
    }

    fn apply<I>(&mut self, flag: &str, flags: &mut Flags<I>) -> Result<(), ConfigError>
    where
        I: Iterator<Item = String>,
    {
        match flag {
            "--debug" => self.debug = flags.bool_value(flag)?,
            "--log-dst" => self.destination = flags.value(flag)?,
            "--logfile-path" => self.file_name = flags.value(flag)?,
            other => return Err(ConfigError::UnknownFlag(other.to_string())),
        }
        Ok(())
    }

    fn finish(self) -> Result<LogConfig, ConfigError> {
        let destination = match self.destination.as_str() {
            "stdout" => LogDestination::Stdout,
            "file" => LogDestination::File(log_file_path(&self.file_name)?),
            other => {
                return Err(ConfigError::InvalidValue {
                    flag: "--log-dst".to_string(),
                    value: other.to_string(),
                })
            }
        };

        Ok(LogConfig {
            debug: self.debug,
            destination,
        })
    }
}

/// Resolve a bare `*.log` file name inside the temp directory
pub fn log_file_path(file_name: &str) -> Result<PathBuf, ConfigError> {
    if file_name.contains("..") || file_name.contains('/') || !file_name.ends_with(".log") {
        return Err(ConfigError::InvalidLogFile(file_name.to_string()));
    }
    Ok(std::env::temp_dir().join(file_name))
}

/// Minimal flag tokenizer
struct Flags<I: Iterator<Item = String>> {
    args: std::iter::Peekable<I>,
    inline: Option<String>,
}

impl<I: Iterator<Item = String>> Flags<I> {
    fn new<T: IntoIterator<IntoIter = I>>(args: T) -> Self {
        Self {
            args: args.into_iter().peekable(),
            inline: None,
        }
    }

    /// Next flag name; `--name=value` stashes the value
    fn next_flag(&mut self) -> Result<Option<String>, ConfigError> {
        self.inline = None;
        let Some(arg) = self.args.next() else {
            return Ok(None);
        };
        if !arg.starts_with("--") {
            return Err(ConfigError::UnknownFlag(arg));
        }
        match arg.split_once('=') {
            Some((name, value)) => {
                self.inline = Some(value.to_string());
                Ok(Some(name.to_string()))
            }
            None => Ok(Some(arg)),
        }
    }

    fn value(&mut self, flag: &str) -> Result<String, ConfigError> {
        if let Some(value) = self.inline.take() {
            return Ok(value);
        }
        match self.args.next() {
            Some(value) if !value.starts_with("--") => Ok(value),
            _ => Err(ConfigError::MissingValue(flag.to_string())),
        }
    }

    /// Booleans may stand alone or take `=true` / `=false`
    fn bool_value(&mut self, flag: &str) -> Result<bool, ConfigError> {
        match self.inline.take() {
            None => Ok(true),
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                flag: flag.to_string(),
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::from_args(Vec::new()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind_addr(), "127.0.0.1:8081");
        assert_eq!(config.grace_delay, Duration::from_secs(5));
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_server_flags() {
        let config = ServerConfig::from_args(args(&["--port", "9000", "--debug"])).unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.log.debug);

        let config = ServerConfig::from_args(args(&["--port=9001", "--debug=false"])).unwrap();
        assert_eq!(config.port, 9001);
        assert!(!config.log.debug);
    }

    #[test]
    fn test_bad_port() {
        let err = ServerConfig::from_args(args(&["--port", "http"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ServerConfig::from_args(args(&["--port"])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue(_)));
    }

    #[test]
    fn test_unknown_flag() {
        let err = ClientConfig::from_args(args(&["--port", "1"])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFlag(flag) if flag == "--port"));
    }

    #[test]
    fn test_client_flags() {
        let config = ClientConfig::from_args(args(&[
            "--server-addr",
            "chat.local:7000",
            "--log-dst",
            "file",
        ]))
        .unwrap();
        assert_eq!(config.server_url(), "ws://chat.local:7000");
        assert_eq!(
            config.log.destination,
            LogDestination::File(std::env::temp_dir().join("chat-client.log"))
        );
    }

    #[test]
    fn test_log_file_validation() {
        assert!(log_file_path("relay.log").is_ok());
        assert!(log_file_path("../relay.log").is_err());
        assert!(log_file_path("logs/relay.log").is_err());
        assert!(log_file_path("relay.txt").is_err());
    }

    #[test]
    fn test_invalid_log_destination() {
        let err = ServerConfig::from_args(args(&["--log-dst", "syslog"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { value, .. } if value == "syslog"));
    }
}
