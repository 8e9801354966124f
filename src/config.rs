//! Environment-driven configuration.
//!
//! Recognized variables: `MCP_TRANSPORT` (`http` | `stdio`), `MCP_STDIO` /
//! `USE_STDIO` (presence forces stdio), `MCP_LOG_LEVEL`, `MCP_SERVER_NAME`,
//! `MCP_SERVER_VERSION`, `PORT`.

use std::time::Duration;

use crate::protocol::DEFAULT_SHUTDOWN_DRAIN;

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Stdio,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub transport: TransportKind,
    pub port: u16,
    pub log_level: Option<String>,
    pub rate_limit_rps: Option<f64>,
    pub strict_initialization: bool,
    pub shutdown_drain: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "fluxmcp".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            transport: TransportKind::Http,
            port: DEFAULT_PORT,
            log_level: None,
            rate_limit_rps: None,
            strict_initialization: false,
            shutdown_drain: DEFAULT_SHUTDOWN_DRAIN,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply variables via a lookup function (tests inject maps instead of
    /// mutating the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("MCP_SERVER_NAME") {
            self.name = name;
        }
        if let Some(version) = lookup("MCP_SERVER_VERSION") {
            self.version = version;
        }
        if let Some(level) = lookup("MCP_LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        match lookup("MCP_TRANSPORT").as_deref() {
            Some("stdio") => self.transport = TransportKind::Stdio,
            Some("http") => self.transport = TransportKind::Http,
            _ => {}
        }
        // Presence alone forces stdio, matching container conventions.
        if lookup("MCP_STDIO").is_some() || lookup("USE_STDIO").is_some() {
            self.transport = TransportKind::Stdio;
        }
    }
}

/// Install a `tracing` subscriber appropriate for the transport: stderr
/// output (stdio keeps stdout clean for protocol frames), `MCP_LOG_LEVEL` or
/// `RUST_LOG` filtering.
pub fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level)
            .unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| (*v).to_owned())
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.strict_initialization);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config.apply_env(lookup(&[
            ("MCP_SERVER_NAME", "weather"),
            ("MCP_SERVER_VERSION", "2.1.0"),
            ("PORT", "9001"),
            ("MCP_TRANSPORT", "stdio"),
            ("MCP_LOG_LEVEL", "debug"),
        ]));
        assert_eq!(config.name, "weather");
        assert_eq!(config.version, "2.1.0");
        assert_eq!(config.port, 9001);
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_stdio_presence_flags_win() {
        let mut config = ServerConfig::default();
        config.apply_env(lookup(&[("MCP_TRANSPORT", "http"), ("USE_STDIO", "1")]));
        assert_eq!(config.transport, TransportKind::Stdio);
    }

    #[test]
    fn test_invalid_port_ignored() {
        let mut config = ServerConfig::default();
        config.apply_env(lookup(&[("PORT", "not-a-port")]));
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
