//! Per-instance configuration.

use std::path::PathBuf;

/// Configuration for one server instance.
///
/// The bootstrap builds one of these per instance; nothing in the library
/// reads the environment or command line.
///
/// ```rust
/// use mapcast::ServerConfig;
///
/// let config = ServerConfig::new("control").port(8081);
/// assert_eq!(config.bind_addr(), "0.0.0.0:8081");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Display name, used to tag log output.
    pub name: String,
    /// Host or IP to bind. Default: `0.0.0.0`.
    pub host: String,
    /// Port to bind; `0` picks an ephemeral port. Default: `8080`.
    pub port: u16,
    /// First path segment of image routes. Default: `maps`.
    pub assets_prefix: String,
    /// Directory image routes are served from. Default: `./client/maps`.
    pub assets_dir: PathBuf,
}

impl ServerConfig {
    /// Creates a config with the given display name and default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn assets_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.assets_prefix = prefix.into();
        self
    }

    pub fn assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.assets_dir = dir.into();
        self
    }

    /// The `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mapcast".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            assets_prefix: "maps".to_string(),
            assets_dir: PathBuf::from("./client/maps"),
        }
    }
}
