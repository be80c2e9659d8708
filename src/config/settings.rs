use serde::Deserialize;

/// Top-level configuration for both the server and the client.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub log: LogSettings,
}

/// Where the server listens and, optionally, where it keeps persistent topics.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub persistence_path: Option<String>,
}

/// Which server the client connects to and how it identifies itself.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    /// Path segment after `/nt/`; a random `nt4-<uuid>` name when unset.
    pub name: Option<String>,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub client: Option<PartialClientSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub persistence_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5810,
            persistence_path: None,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5810,
            name: None,
            reconnect_delay_ms: 5000,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from the defaults.
    pub fn merge_over(self, default: Settings) -> Settings {
        let server = self.server;
        let client = self.client;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                persistence_path: server
                    .as_ref()
                    .and_then(|s| s.persistence_path.clone())
                    .or(default.server.persistence_path),
            },
            client: ClientSettings {
                host: client
                    .as_ref()
                    .and_then(|c| c.host.clone())
                    .unwrap_or(default.client.host),
                port: client
                    .as_ref()
                    .and_then(|c| c.port)
                    .unwrap_or(default.client.port),
                name: client
                    .as_ref()
                    .and_then(|c| c.name.clone())
                    .or(default.client.name),
                reconnect_delay_ms: client
                    .as_ref()
                    .and_then(|c| c.reconnect_delay_ms)
                    .unwrap_or(default.client.reconnect_delay_ms),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}
