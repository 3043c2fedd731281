use std::time::Duration;

use serde::Deserialize;

use crate::connection::Credentials;

/// Top-level configuration settings for the bridge.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub relay: RelaySettings,
    pub executor: ExecutorSettings,
    pub correlation: CorrelationSettings,
    pub logging: LoggingSettings,
}

/// Which relay port to use: the relay exposes one for testing and one for
/// production traffic.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayEnvironment {
    #[default]
    Testing,
    Production,
}

impl RelayEnvironment {
    pub fn port(self) -> u16 {
        match self {
            RelayEnvironment::Testing => 5236,
            RelayEnvironment::Production => 5235,
        }
    }
}

/// Where the relay lives and who we are to it.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub host: String,
    pub environment: RelayEnvironment,
    /// Overrides the environment's port when set.
    pub port: Option<u16>,
    pub domain: String,
    /// Suffix of the login identity, `<sender_id>@<endpoint>`.
    pub endpoint: String,
    /// Direct TLS on the socket. Only turned off against local test relays.
    pub secure: bool,
    pub connect_timeout_ms: u64,
    pub sender_id: String,
    pub server_key: String,
}

impl RelaySettings {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.environment.port())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.sender_id.clone(), self.server_key.clone())
    }
}

/// Sizing of the send worker pool.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CorrelationSettings {
    /// How long a caller waits for the relay's ack or nack.
    pub response_timeout_ms: u64,
    /// How long a send waits for a new session while reconnecting or draining.
    pub reconnect_wait_ms: u64,
}

impl CorrelationSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub relay: Option<PartialRelaySettings>,
    pub executor: Option<PartialExecutorSettings>,
    pub correlation: Option<PartialCorrelationSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRelaySettings {
    pub host: Option<String>,
    pub environment: Option<RelayEnvironment>,
    pub port: Option<u16>,
    pub domain: Option<String>,
    pub endpoint: Option<String>,
    pub secure: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    pub sender_id: Option<String>,
    pub server_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialExecutorSettings {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialCorrelationSettings {
    pub response_timeout_ms: Option<u64>,
    pub reconnect_wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelaySettings {
                host: "fcm-xmpp.googleapis.com".to_string(),
                environment: RelayEnvironment::Testing,
                port: None,
                domain: "googleapis.com".to_string(),
                endpoint: "gcm.googleapis.com".to_string(),
                secure: true,
                connect_timeout_ms: 10_000,
                sender_id: String::new(),
                server_key: String::new(),
            },
            executor: ExecutorSettings {
                workers: 8,
                queue_capacity: 1024,
            },
            correlation: CorrelationSettings {
                response_timeout_ms: 30_000,
                reconnect_wait_ms: 30_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlays the values present in `self` on `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let relay = self.relay.unwrap_or_default();
        let executor = self.executor.unwrap_or_default();
        let correlation = self.correlation.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            relay: RelaySettings {
                host: relay.host.unwrap_or(defaults.relay.host),
                environment: relay.environment.unwrap_or(defaults.relay.environment),
                port: relay.port.or(defaults.relay.port),
                domain: relay.domain.unwrap_or(defaults.relay.domain),
                endpoint: relay.endpoint.unwrap_or(defaults.relay.endpoint),
                secure: relay.secure.unwrap_or(defaults.relay.secure),
                connect_timeout_ms: relay
                    .connect_timeout_ms
                    .unwrap_or(defaults.relay.connect_timeout_ms),
                sender_id: relay.sender_id.unwrap_or(defaults.relay.sender_id),
                server_key: relay.server_key.unwrap_or(defaults.relay.server_key),
            },
            executor: ExecutorSettings {
                workers: executor.workers.unwrap_or(defaults.executor.workers),
                queue_capacity: executor
                    .queue_capacity
                    .unwrap_or(defaults.executor.queue_capacity),
            },
            correlation: CorrelationSettings {
                response_timeout_ms: correlation
                    .response_timeout_ms
                    .unwrap_or(defaults.correlation.response_timeout_ms),
                reconnect_wait_ms: correlation
                    .reconnect_wait_ms
                    .unwrap_or(defaults.correlation.reconnect_wait_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}
