//! Proxy Configuration Settings
//!
//! Configuration types for the live proxy, loaded from environment variables.
//! Every variable is optional; unparseable numbers fall back to the default.

use std::path::PathBuf;
use std::time::Duration;

/// Default GraphQL endpoint.
pub const DEFAULT_API_URL: &str = "https://api.tibber.com/v1-beta/gql";

/// Default subscription endpoint.
pub const DEFAULT_WS_URL: &str = "wss://websocket-api.tibber.com/v1-beta/gql/subscriptions";

/// Provider endpoints and the optional seed token.
#[derive(Clone)]
pub struct TibberSettings {
    /// GraphQL request/response endpoint.
    pub api_url: String,
    /// GraphQL subscription endpoint.
    pub ws_url: String,
    /// Token inserted into the credential store at startup.
    pub api_token: Option<String>,
    /// `User-Agent` sent on every provider request.
    pub user_agent: String,
}

impl Default for TibberSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_token: None,
            user_agent: default_user_agent(),
        }
    }
}

impl std::fmt::Debug for TibberSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TibberSettings")
            .field("api_url", &self.api_url)
            .field("ws_url", &self.ws_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn default_user_agent() -> String {
    format!("tibber-live-proxy/{}", env!("CARGO_PKG_VERSION"))
}

/// Protocol session and restart settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Timeout for the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Timeout waiting for `connection_ack`.
    pub ack_timeout: Duration,
    /// Timeout for provider API requests.
    pub http_timeout: Duration,
    /// Initial restart delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum restart delay.
    pub reconnect_delay_max: Duration,
    /// Restart delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Restarts without a healthy session before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(30),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 5,
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Per-subscriber queue depth before eviction.
    pub subscriber_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: 64,
        }
    }
}

/// Supervisor loop settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How often the credential table is polled for changes.
    pub credential_poll_interval: Duration,
    /// How often the change listener probes the store.
    pub liveness_interval: Duration,
    /// How long shutdown waits for sessions to close.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            credential_poll_interval: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(90),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// How long measurements are kept.
    pub retention: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("tibber-live.db"),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// HTTP port for health, metrics and live-data routes.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8080 }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Provider endpoints.
    pub tibber: TibberSettings,
    /// Session settings.
    pub session: SessionSettings,
    /// Fan-out settings.
    pub broadcast: BroadcastSettings,
    /// Supervisor settings.
    pub supervisor: SupervisorSettings,
    /// Persistence settings.
    pub store: StoreSettings,
    /// Server settings.
    pub server: ServerSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is empty or the subscriber capacity is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is empty or the subscriber capacity is zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let tibber = TibberSettings {
            api_url: env.url("TIBBER_API_URL", defaults.tibber.api_url)?,
            ws_url: env.url("TIBBER_WS_URL", defaults.tibber.ws_url)?,
            api_token: env.string("TIBBER_API_TOKEN").filter(|t| !t.trim().is_empty()),
            user_agent: env
                .string("TIBBER_USER_AGENT")
                .filter(|ua| !ua.is_empty())
                .unwrap_or(defaults.tibber.user_agent),
        };

        let session = SessionSettings {
            connect_timeout: env.secs(
                "PROXY_CONNECT_TIMEOUT_SECS",
                defaults.session.connect_timeout,
            ),
            ack_timeout: env.secs("PROXY_ACK_TIMEOUT_SECS", defaults.session.ack_timeout),
            http_timeout: env.secs("PROXY_HTTP_TIMEOUT_SECS", defaults.session.http_timeout),
            reconnect_delay_initial: env.millis(
                "PROXY_RECONNECT_DELAY_INITIAL_MS",
                defaults.session.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "PROXY_RECONNECT_DELAY_MAX_SECS",
                defaults.session.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "PROXY_RECONNECT_DELAY_MULTIPLIER",
                defaults.session.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse(
                "PROXY_MAX_RECONNECT_ATTEMPTS",
                defaults.session.max_reconnect_attempts,
            ),
        };

        let subscriber_capacity = env.parse(
            "PROXY_SUBSCRIBER_CAPACITY",
            defaults.broadcast.subscriber_capacity,
        );
        if subscriber_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROXY_SUBSCRIBER_CAPACITY",
                reason: "must be greater than zero",
            });
        }

        let supervisor = SupervisorSettings {
            credential_poll_interval: env.secs(
                "PROXY_CREDENTIAL_POLL_SECS",
                defaults.supervisor.credential_poll_interval,
            ),
            liveness_interval: env.secs(
                "PROXY_LIVENESS_INTERVAL_SECS",
                defaults.supervisor.liveness_interval,
            ),
            shutdown_grace: env.secs(
                "PROXY_SHUTDOWN_GRACE_SECS",
                defaults.supervisor.shutdown_grace,
            ),
        };

        let store = StoreSettings {
            database_path: env
                .string("DATABASE_PATH")
                .filter(|p| !p.is_empty())
                .map_or(defaults.store.database_path, PathBuf::from),
            retention: env
                .string("PROXY_RETENTION_HOURS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(defaults.store.retention, |hours| Duration::from_secs(hours * 3600)),
        };

        let server = ServerSettings {
            http_port: env.parse("PROXY_HTTP_PORT", defaults.server.http_port),
        };

        Ok(Self {
            tibber,
            session,
            broadcast: BroadcastSettings { subscriber_capacity },
            supervisor,
            store,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(&'static str),
    /// Environment variable is out of range.
    #[error("environment variable {key} {reason}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn url(&self, key: &'static str, default: String) -> Result<String, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key)),
            Some(v) => Ok(v),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ProxyConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.tibber.api_url, DEFAULT_API_URL);
        assert_eq!(config.tibber.ws_url, DEFAULT_WS_URL);
        assert!(config.tibber.api_token.is_none());
        assert!(config.tibber.user_agent.starts_with("tibber-live-proxy/"));
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.session.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.session.reconnect_delay_initial, Duration::from_millis(1000));
        assert_eq!(config.session.max_reconnect_attempts, 5);
        assert_eq!(config.broadcast.subscriber_capacity, 64);
        assert_eq!(config.supervisor.liveness_interval, Duration::from_secs(90));
        assert_eq!(config.store.retention, Duration::from_secs(86_400));
        assert_eq!(config.store.database_path, PathBuf::from("tibber-live.db"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("TIBBER_WS_URL", "ws://127.0.0.1:9000/subs"),
            ("TIBBER_API_TOKEN", "secret-token"),
            ("PROXY_HTTP_PORT", "9999"),
            ("PROXY_RECONNECT_DELAY_MULTIPLIER", "1.5"),
            ("PROXY_MAX_RECONNECT_ATTEMPTS", "0"),
            ("PROXY_SUBSCRIBER_CAPACITY", "8"),
            ("PROXY_RETENTION_HOURS", "2"),
            ("DATABASE_PATH", "/tmp/live.db"),
        ])
        .unwrap();

        assert_eq!(config.tibber.ws_url, "ws://127.0.0.1:9000/subs");
        assert_eq!(config.tibber.api_token.as_deref(), Some("secret-token"));
        assert_eq!(config.server.http_port, 9999);
        assert!((config.session.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.session.max_reconnect_attempts, 0);
        assert_eq!(config.broadcast.subscriber_capacity, 8);
        assert_eq!(config.store.retention, Duration::from_secs(7200));
        assert_eq!(config.store.database_path, PathBuf::from("/tmp/live.db"));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from(&[
            ("PROXY_HTTP_PORT", "not-a-port"),
            ("PROXY_ACK_TIMEOUT_SECS", "-3"),
        ])
        .unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.session.ack_timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = config_from(&[("PROXY_SUBSCRIBER_CAPACITY", "0")]);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn empty_url_is_rejected() {
        let result = config_from(&[("TIBBER_API_URL", "  ")]);
        assert!(matches!(result, Err(ConfigError::EmptyValue("TIBBER_API_URL"))));
    }

    #[test]
    fn token_is_redacted_in_debug() {
        let config = config_from(&[("TIBBER_API_TOKEN", "secret-token")]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }
}
