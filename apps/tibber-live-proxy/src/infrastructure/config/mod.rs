//! Configuration Module
//!
//! Configuration loading for the proxy service.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, DEFAULT_API_URL, DEFAULT_WS_URL, ProxyConfig,
    ServerSettings, SessionSettings, StoreSettings, SupervisorSettings, TibberSettings,
};
