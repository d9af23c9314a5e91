//! Core host functionality: configuration.

mod config;

pub use config::{
    AuthConfig, HostConfig, PluginsConfig, ServerConfig, TokenConfig, LOCAL_CONFIG_FILE,
};
