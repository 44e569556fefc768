//! Configuration module for the server supervisor.
//!
//! Settings are resolved once at startup and are read-only afterwards.
//! Configuration is JSON with camelCase keys; everything except the server
//! executable has a default.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use astro_supervisor::config::{validate_config, Config};
//!
//! let config = Config::from_file("config.json").unwrap();
//! validate_config(&config).unwrap();
//! println!("Supervising {}", config.server.name);
//! ```
mod parser;
pub mod validator;

pub use parser::{
    ChannelConfig, ClassifierConfig, CompatConfig, Config, HexColor, NetworkConfig,
    NotificationConfig, NotificationLevel, PatternConfig, PushPriority, ServerConfig, StatusConfig,
    SupervisorConfig, UnmatchedPolicy, UpdaterConfig,
};
pub use validator::validate_config;
