use crate::error::{Error, Result};
use crate::event::EventKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Compatibility layer used to run a Windows server binary on another host.
///
/// # Examples
///
/// ```
/// use astro_supervisor::config::CompatConfig;
/// use std::collections::HashMap;
///
/// let compat = CompatConfig {
///     executable: "wine".to_string(),
///     prefix: Some("winepfx".into()),
///     env: HashMap::new(),
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatConfig {
    /// Wrapper executable, e.g. `wine` or an absolute path to it.
    #[serde(default = "default_compat_executable")]
    pub executable: String,

    /// Prefix directory, exported as `WINEPREFIX`.
    #[serde(default)]
    pub prefix: Option<PathBuf>,

    /// Extra environment for the wrapper.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            executable: default_compat_executable(),
            prefix: None,
            env: HashMap::new(),
        }
    }
}

/// How to launch the dedicated server itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server executable. Run through `compat` when one is configured.
    pub executable: String,

    /// Command-line arguments to pass to the server.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set when launching the server.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory of the server process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Display name used in notifications and status reports.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Player slots, used until the server reports its own maximum.
    #[serde(default = "default_max_players")]
    pub max_players: u32,

    /// Line written to the server's stdin to request a graceful shutdown.
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: String,

    #[serde(default)]
    pub compat: Option<CompatConfig>,
}

/// External update command run before each start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Lifecycle and process-handling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Run the updater before every start.
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Restart automatically after a crash.
    #[serde(default)]
    pub auto_restart: bool,

    /// Consecutive automatic restarts allowed before staying crashed.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Pause between a crash and the automatic restart.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// How long to wait for the server's start line.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// How long to wait for the registration line after the start line.
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,

    /// Grace period between the shutdown instruction and a forced kill.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Per-subscriber event queue length.
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Whether network encryption is disabled for the server.
    #[serde(default = "default_true")]
    pub disable_encryption: bool,

    #[serde(default)]
    pub debug_logging: bool,

    /// Directory for the supervisor's own log files.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    #[serde(default)]
    pub updater: Option<UpdaterConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_update: true,
            auto_restart: false,
            max_restarts: default_max_restarts(),
            restart_delay_secs: default_restart_delay(),
            start_timeout_secs: default_start_timeout(),
            registration_timeout_secs: default_registration_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            event_queue_capacity: default_queue_capacity(),
            disable_encryption: true,
            debug_logging: false,
            log_path: default_log_path(),
            updater: None,
        }
    }
}

impl SupervisorConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// What happens to console lines no pattern recognises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Unmatched lines produce no event.
    #[default]
    Drop,
    /// Unmatched lines become `message` events with an empty payload.
    Message,
}

/// One extra classifier rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub kind: EventKind,
    pub regex: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,

    /// Tried in order before the built-in patterns.
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
}

/// Which log records a channel receives besides whitelisted events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Server events only, no log records
    #[default]
    Server,
    Error,
    Warn,
    Info,
}

impl NotificationLevel {
    /// Most verbose log level forwarded, or `None` for [`NotificationLevel::Server`].
    pub fn max_level(&self) -> Option<tracing::Level> {
        match self {
            NotificationLevel::Server => None,
            NotificationLevel::Error => Some(tracing::Level::ERROR),
            NotificationLevel::Warn => Some(tracing::Level::WARN),
            NotificationLevel::Info => Some(tracing::Level::INFO),
        }
    }

    /// Whether a log record at `level` goes to a channel with this setting.
    pub fn admits(&self, level: tracing::Level) -> bool {
        self.max_level().is_some_and(|max| level <= max)
    }
}

/// An embed colour, written as `"#rrggbb"` in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(pub u32);

impl TryFrom<String> for HexColor {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let digits = value.strip_prefix('#').unwrap_or(&value);
        if digits.len() != 6 {
            return Err(format!("invalid colour '{}', expected #rrggbb", value));
        }
        u32::from_str_radix(digits, 16)
            .map(HexColor)
            .map_err(|_| format!("invalid colour '{}', expected #rrggbb", value))
    }
}

impl From<HexColor> for String {
    fn from(color: HexColor) -> Self {
        format!("#{:06x}", color.0)
    }
}

/// Push message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPriority {
    Min,
    Low,
    Default,
    High,
    Max,
}

impl PushPriority {
    pub fn as_u8(&self) -> u8 {
        match self {
            PushPriority::Min => 1,
            PushPriority::Low => 2,
            PushPriority::Default => 3,
            PushPriority::High => 4,
            PushPriority::Max => 5,
        }
    }
}

/// A notification sink.
///
/// Per-kind `emojis`, `colors` (webhook) and `priorities` (push) replace the
/// built-in style for the kinds they name.
///
/// # JSON
///
/// ```json
/// { "kind": "webhook", "url": "https://discord.com/api/webhooks/...", "colors": { "crash": "#ff0000" } }
/// { "kind": "push", "serverUrl": "https://ntfy.sh", "topic": "my-server", "level": "warn" }
/// { "kind": "none" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// Disables dispatch for this entry.
    None,
    /// Chat webhook receiving an embed message.
    #[serde(alias = "discord")]
    Webhook {
        url: url::Url,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        level: NotificationLevel,
        /// Deliver without pinging anyone.
        #[serde(default)]
        silent: bool,
        #[serde(default)]
        emojis: BTreeMap<EventKind, String>,
        #[serde(default)]
        colors: BTreeMap<EventKind, HexColor>,
    },
    /// Topic-based push service.
    #[serde(alias = "ntfy", rename_all = "camelCase")]
    Push {
        #[serde(default = "default_push_server")]
        server_url: url::Url,
        topic: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        level: NotificationLevel,
        #[serde(default)]
        emojis: BTreeMap<EventKind, String>,
        #[serde(default)]
        priorities: BTreeMap<EventKind, PushPriority>,
    },
}

impl ChannelConfig {
    pub fn level(&self) -> NotificationLevel {
        match self {
            ChannelConfig::None => NotificationLevel::Server,
            ChannelConfig::Webhook { level, .. } | ChannelConfig::Push { level, .. } => *level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    /// Event kinds eligible for notification.
    #[serde(default = "default_whitelist")]
    pub whitelist: BTreeSet<EventKind>,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Retries after the first failed delivery.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base")]
    pub retry_base_millis: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max_millis: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            whitelist: default_whitelist(),
            channels: Vec::new(),
            max_retries: default_max_retries(),
            retry_base_millis: default_retry_base(),
            retry_max_millis: default_retry_max(),
        }
    }
}

/// External status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub url: url::Url,

    /// Heartbeat: publish at least this often even without changes.
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
}

impl StatusConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub check_network: bool,

    /// Adopt a changed public IP instead of warning about it.
    #[serde(default)]
    pub overwrite_public_ip: bool,

    /// Public address the server is expected to be reachable on.
    #[serde(default)]
    pub public_ip: Option<Ipv4Addr>,

    #[serde(default = "default_ip_lookup_url")]
    pub ip_lookup_url: url::Url,

    /// Optional reachability checker, queried with `?url=<ip>:<port>`.
    #[serde(default)]
    pub server_check_url: Option<url::Url>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            check_network: true,
            overwrite_public_ip: false,
            public_ip: None,
            ip_lookup_url: default_ip_lookup_url(),
            server_check_url: None,
            port: default_port(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl NetworkConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Main configuration for the supervisor.
///
/// # JSON Schema
///
/// ```json
/// {
///   "server": {
///     "executable": "AstroneerServer/AstroServer.exe",
///     "args": ["-log"],
///     "name": "My Server",
///     "compat": { "executable": "wine", "prefix": "winepfx" }
///   },
///   "supervisor": { "autoRestart": true },
///   "notifications": {
///     "whitelist": ["start", "crash", "player_join", "player_leave"],
///     "channels": [{ "kind": "push", "topic": "my-server" }]
///   },
///   "status": { "url": "https://status.example.com/push/abc", "intervalSecs": 60 }
/// }
/// ```
///
/// # Examples
///
/// ```
/// use astro_supervisor::config::Config;
///
/// let config = Config::parse_from_str(r#"{ "server": { "executable": "/bin/true" } }"#).unwrap();
/// assert_eq!(config.server.max_players, 8);
/// assert!(config.notifications.channels.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub status: Option<StatusConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON
    /// * The JSON does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        Self::parse_from_str(&content)
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }
}

fn default_true() -> bool {
    true
}

fn default_compat_executable() -> String {
    "wine".to_string()
}

fn default_server_name() -> String {
    "Astroneer Dedicated Server".to_string()
}

fn default_max_players() -> u32 {
    8
}

fn default_shutdown_command() -> String {
    "DSServerShutdown".to_string()
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay() -> u64 {
    5
}

fn default_start_timeout() -> u64 {
    120
}

fn default_registration_timeout() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    256
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs")
}

fn default_whitelist() -> BTreeSet<EventKind> {
    EventKind::ALL.into_iter().collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    500
}

fn default_retry_max() -> u64 {
    10_000
}

fn default_status_interval() -> u64 {
    120
}

fn default_push_server() -> url::Url {
    url::Url::parse("https://ntfy.sh").expect("static URL is valid")
}

fn default_ip_lookup_url() -> url::Url {
    url::Url::parse("https://api.ipify.org").expect("static URL is valid")
}

fn default_port() -> u16 {
    7777
}

fn default_check_interval() -> u64 {
    300
}
