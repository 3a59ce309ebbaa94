//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > roomcall.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration, if [`init`] has run.
pub fn get() -> Option<&'static AppConfig> {
    CONFIG.get()
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without touching the global slot.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("media.audio", true)?
        .set_default("media.video", false)?
        .set_default("call.auto_answer", true)?
        .set_default("call.polite_tie_break", true)?
        // Optional config file
        .add_source(config::File::with_name("roomcall").required(false))
        // Environment variables (ROOMCALL_MEDIA__VIDEO, ROOMCALL_CALL__AUTO_ANSWER, etc.)
        .add_source(
            config::Environment::with_prefix("ROOMCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    tracing::debug!(
        audio = app_config.media.audio,
        video = app_config.media.video,
        ice_servers = app_config.ice.servers.len(),
        "Configuration loaded"
    );
    Ok(app_config)
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub media: MediaConfig,
    #[serde(default)]
    pub ice: IceConfig,
    pub call: CallConfig,
}

/// Local capture defaults for new calls.
#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    pub audio: bool,
    /// Calls start audio-only unless enabled.
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    #[serde(default = "IceServerConfig::defaults")]
    pub servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: IceServerConfig::defaults(),
        }
    }
}

/// ICE server configuration (STUN/TURN) handed to the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    /// Add TURN servers for peers behind symmetric NAT.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun1.l.google.com:19302".into()],
                username: None,
                credential: None,
            },
        ]
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// Answer inbound offers without waiting for the user.
    pub auto_answer: bool,
    /// Resolve simultaneous offers by identity order instead of dropping the remote one.
    pub polite_tie_break: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            auto_answer: true,
            polite_tie_break: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_uses_defaults() {
        let cfg = load().expect("defaults should deserialize");
        assert!(cfg.media.audio);
        assert_eq!(cfg.ice.servers, IceServerConfig::defaults());
    }

    #[test]
    fn test_ice_servers_from_toml() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [media]
                audio = true
                video = true

                [call]
                auto_answer = false
                polite_tie_break = true

                [[ice.servers]]
                urls = ["turn:turn.example.com:3478"]
                username = "user"
                credential = "secret"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .and_then(|c| c.try_deserialize())
            .expect("toml config should deserialize");

        assert!(cfg.media.video);
        assert!(!cfg.call.auto_answer);
        assert_eq!(cfg.ice.servers.len(), 1);
        assert_eq!(cfg.ice.servers[0].username.as_deref(), Some("user"));
    }

    #[test]
    fn test_default_matches_loaded_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.call.auto_answer);
        assert!(cfg.call.polite_tie_break);
        assert!(!cfg.media.video);
    }

    #[test]
    fn test_init_populates_global() {
        let cfg = init().expect("init should succeed with defaults");
        assert!(std::ptr::eq(cfg, get().unwrap()));
    }
}
