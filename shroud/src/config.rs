//! Application settings.
//!
//! Settings are loaded with Figment from an optional TOML file merged with
//! `SHROUD_`-prefixed environment variables on top of built-in defaults.
//! The defaults cover normal operation against the vendor's production
//! services; a settings file is only needed to point the relay somewhere
//! else (tests do exactly that).

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::policy::{MaskingPolicy, StatusMode};

/// Top-level application settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the vendor's configuration discovery service
    pub client_config_url: String,
    /// URL of the geo service resolving the player's chat affinity
    pub geo_affinity_url: String,
    /// Whether to resolve the player's true chat host through the geo
    /// service when the configuration carries an affinity map
    pub resolve_affinity: bool,
    /// Seconds to wait for the chat client to reconnect after the last
    /// session ends before the whole process shuts down
    pub reconnect_grace_s: u64,
    pub chat: ChatSettings,
    pub tls: TlsSettings,
    pub log: LogSettings,
}

/// Initial masking policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatSettings {
    pub status: StatusMode,
    pub enabled: bool,
    pub connect_lobby_chat: bool,
}

/// TLS material for the client-facing leg and trust settings for the
/// server-facing leg.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Overrides the bundled relay certificate
    pub certificate_file: Option<PathBuf>,
    /// Overrides the bundled relay private key
    pub certificate_key_file: Option<PathBuf>,
    /// Disables certificate verification on the outgoing leg
    pub insecure_upstream: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_config_url: "https://clientconfig.rpg.riotgames.com".to_string(),
            geo_affinity_url: "https://pas.geo.si.riotgames.com/pas/v1/service/chat".to_string(),
            resolve_affinity: true,
            reconnect_grace_s: 30,
            chat: ChatSettings::default(),
            tls: TlsSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            status: StatusMode::Offline,
            enabled: true,
            connect_lobby_chat: true,
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

impl Settings {
    /// Loads settings from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                }
                .into());
            }
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment.merge(Env::prefixed("SHROUD_").split("__"));
        Ok(figment.extract()?)
    }

    /// Initial masking policy derived from the `[chat]` section.
    pub fn initial_policy(&self) -> MaskingPolicy {
        MaskingPolicy {
            enabled: self.chat.enabled,
            connect_lobby_chat: self.chat.connect_lobby_chat,
            status: self.chat.status,
        }
    }
}
