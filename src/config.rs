// Конфигурация клиента звонков.
// Логирование по умолчанию включено только в режиме разработки.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;

/// Переменная окружения с путём к JSON-конфигу
pub const CONFIG_ENV: &str = "CHATCALL_CONFIG";

/// Переменная окружения для фильтра логов
pub const LOG_ENV: &str = "CHATCALL_LOG";

/// Публичные STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Ожидание перед закрытием соединения в состоянии Disconnected (0 = сразу)
    pub disconnect_grace_ms: u64,
    /// Предел очереди кандидатов на одного участника
    pub max_pending_candidates: usize,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ice_candidate_pool_size: 10,
            disconnect_grace_ms: 0,
            max_pending_candidates: 64,
            media: MediaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Запрашивать камеру при старте звонка
    pub video: bool,
    /// Запрашивать микрофон при старте звонка
    pub audio: bool,
    pub camera_available: bool,
    pub microphone_available: bool,
    pub screen_available: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            camera_available: true,
            microphone_available: true,
            screen_available: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// EnvFilter directive, e.g. "chatcall_lib=debug,webrtc=warn"
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            // В продакшене логирование отключено
            enabled: cfg!(debug_assertions),
            filter: "chatcall_lib=debug,webrtc=warn".into(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Конфиг из `CHATCALL_CONFIG` (или дефолтный), фильтр логов из `CHATCALL_LOG`
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(filter) = std::env::var(LOG_ENV) {
            config.logging.enabled = true;
            config.logging.filter = filter;
        }
        Ok(config)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Валидация ICE серверов
    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(CallError::Config("at least one ICE server is required".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::Config(format!(
                    "server {} has an empty URL",
                    server.id
                )));
            }
            if server.r#type != "stun" && server.r#type != "turn" {
                return Err(CallError::Config(format!(
                    "server {} has unknown type {:?}",
                    server.id, server.r#type
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.max_pending_candidates == 0 {
            return Err(CallError::Config(
                "max_pending_candidates must be positive".into(),
            ));
        }
        Ok(())
    }
}
