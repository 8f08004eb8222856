// Конфигурация звонка
// Значения по умолчанию совпадают с поведением веб-клиента

use crate::error::ConfigError;
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Пауза перед созданием offer, чтобы обе стороны успели инициализироваться
pub const OFFER_DELAY_MS: u64 = 1_000;

/// Период опроса статистики
pub const STATS_INTERVAL_MS: u64 = 2_000;

/// Сколько показывается плашка с собеседником
pub const IDENTITY_NOTICE_MS: u64 = 4_000;

/// Размер ленты отладочных сообщений
pub const LOG_CAPACITY: usize = 20;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub offer_delay_ms: u64,
    pub stats_interval_ms: u64,
    pub identity_notice_ms: u64,
    pub log_capacity: usize,
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            offer_delay_ms: OFFER_DELAY_MS,
            stats_interval_ms: STATS_INTERVAL_MS,
            identity_notice_ms: IDENTITY_NOTICE_MS,
            log_capacity: LOG_CAPACITY,
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CallConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Проверка ICE серверов: пустой URL недопустим, TURN требует логин и пароль
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::EmptyUrl(server.id.clone()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        Ok(())
    }

    pub fn offer_delay(&self) -> Duration {
        Duration::from_millis(self.offer_delay_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn identity_notice(&self) -> Duration {
        Duration::from_millis(self.identity_notice_ms)
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}
