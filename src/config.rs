// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::state::GRACE_PERIOD;
use crate::peer::types::{ServerConfig, DEFAULT_ICE_SERVERS};
use crate::utils::signal_ws_url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

pub const DEFAULT_SIGNAL_URL: &str = "ws://localhost:8000";

pub const ENV_SIGNAL_URL: &str = "ROOMCALL_SIGNAL_URL";
pub const ENV_RECONNECT_ATTEMPTS: &str = "ROOMCALL_RECONNECT_ATTEMPTS";
pub const ENV_ICE_SERVERS: &str = "ROOMCALL_ICE_SERVERS";

/// Политика переподключения к сигнальному серверу
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Доля случайного разброса задержки, 0.0..=1.0
    pub randomization_factor: f64,
    /// Пауза перед переподключением, если соединение закрыл сам сервер
    pub server_restart_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 3000,
            max_delay_ms: 10_000,
            randomization_factor: 0.5,
            server_restart_delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }

    pub fn server_restart_delay(&self) -> Duration {
        Duration::from_millis(self.server_restart_delay_ms)
    }
}

/// Настройки звонка
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub signal_url: String,
    pub reconnect: ReconnectConfig,
    pub ice_servers: Vec<ServerConfig>,
    /// Сколько ждём восстановления peer connection после disconnected
    pub peer_grace_period_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signal_url: DEFAULT_SIGNAL_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            peer_grace_period_ms: GRACE_PERIOD.as_millis() as u64,
        }
    }
}

impl CallConfig {
    /// Значения по умолчанию, поверх которых накладываются переменные окружения
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var(ENV_SIGNAL_URL) {
            config.signal_url = url;
        }

        if let Ok(raw) = std::env::var(ENV_RECONNECT_ATTEMPTS) {
            config.reconnect.max_attempts = raw
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    ConfigError::Env(ENV_RECONNECT_ATTEMPTS, e.to_string())
                })?;
        }

        if let Ok(raw) = std::env::var(ENV_ICE_SERVERS) {
            config.ice_servers = serde_json::from_str(&raw)
                .map_err(|e| ConfigError::Env(ENV_ICE_SERVERS, e.to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Env("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Проверка серверов и адреса сигнального сервера
    pub fn validate(&self) -> Result<(), ConfigError> {
        signal_ws_url(&self.signal_url)?;

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyIceUrl);
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::TurnCredentials(server.id.clone()));
            }
        }
        Ok(())
    }

    pub fn peer_grace_period(&self) -> Duration {
        Duration::from_millis(self.peer_grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_relay_client() {
        let config = CallConfig::default();
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay(), Duration::from_secs(3));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(10));
        assert_eq!(config.reconnect.server_restart_delay(), Duration::from_secs(1));
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            CallConfig::from_json(r#"{"signal_url":"https://relay.example.com","reconnect":{"max_attempts":5}}"#)
                .unwrap();
        assert_eq!(config.signal_url, "https://relay.example.com");
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.initial_delay_ms, 3000);
        assert_eq!(config.peer_grace_period(), Duration::from_secs(10));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut config = CallConfig::default();
        config.ice_servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.com:3478".into(),
            username: None,
            credential: None,
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::TurnCredentials("relay".into()))
        );
    }

    #[test]
    fn bad_signal_url_is_rejected() {
        let config = CallConfig {
            signal_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::SignalUrl(..))));
    }
}
