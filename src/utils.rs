use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use rand::Rng;
use url::Url;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Адрес сигнального сервера всегда websocket: http(s) переписываем в ws(s)
pub fn signal_ws_url(raw: &str) -> Result<String, ConfigError> {
    let mut url =
        Url::parse(raw).map_err(|e| ConfigError::SignalUrl(raw.to_string(), e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url.to_string()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ConfigError::SignalUrl(
                raw.to_string(),
                format!("unsupported scheme {other}"),
            ))
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| ConfigError::SignalUrl(raw.to_string(), "cannot rewrite scheme".into()))?;
    Ok(url.to_string())
}
