use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Экспоненциальная задержка с разбросом, зажатая в [initial, max]
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn server_restart_delay(&self) -> Duration {
        self.config.server_restart_delay()
    }

    /// Задержка перед попыткой `attempt` (с нуля)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let min = self.config.initial_delay().as_millis() as f64;
        let max = self.config.max_delay().as_millis() as f64;
        let base = min * 2f64.powi(attempt.min(30) as i32);

        let factor = self.config.randomization_factor.clamp(0.0, 1.0);
        let jittered = if factor > 0.0 {
            let deviation = base * factor * rng.random::<f64>();
            if rng.random_bool(0.5) {
                base - deviation
            } else {
                base + deviation
            }
        } else {
            base
        };

        Duration::from_millis(jittered.clamp(min, max) as u64)
    }
}
