use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    /// `memory` or `surreal`.
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub redis_url: String,
    pub jwt_secret: String,
    /// `local` delivers in-process only; `redis` bridges emits over pub/sub.
    pub realtime_transport: String,
    pub realtime_channel_prefix: String,
    pub notification_dedupe_window_ms: i64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "chorus")?
            .set_default("surreal_db", "social")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("realtime_transport", "local")?
            .set_default("realtime_channel_prefix", "chorus:realtime")?
            .set_default(
                "notification_dedupe_window_ms",
                chorus_domain::notifications::DEFAULT_DEDUPE_WINDOW_MS,
            )?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_test(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("test")
    }

    pub fn uses_surreal(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("surreal")
    }

    pub fn uses_redis_fanout(&self) -> bool {
        self.realtime_transport.eq_ignore_ascii_case("redis")
    }

    /// Defaults suitable for tests: in-memory storage and local fanout.
    pub fn for_tests() -> Self {
        Self {
            app_env: "test".to_string(),
            port: 0,
            log_level: "warn".to_string(),
            data_backend: "memory".to_string(),
            surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
            surreal_ns: "chorus".to_string(),
            surreal_db: "social_test".to_string(),
            surreal_user: "root".to_string(),
            surreal_pass: "root".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            jwt_secret: "test-secret".to_string(),
            realtime_transport: "local".to_string(),
            realtime_channel_prefix: "chorus:test".to_string(),
            notification_dedupe_window_ms: chorus_domain::notifications::DEFAULT_DEDUPE_WINDOW_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_uses_local_backends() {
        let config = AppConfig::for_tests();
        assert!(config.is_test());
        assert!(!config.uses_surreal());
        assert!(!config.uses_redis_fanout());
        assert_eq!(config.notification_dedupe_window_ms, 86_400_000);
    }
}
