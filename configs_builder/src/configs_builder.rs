use crate::{
    env_keys::{
        APP_NAME_ENV_KEY, ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY, LOG_LEVEL_ENV_KEY,
        RABBITMQ_HOST_ENV_KEY, RABBITMQ_PASSWORD_ENV_KEY, RABBITMQ_PORT_ENV_KEY,
        RABBITMQ_USER_ENV_KEY, RABBITMQ_VHOST_ENV_KEY,
    },
    errors::ConfigsError,
};
use configs::{AppConfigs, Configs, DynamicConfigs, Environment};
use dotenvy::from_filename;
use std::{env, str::FromStr};
use tracing::{debug, error};

#[derive(Default)]
pub struct ConfigBuilder {
    rabbitmq: bool,
}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn rabbitmq(mut self) -> Self {
        self.rabbitmq = true;
        self
    }

    pub fn build<T>(&self) -> Result<Configs<T>, ConfigsError>
    where
        T: DynamicConfigs,
    {
        let env = Environment::from_rust_env();
        // a missing file is fine, the process env may already carry everything
        from_filename(env.env_file()).ok();

        let mut cfg = Configs::<T>::default();
        self.fill_app(&mut cfg, env);

        match logging::setup(&cfg.app) {
            Err(_) => Err(ConfigsError::LoggingError {}),
            _ => Ok(()),
        }?;

        for (key, value) in env::vars() {
            self.fill_rabbitmq(&mut cfg, key, value);
        }

        cfg.dynamic.load();
        debug!(env = env.to_string(), app = cfg.app.name, "configs loaded");

        Ok(cfg)
    }
}

impl ConfigBuilder {
    fn fill_app<T>(&self, cfg: &mut Configs<T>, env: Environment)
    where
        T: DynamicConfigs,
    {
        let name = self.fmt_name(&env, env::var(APP_NAME_ENV_KEY).unwrap_or_default());
        let log_level = env::var(LOG_LEVEL_ENV_KEY).unwrap_or("debug".to_owned());
        let enable_external_crates_logging = self.parse_or(
            env::var(ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY).unwrap_or_default(),
            false,
        );

        cfg.app = AppConfigs {
            name,
            env,
            log_level,
            enable_external_crates_logging,
        };
    }

    fn fill_rabbitmq<T>(
        &self,
        cfg: &mut Configs<T>,
        key: impl Into<std::string::String>,
        value: impl Into<std::string::String>,
    ) -> bool
    where
        T: DynamicConfigs,
    {
        match key.into().as_str() {
            RABBITMQ_HOST_ENV_KEY if self.rabbitmq => {
                cfg.rabbitmq.host = self.parse_or(value.into(), "localhost".to_owned());
                true
            }
            RABBITMQ_PORT_ENV_KEY if self.rabbitmq => {
                cfg.rabbitmq.port = self.parse_or(value.into(), 5672);
                true
            }
            RABBITMQ_USER_ENV_KEY if self.rabbitmq => {
                cfg.rabbitmq.user = self.parse_or(value.into(), "guest".to_owned());
                true
            }
            RABBITMQ_PASSWORD_ENV_KEY if self.rabbitmq => {
                cfg.rabbitmq.password = self.parse_or(value.into(), "guest".to_owned());
                true
            }
            RABBITMQ_VHOST_ENV_KEY if self.rabbitmq => {
                cfg.rabbitmq.vhost = self.parse_or(value.into(), "".to_owned());
                true
            }
            _ => false,
        }
    }

    fn parse_or<T>(&self, value: String, default: T) -> T
    where
        T: FromStr,
    {
        if value.is_empty() {
            return default;
        }

        value.parse().unwrap_or_else(|_| {
            error!(value = value, "parse went wrong, using the default value");
            default
        })
    }

    fn fmt_name(&self, env: &Environment, name: String) -> String {
        let env_str = env.to_string();
        if name.starts_with(&env_str) {
            return name;
        }

        format!("{}-{}", env_str, name)
    }
}
