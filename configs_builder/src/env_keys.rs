pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const LOG_LEVEL_ENV_KEY: &str = "LOG_LEVEL";
pub const ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY: &str = "ENABLE_EXTERNAL_CRATES_LOGGING";

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
