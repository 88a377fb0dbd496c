use std::{
    env,
    fmt::{Display, Formatter, Result},
};

const RUST_ENV_KEY: &str = "RUST_ENV";

/// Deployment stage, read from `RUST_ENV`. Selects the `.env.*` file and the log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Staging,
    Prod,
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let printable = match *self {
            Environment::Local => "local",
            Environment::Dev => "development",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        };
        write!(f, "{}", printable)
    }
}

impl Environment {
    pub fn from_rust_env() -> Environment {
        Environment::parse(&env::var(RUST_ENV_KEY).unwrap_or_default())
    }

    /// Unknown or empty values fall back to `Local`.
    pub fn parse(value: &str) -> Environment {
        match value.to_lowercase().as_str() {
            "production" | "prod" => Environment::Prod,
            "staging" | "stg" => Environment::Staging,
            "development" | "develop" | "dev" => Environment::Dev,
            _ => Environment::Local,
        }
    }

    /// Dotenv file loaded for this stage.
    pub fn env_file(&self) -> &'static str {
        match self {
            Environment::Local => ".env.local",
            Environment::Dev => ".env.development",
            Environment::Staging => ".env.staging",
            Environment::Prod => ".env.production",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_rust_env_values() {
        assert_eq!(Environment::parse("PRODUCTION"), Environment::Prod);
        assert_eq!(Environment::parse("prod"), Environment::Prod);
        assert_eq!(Environment::parse("stg"), Environment::Staging);
        assert_eq!(Environment::parse("Develop"), Environment::Dev);
        assert_eq!(Environment::parse("development"), Environment::Dev);
        assert_eq!(Environment::parse(""), Environment::Local);
        assert_eq!(Environment::parse("qa"), Environment::Local);
    }

    #[test]
    fn should_pick_env_file_per_stage() {
        assert_eq!(Environment::Local.env_file(), ".env.local");
        assert_eq!(Environment::Dev.env_file(), ".env.development");
        assert_eq!(Environment::Staging.env_file(), ".env.staging");
        assert_eq!(Environment::Prod.env_file(), ".env.production");
    }

    #[test]
    fn should_display_environment() {
        assert_eq!(Environment::Local.to_string(), "local");
        assert_eq!(Environment::Dev.to_string(), "development");
        assert_eq!(Environment::Prod.to_string(), "prod");
    }
}
