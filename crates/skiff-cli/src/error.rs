use thiserror::Error;

pub const ENV_PREFIX: &str = "SKIFF";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: set the {env_var} environment variable or add it to the config file")]
    MissingField { env_var: String },

    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

/// Environment variable that overrides the dotted config `key`
pub fn to_env_var(key: &str) -> String {
    format!("{}__{}", ENV_PREFIX, key.replace('.', "__").to_uppercase())
}
