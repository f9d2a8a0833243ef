use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;
use url::Url;

use super::schema::Config;
use crate::error::{ConfigError, Result};

/// Load configuration from the default file location merged with
/// `GIT_PROXY_`-prefixed environment variables (env wins).
pub fn load() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("git-auth-proxy.toml"))
        .merge(Env::prefixed("GIT_PROXY_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

/// Load configuration from an explicit TOML file, still allowing env
/// overrides.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file(path.as_ref()))
        .merge(Env::prefixed("GIT_PROXY_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.port == config.health_port {
        return Err(ConfigError::Validation(
            "proxy and health ports must be different".into(),
        )
        .into());
    }

    if let Err(e) = Url::parse(&config.repository_url) {
        return Err(ConfigError::InvalidRepositoryUrl {
            url: config.repository_url.clone(),
            reason: e.to_string(),
        }
        .into());
    }

    // An authenticated deployment with no token would silently inject
    // garbage credentials; refuse to start instead.
    if !config.anonymous && config.token.as_deref().unwrap_or("").is_empty() {
        return Err(ConfigError::MissingSecret.into());
    }

    Ok(())
}
