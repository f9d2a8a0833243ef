use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process configuration, read once at startup.
///
/// Every field can come from the TOML config file or from a
/// `GIT_PROXY_`-prefixed environment variable (`GIT_PROXY_PORT`,
/// `GIT_PROXY_REPOSITORY_URL`, ...).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// TCP port the proxy accepts client connections on.
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// TCP port for the liveness endpoint.
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Address both listeners bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// When true the gate performs no matching and no injection; every
    /// request is forwarded untouched.
    #[serde(default)]
    pub anonymous: bool,

    /// Full URL of the one repository authorized to receive the credential.
    pub repository_url: String,

    /// OAuth token used to build the Basic-auth value. Required unless
    /// `anonymous` is set.
    #[serde(default)]
    pub token: Option<String>,

    /// What to do with requests that do not match the repository.
    #[serde(default)]
    pub policy: MismatchPolicy,

    /// Override for the CA certificate used to mint interception certs.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Override for the CA private key.
    #[serde(default)]
    pub ca_key_path: Option<PathBuf>,
}

/// Reject policy for requests whose destination is not the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Forward mismatched requests to their original destination, untouched.
    Permissive,
    /// Never contact the original destination; answer with an explanatory
    /// message instead.
    #[default]
    Restrictive,
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_health_port() -> u16 {
    8081
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
