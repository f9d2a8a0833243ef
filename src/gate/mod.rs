//! Destination matching and credential injection.
//!
//! Every request the interception engine is about to forward passes through
//! the [`DecisionContext`] gate exactly once. A request receives the
//! configured credential if and only if its scheme, effective port, host and
//! path all match the configured repository; anything else is forwarded
//! untouched or rejected, depending on the mismatch policy.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};
use std::fmt;
use url::Url;

use crate::config::{Config, MismatchPolicy};
use crate::error::ConfigError;

/// Outgoing protocol of an intercepted request. The engine only ever speaks
/// plain HTTP (absolute-form proxy requests) or HTTPS (inside a CONNECT
/// tunnel), so unsupported target schemes can never be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the engine is about to send a request. Derived from the connection
/// the engine will actually open (CONNECT authority, absolute-form URI), not
/// from a client-supplied Host header, so a forged header cannot spoof a
/// match while the TCP connection goes elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RequestTarget {
    pub fn new(scheme: Scheme, host: &str, port: u16, path: &str) -> Self {
        Self {
            scheme,
            // DNS names are case-insensitive; the target host out of the URL
            // parser is already lowercase.
            host: host.to_ascii_lowercase(),
            port,
            path: path.to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Outcome of gating one intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ForwardUnmodified,
    ForwardWithCredential,
    Reject,
}

/// Immutable, process-wide record of the authorized repository and the
/// credential material. Built once at startup, shared across connections
/// without locking.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    target_scheme: String,
    target_host: String,
    /// Explicit port from the repository URL, else the scheme default
    /// (443/https, 80/http). `None` for any other scheme, so no request can
    /// ever satisfy the port check.
    target_port: Option<u16>,
    target_segments: Vec<String>,
    /// Complete `Basic <base64>` header value, marked sensitive so it never
    /// shows up in Debug output or logs.
    credential: Option<HeaderValue>,
    anonymous: bool,
    policy: MismatchPolicy,
}

impl DecisionContext {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let url = Url::parse(&config.repository_url).map_err(|e| {
            ConfigError::InvalidRepositoryUrl {
                url: config.repository_url.clone(),
                reason: e.to_string(),
            }
        })?;
        let target_host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidRepositoryUrl {
                url: config.repository_url.clone(),
                reason: "URL has no host".into(),
            })?
            .to_string();

        let credential = if config.anonymous {
            None
        } else {
            match config.token.as_deref() {
                Some(token) if !token.is_empty() => Some(encode_credential(token)?),
                _ => return Err(ConfigError::MissingSecret),
            }
        };

        Ok(Self {
            target_scheme: url.scheme().to_string(),
            target_host,
            target_port: url.port_or_known_default(),
            target_segments: path_segments(url.path()),
            credential,
            anonymous: config.anonymous,
            policy: config.policy,
        })
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn policy(&self) -> MismatchPolicy {
        self.policy
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> Option<u16> {
        self.target_port
    }

    /// Whether a CONNECT to `host:port` reaches the repository host. Decides
    /// if the engine intercepts the tunnel at all; the full match (including
    /// the path) happens per inner request.
    pub fn is_target_endpoint(&self, host: &str, port: u16) -> bool {
        self.target_host.eq_ignore_ascii_case(host) && self.target_port == Some(port)
    }

    /// Classify one intercepted request. Pure; no side effect beyond a log
    /// line per decision.
    pub fn evaluate(&self, target: &RequestTarget) -> Decision {
        if self.anonymous {
            tracing::trace!(url = %target, "anonymous session, forwarding request untouched");
            return Decision::ForwardUnmodified;
        }
        if self.matches_target(target) {
            tracing::debug!(url = %target, "destination matches repository, attaching credential");
            return Decision::ForwardWithCredential;
        }
        match self.policy {
            MismatchPolicy::Permissive => {
                tracing::debug!(
                    url = %target,
                    "destination does not match repository, forwarding without credential"
                );
                Decision::ForwardUnmodified
            }
            MismatchPolicy::Restrictive => {
                tracing::info!(url = %target, "destination does not match repository, rejecting");
                Decision::Reject
            }
        }
    }

    /// Evaluate and, on a full match, install the Authorization header on the
    /// live request. The header map is owned by the single handling call, so
    /// this is the only place the credential is ever written.
    pub fn apply(&self, target: &RequestTarget, headers: &mut HeaderMap) -> Decision {
        let decision = self.evaluate(target);
        if decision == Decision::ForwardWithCredential {
            if let Some(credential) = &self.credential {
                headers.insert(AUTHORIZATION, credential.clone());
            }
        }
        decision
    }

    /// All four conjuncts are mandatory; a partial match never injects.
    fn matches_target(&self, target: &RequestTarget) -> bool {
        self.target_scheme == target.scheme.as_str()
            && self.target_port == Some(target.port)
            && self.target_host == target.host
            && self.path_matches(&target.path)
    }

    /// Segment-aware prefix test on normalized paths, so a sibling path like
    /// `/ns/proj-extra` cannot ride on a target of `/ns/proj`.
    fn path_matches(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        let request_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        request_segments.len() >= self.target_segments.len()
            && self
                .target_segments
                .iter()
                .zip(&request_segments)
                .all(|(target, request)| target == request)
    }
}

/// `Basic base64("oauth2:" + token)`, ready for the Authorization header.
fn encode_credential(token: &str) -> Result<HeaderValue, ConfigError> {
    let encoded = BASE64.encode(format!("oauth2:{token}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|e| ConfigError::Parse(format!("credential is not a valid header value: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Body of the restrictive-mode denial. Plain text with a 200 status so git
/// clients display it instead of reporting a transport failure.
pub fn denial_message(url: &str) -> String {
    format!("This proxy does not allow you to access {url}\n")
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
