use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL of this service (e.g., "https://sso.example.com").
    ///
    /// Used to derive each connection's assertion consumer service URL
    /// (`{public_url}/saml/{connection_id}/acs`) when the connection does not
    /// override it. Must match what the IdP posts back to, byte for byte.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Request body size limit in bytes. SAML responses carrying certificates
    /// and large attribute statements can run to tens of kilobytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            body_limit_bytes: default_body_limit(),
            timeout_secs: default_timeout(),
        }
    }
}

impl ServerConfig {
    /// The public base URL without a trailing slash.
    pub fn public_base(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.public_url).map_err(|e| {
            ConfigError::Validation(format!(
                "server.public_url '{}' is not a valid URL: {}",
                self.public_url, e
            ))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(
                "server.public_url must use http or https".into(),
            ));
        }
        if self.body_limit_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.body_limit_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_body_limit() -> usize {
    1024 * 1024 // 1 MB
}

fn default_timeout() -> u64 {
    30
}
