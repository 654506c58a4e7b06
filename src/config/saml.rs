use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Minimum RelayState HMAC key length in bytes.
pub const MIN_STATE_KEY_BYTES: usize = 32;

/// Upper bound on issued token lifetime. Tokens are a handoff credential,
/// not a session.
pub const MAX_TOKEN_TTL_SECS: u64 = 300;

/// SAML protocol tuning shared by every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Tolerance applied to assertion time bounds (NotBefore, NotOnOrAfter).
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// How often expired entries are swept from the consumed-request ledger.
    #[serde(default = "default_purge_interval")]
    pub consumed_request_purge_interval_secs: u64,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew(),
            consumed_request_purge_interval_secs: default_purge_interval(),
        }
    }
}

impl SamlConfig {
    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_secs as i64)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.clock_skew_secs > 600 {
            return Err(ConfigError::Validation(
                "saml.clock_skew_secs cannot exceed 600".into(),
            ));
        }
        if self.consumed_request_purge_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "saml.consumed_request_purge_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_clock_skew() -> u64 {
    120
}

fn default_purge_interval() -> u64 {
    60
}

/// RelayState signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// HMAC keys. The first key signs; every key verifies, so a rotated-out
    /// key stays in the list until in-flight flows have expired.
    pub keys: Vec<String>,

    /// Maximum age of a RelayState before it is rejected as expired.
    #[serde(default = "default_state_ttl")]
    pub ttl_secs: u64,
}

impl StateConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.is_empty() {
            return Err(ConfigError::Validation(
                "state.keys must contain at least one signing key".into(),
            ));
        }
        if let Some(pos) = self
            .keys
            .iter()
            .position(|k| k.len() < MIN_STATE_KEY_BYTES)
        {
            return Err(ConfigError::Validation(format!(
                "state.keys[{}] is shorter than {} bytes",
                pos, MIN_STATE_KEY_BYTES
            )));
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "state.ttl_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_state_ttl() -> u64 {
    600 // 10 minutes
}

/// Identity token issuance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    /// `iss` claim of issued tokens.
    pub issuer: String,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u64,

    /// RSA private key used to sign tokens.
    pub signing_key: SigningKeySource,

    /// `kid` header for the signing key. Derived from the public key when omitted.
    #[serde(default)]
    pub key_id: Option<String>,

    /// Previously used public keys that relying parties may still need
    /// to verify tokens issued before a rotation.
    #[serde(default)]
    pub additional_verification_keys: Vec<VerificationKeyConfig>,

    /// Query parameter carrying the token on the final redirect.
    #[serde(default = "default_token_param")]
    pub token_param: String,
}

impl TokenConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::Validation("token.issuer cannot be empty".into()));
        }
        if self.ttl_secs == 0 || self.ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(ConfigError::Validation(format!(
                "token.ttl_secs must be between 1 and {}",
                MAX_TOKEN_TTL_SECS
            )));
        }
        if self.token_param.is_empty() {
            return Err(ConfigError::Validation(
                "token.token_param cannot be empty".into(),
            ));
        }
        match &self.signing_key {
            SigningKeySource::Path { path } if path.as_os_str().is_empty() => {
                return Err(ConfigError::Validation(
                    "token.signing_key.path cannot be empty".into(),
                ));
            }
            SigningKeySource::Pem { pem } if !pem.contains("PRIVATE KEY-----") => {
                return Err(ConfigError::Validation(
                    "token.signing_key.pem must be a PEM-encoded private key".into(),
                ));
            }
            _ => {}
        }
        for key in &self.additional_verification_keys {
            if key.key_id.is_empty() {
                return Err(ConfigError::Validation(
                    "token.additional_verification_keys entries need a key_id".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Where the token signing key is loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SigningKeySource {
    /// PEM file on disk.
    Path { path: std::path::PathBuf },
    /// Inline PEM, usually injected through `${VAR}` expansion.
    Pem { pem: String },
}

/// A published public key that is not used for signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationKeyConfig {
    pub key_id: String,
    pub public_key_pem: String,
}

fn default_token_ttl() -> u64 {
    MAX_TOKEN_TTL_SECS
}

fn default_token_param() -> String {
    "token".to_string()
}
