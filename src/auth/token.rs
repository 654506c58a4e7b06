//! Identity token issuance.
//!
//! Tokens are RS256 JWTs with a short lifetime. They hand an authenticated
//! identity to the relying application, which verifies them offline against
//! the keys published at `/.well-known/jwks.json`.

use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation,
    jwk::{
        AlgorithmParameters, CommonParameters, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
        RSAKeyParameters, RSAKeyType,
    },
};
use openssl::{
    pkey::{HasPublic, PKey},
    rsa::Rsa,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    config::{SigningKeySource, TokenConfig},
    models::UserIdentity,
};

const MIN_RSA_BITS: u32 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token issuance failed: {0}")]
    TokenIssuanceFailed(String),

    #[error("token was signed by unknown key '{0}'")]
    UnknownKey(String),

    #[error("token verification failed: {0}")]
    Verification(#[from] jsonwebtoken::errors::Error),
}

impl TokenError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenIssuanceFailed(_) => "TokenIssuanceFailed",
            Self::UnknownKey(_) | Self::Verification(_) => "InvalidToken",
        }
    }
}

/// Claims carried by an identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub iss: String,
    /// The identity's stable external ID.
    pub sub: String,
    pub aud: String,
    pub email: String,
    pub org_id: String,
    pub connection_id: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub nonce: String,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWS.
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub nonce: String,
    pub key_id: String,
    pub claims: IdentityClaims,
}

/// Signs identity tokens with a key loaded once at startup.
pub struct TokenIssuer {
    issuer: String,
    ttl_secs: u64,
    key_id: String,
    encoding_key: EncodingKey,
    jwks: JwkSet,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("ttl_secs", &self.ttl_secs)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn from_config(config: &TokenConfig) -> Result<Self, TokenError> {
        let pem = match &config.signing_key {
            SigningKeySource::Pem { pem } => pem.clone(),
            SigningKeySource::Path { path } => std::fs::read_to_string(path).map_err(|e| {
                TokenError::TokenIssuanceFailed(format!(
                    "failed to read signing key {}: {e}",
                    path.display()
                ))
            })?,
        };
        Self::from_pem(config, &pem)
    }

    pub fn from_pem(config: &TokenConfig, pem: &str) -> Result<Self, TokenError> {
        let private = PKey::private_key_from_pem(pem.as_bytes())
            .map_err(|e| TokenError::TokenIssuanceFailed(format!("invalid signing key: {e}")))?;
        let rsa = private.rsa().map_err(|_| {
            TokenError::TokenIssuanceFailed("signing key must be an RSA key".into())
        })?;
        if private.bits() < MIN_RSA_BITS {
            return Err(TokenError::TokenIssuanceFailed(format!(
                "signing key has {} bits; at least {MIN_RSA_BITS} are required",
                private.bits()
            )));
        }

        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| TokenError::TokenIssuanceFailed(e.to_string()))?;

        let (n, e) = rsa_components(&rsa);
        let key_id = config
            .key_id
            .clone()
            .unwrap_or_else(|| thumbprint(&n, &e));

        let mut keys = vec![rsa_jwk(&key_id, n, e)];
        for extra in &config.additional_verification_keys {
            let public = Rsa::public_key_from_pem(extra.public_key_pem.as_bytes())
                .map_err(|e| {
                    TokenError::TokenIssuanceFailed(format!(
                        "invalid verification key '{}': {e}",
                        extra.key_id
                    ))
                })?;
            let (n, e) = rsa_components(&public);
            keys.push(rsa_jwk(&extra.key_id, n, e));
        }

        Ok(Self {
            issuer: config.issuer.clone(),
            ttl_secs: config.ttl_secs,
            key_id,
            encoding_key,
            jwks: JwkSet { keys },
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Published verification keys, signing key first.
    pub fn jwks(&self) -> &JwkSet {
        &self.jwks
    }

    pub fn issue(&self, identity: &UserIdentity, audience: &str) -> Result<IssuedToken, TokenError> {
        self.issue_at(identity, audience, Utc::now())
    }

    pub fn issue_at(
        &self,
        identity: &UserIdentity,
        audience: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let iat = now.timestamp();
        let claims = IdentityClaims {
            iss: self.issuer.clone(),
            sub: identity.external_id.clone(),
            aud: audience.to_string(),
            email: identity.email.clone(),
            org_id: identity.organization_id.clone(),
            connection_id: identity.connection_id.clone(),
            iat,
            nbf: iat,
            exp: iat + self.ttl_secs as i64,
            nonce: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());

        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| TokenError::TokenIssuanceFailed(e.to_string()))?;

        Ok(IssuedToken {
            token,
            token_type: "Bearer",
            expires_in: self.ttl_secs,
            nonce: claims.nonce.clone(),
            key_id: self.key_id.clone(),
            claims,
        })
    }
}

/// Offline verification of identity tokens, as a relying application does it.
pub struct TokenVerifier {
    issuer: String,
    keys: HashMap<String, DecodingKey>,
}

impl TokenVerifier {
    pub fn from_jwks(jwks: &JwkSet, issuer: &str) -> Result<Self, TokenError> {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            keys.insert(kid, DecodingKey::from_jwk(jwk)?);
        }
        Ok(Self {
            issuer: issuer.to_string(),
            keys,
        })
    }

    pub fn verify(&self, token: &str, audience: &str) -> Result<IdentityClaims, TokenError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.unwrap_or_default();
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| TokenError::UnknownKey(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud", "sub"]);

        Ok(jsonwebtoken::decode::<IdentityClaims>(token, key, &validation)?.claims)
    }
}

fn rsa_components<T: HasPublic>(rsa: &Rsa<T>) -> (String, String) {
    (
        URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
        URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
    )
}

/// RFC 7638 JWK thumbprint.
fn thumbprint(n: &str, e: &str) -> String {
    let canonical = format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

fn rsa_jwk(key_id: &str, n: String, e: String) -> Jwk {
    Jwk {
        common: CommonParameters {
            public_key_use: Some(PublicKeyUse::Signature),
            key_algorithm: Some(KeyAlgorithm::RS256),
            key_id: Some(key_id.to_string()),
            ..Default::default()
        },
        algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
            key_type: RSAKeyType::RSA,
            n,
            e,
        }),
    }
}
