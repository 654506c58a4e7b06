use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;
use validator::ValidationError;

/// Connection identifiers appear in URL paths and in signed state, so they
/// are restricted to a URL-safe alphabet.
/// Examples: "conn-1", "acme_okta", "Tenant42"
pub static CONNECTION_ID_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+(?:[-_][A-Za-z0-9]+)*$").ok());

/// Maximum number of trusted certificates per connection.
const MAX_CERTIFICATES: usize = 8;

fn error(code: &'static str, message: impl Into<Cow<'static, str>>) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

pub fn validate_connection_id(id: &str) -> Result<(), ValidationError> {
    let valid = CONNECTION_ID_REGEX
        .as_ref()
        .is_some_and(|re| re.is_match(id));
    if valid {
        Ok(())
    } else {
        Err(error(
            "invalid_connection_id",
            "Connection IDs may only contain letters, digits, '-' and '_'",
        ))
    }
}

/// Validate the trusted IdP certificate list.
///
/// Ensures that:
/// - At least one and at most MAX_CERTIFICATES certificates are configured
/// - Every entry looks like a PEM certificate or bare base64 DER
pub fn validate_certificates(certs: &[String]) -> Result<(), ValidationError> {
    if certs.is_empty() {
        return Err(error(
            "no_certificates",
            "At least one IdP signing certificate is required",
        ));
    }
    if certs.len() > MAX_CERTIFICATES {
        return Err(error(
            "too_many_certificates",
            format!("Maximum {} certificates allowed", MAX_CERTIFICATES),
        ));
    }
    for cert in certs {
        let body = cert.trim();
        let looks_like_pem = body.contains("-----BEGIN CERTIFICATE-----");
        let looks_like_base64 = !body.is_empty()
            && body
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '\n' | '\r'));
        if !looks_like_pem && !looks_like_base64 {
            return Err(error(
                "invalid_certificate",
                "Certificates must be PEM or base64-encoded DER",
            ));
        }
    }
    Ok(())
}

/// Validate allowed return origins: absolute http(s) URLs with no path.
pub fn validate_origins(origins: &[String]) -> Result<(), ValidationError> {
    for origin in origins {
        let parsed = url::Url::parse(origin)
            .map_err(|_| error("invalid_origin", format!("'{}' is not a valid URL", origin)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(error(
                "invalid_origin",
                format!("'{}' must be an http(s) origin", origin),
            ));
        }
        if parsed.path() != "/" || parsed.query().is_some() {
            return Err(error(
                "invalid_origin",
                format!("'{}' must not contain a path or query", origin),
            ));
        }
    }
    Ok(())
}
