use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validators::{validate_certificates, validate_connection_id, validate_origins};

/// NameID format requested when a connection does not set one.
pub const DEFAULT_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

/// A SAML connection between one organization and its IdP.
///
/// Records are immutable per `version`; the connection-management service
/// bumps the version whenever it rewrites a row. Every validation decision
/// for a login (trusted certificates, audience, ACS URL) is taken from the
/// connection named in the signed RelayState.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlConnection {
    /// Connection identifier used in URLs (e.g. "conn-1").
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Monotonic configuration version.
    pub version: i64,

    /// IdP entity ID; must match the assertion's `Issuer`.
    pub idp_entity_id: String,
    /// IdP SSO endpoint for the HTTP-Redirect binding.
    pub idp_sso_url: String,
    /// Trusted IdP signing certificates (PEM), tried in order.
    pub idp_certificates: Vec<String>,

    /// Service provider entity ID; assertions must name it as audience.
    pub sp_entity_id: String,
    /// Assertion consumer service URL override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs_url: Option<String>,

    /// Declarative attribute mapping.
    pub attribute_mapping: AttributeMapping,
    /// Reject responses that carry no signature at all.
    pub require_signed_assertions: bool,
    /// NameID format requested in AuthnRequests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_id_format: Option<String>,
    /// Ask the IdP to re-authenticate even with an existing session.
    pub force_authn: bool,

    /// `aud` claim for issued tokens. Defaults to the return URL origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_audience: Option<String>,
    /// Origins the relying application may ask to be redirected to.
    /// Empty means any http(s) origin.
    pub allowed_return_origins: Vec<String>,

    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SamlConnection {
    /// The ACS URL the IdP must post to, and that assertions must name as recipient.
    pub fn acs_url(&self, public_base: &str) -> String {
        match &self.acs_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/saml/{}/acs",
                public_base.trim_end_matches('/'),
                self.id
            ),
        }
    }

    /// NameID format to request, falling back to email address.
    pub fn name_id_format(&self) -> &str {
        self.name_id_format
            .as_deref()
            .unwrap_or(DEFAULT_NAME_ID_FORMAT)
    }
}

/// Maps assertion attributes onto canonical identity fields.
///
/// Attribute names match either the SAML `Name` or `FriendlyName`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeMapping {
    /// Attribute carrying the stable subject identifier. `None` uses the NameID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// Attribute carrying the user's email address. Required.
    #[serde(default = "default_email_attribute")]
    pub email: String,

    /// Extra canonical fields copied onto the identity when present,
    /// keyed by canonical name with the assertion attribute as value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            external_id: None,
            email: default_email_attribute(),
            attributes: BTreeMap::new(),
        }
    }
}

fn default_email_attribute() -> String {
    "email".to_string()
}

/// Input for registering a connection.
///
/// Used by the `[[connections]]` config section, which seeds the table at
/// startup, and by tests.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateSamlConnection {
    #[validate(length(min = 1, max = 64), custom(function = "validate_connection_id"))]
    pub id: String,

    #[validate(length(min = 1, max = 128))]
    pub organization_id: String,

    #[serde(default = "default_version")]
    pub version: i64,

    #[validate(length(min = 1, max = 512))]
    pub idp_entity_id: String,

    #[validate(length(max = 512), url)]
    pub idp_sso_url: String,

    #[validate(custom(function = "validate_certificates"))]
    pub idp_certificates: Vec<String>,

    #[validate(length(min = 1, max = 512))]
    pub sp_entity_id: String,

    #[serde(default)]
    #[validate(length(max = 512), url)]
    pub acs_url: Option<String>,

    #[serde(default)]
    pub attribute_mapping: AttributeMapping,

    #[serde(default = "default_true")]
    pub require_signed_assertions: bool,

    #[serde(default)]
    #[validate(length(max = 256))]
    pub name_id_format: Option<String>,

    #[serde(default)]
    pub force_authn: bool,

    #[serde(default)]
    #[validate(length(max = 512))]
    pub token_audience: Option<String>,

    #[serde(default)]
    #[validate(custom(function = "validate_origins"))]
    pub allowed_return_origins: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_version() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_input() -> CreateSamlConnection {
        CreateSamlConnection {
            id: "conn-1".into(),
            organization_id: "org-acme".into(),
            version: 1,
            idp_entity_id: "https://idp.example.com".into(),
            idp_sso_url: "https://idp.example.com/sso".into(),
            idp_certificates: vec![
                "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----".into(),
            ],
            sp_entity_id: "https://sso.example.com".into(),
            acs_url: None,
            attribute_mapping: AttributeMapping::default(),
            require_signed_assertions: true,
            name_id_format: None,
            force_authn: false,
            token_audience: None,
            allowed_return_origins: vec![],
            enabled: true,
        }
    }

    #[test]
    fn test_valid_connection_input() {
        assert!(connection_input().validate().is_ok());
    }

    #[test]
    fn test_connection_id_charset() {
        let mut input = connection_input();
        input.id = "conn/1".into();
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_connection_requires_certificate() {
        let mut input = connection_input();
        input.idp_certificates.clear();
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_attribute_mapping_defaults_from_toml() {
        let mapping: AttributeMapping = toml::from_str("").unwrap();
        assert_eq!(mapping.email, "email");
        assert!(mapping.external_id.is_none());

        let mapping: AttributeMapping = toml::from_str(
            r#"
            external_id = "employeeNumber"
            email = "mail"
            [attributes]
            department = "dept"
        "#,
        )
        .unwrap();
        assert_eq!(mapping.external_id.as_deref(), Some("employeeNumber"));
        assert_eq!(mapping.attributes["department"], "dept");
    }
}
