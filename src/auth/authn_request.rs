//! SP-side SAML messages: AuthnRequests for the HTTP-Redirect binding and
//! SP metadata for IdP auto-configuration.

use samael::{metadata::EntityDescriptor, schema::AuthnRequest, service_provider::ServiceProviderBuilder};

use crate::models::SamlConnection;

#[derive(Debug, thiserror::Error)]
pub enum AuthnRequestError {
    #[error("failed to build IdP metadata: {0}")]
    IdpMetadata(String),

    #[error("failed to build service provider: {0}")]
    ServiceProvider(String),

    #[error("failed to create AuthnRequest: {0}")]
    Request(String),

    #[error("AuthnRequest has no destination")]
    NoDestination,
}

/// An AuthnRequest ready to be sent through the browser.
pub struct PreparedAuthnRequest {
    request: AuthnRequest,
}

impl PreparedAuthnRequest {
    /// The request ID the IdP must echo back in `InResponseTo`.
    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// IdP SSO URL with the deflated `SAMLRequest` and `RelayState` attached.
    pub fn redirect_url(&self, relay_state: &str) -> Result<String, AuthnRequestError> {
        self.request
            .redirect(relay_state)
            .map_err(|e| AuthnRequestError::Request(e.to_string()))?
            .map(|url| url.to_string())
            .ok_or(AuthnRequestError::NoDestination)
    }
}

/// Build an unsigned AuthnRequest addressed to the connection's IdP.
pub fn prepare(
    connection: &SamlConnection,
    acs_url: &str,
) -> Result<PreparedAuthnRequest, AuthnRequestError> {
    let sp = ServiceProviderBuilder::default()
        .entity_id(connection.sp_entity_id.clone())
        .acs_url(acs_url.to_string())
        .idp_metadata(idp_metadata(connection)?)
        .authn_name_id_format(connection.name_id_format().to_string())
        .force_authn(connection.force_authn)
        .build()
        .map_err(|e| AuthnRequestError::ServiceProvider(e.to_string()))?;

    let request = sp
        .make_authentication_request(&connection.idp_sso_url)
        .map_err(|e| AuthnRequestError::Request(e.to_string()))?;

    Ok(PreparedAuthnRequest { request })
}

fn idp_metadata(connection: &SamlConnection) -> Result<EntityDescriptor, AuthnRequestError> {
    let key_descriptors: String = connection
        .idp_certificates
        .iter()
        .map(|cert| {
            format!(
                r#"
        <md:KeyDescriptor use="signing">
            <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
                <ds:X509Data>
                    <ds:X509Certificate>{}</ds:X509Certificate>
                </ds:X509Data>
            </ds:KeyInfo>
        </md:KeyDescriptor>"#,
                strip_pem_headers(cert)
            )
        })
        .collect();

    let xml = format!(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
    <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">{}
        <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{}"/>
    </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
        escape(&connection.idp_entity_id),
        key_descriptors,
        escape(&connection.idp_sso_url),
    );

    samael::metadata::de::from_str(&xml).map_err(|e| AuthnRequestError::IdpMetadata(e.to_string()))
}

/// SP metadata document for the connection.
///
/// Advertises the entity ID, the requested NameID format and the ACS URL
/// with the HTTP-POST binding. AuthnRequests are not signed, so no key
/// descriptor is published.
pub fn sp_metadata_xml(connection: &SamlConnection, acs_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="{}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:NameIDFormat>{}</md:NameIDFormat>
    <md:AssertionConsumerService
        Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"
        Location="{}"
        index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
        escape(&connection.sp_entity_id),
        connection.require_signed_assertions,
        escape(connection.name_id_format()),
        escape(acs_url),
    )
}

fn strip_pem_headers(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("")
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use base64::{Engine, engine::general_purpose::STANDARD};
    use flate2::read::DeflateDecoder;

    use super::*;
    use crate::auth::test_support::{ACS_URL, connection};

    fn saml_request_xml(redirect: &str) -> String {
        let url = url::Url::parse(redirect).unwrap();
        let encoded = url
            .query_pairs()
            .find(|(k, _)| k == "SAMLRequest")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let deflated = STANDARD.decode(encoded).unwrap();
        let mut xml = String::new();
        DeflateDecoder::new(deflated.as_slice())
            .read_to_string(&mut xml)
            .unwrap();
        xml
    }

    #[test]
    fn test_redirect_carries_request_and_state() {
        let prepared = prepare(&connection(), ACS_URL).unwrap();
        let redirect = prepared.redirect_url("opaque-state").unwrap();

        assert!(redirect.starts_with("https://idp.example.com/sso?"));
        let url = url::Url::parse(&redirect).unwrap();
        let relay_state = url
            .query_pairs()
            .find(|(k, _)| k == "RelayState")
            .map(|(_, v)| v.into_owned());
        assert_eq!(relay_state.as_deref(), Some("opaque-state"));

        let xml = saml_request_xml(&redirect);
        assert!(xml.contains(&format!(r#"ID="{}""#, prepared.id())), "{xml}");
        assert!(xml.contains(ACS_URL), "{xml}");
        assert!(xml.contains("https://sso.example.com"), "{xml}");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = prepare(&connection(), ACS_URL).unwrap();
        let b = prepare(&connection(), ACS_URL).unwrap();
        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_sp_metadata() {
        let metadata = sp_metadata_xml(&connection(), ACS_URL);

        assert!(metadata.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(metadata.contains("entityID=\"https://sso.example.com\""));
        assert!(metadata.contains("Binding=\"urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST\""));
        assert!(metadata.contains(&format!("Location=\"{ACS_URL}\"")));
        assert!(metadata.contains(
            "<md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</md:NameIDFormat>"
        ));
        assert!(metadata.contains("WantAssertionsSigned=\"true\""));
        assert!(roxmltree::Document::parse(&metadata).is_ok());
    }

    #[test]
    fn test_strip_pem_headers() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\nAbCd\n-----END CERTIFICATE-----\n";
        assert_eq!(strip_pem_headers(pem), "MIIBAbCd");
    }
}
