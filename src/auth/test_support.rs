//! Test fixtures: RSA keys, self-signed IdP certificates, and a builder for
//! signed SAML responses.

use std::sync::LazyLock;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    sign::Signer,
    x509::{X509, X509NameBuilder},
};
use sha2::{Digest, Sha256};

use super::xmldsig::{
    DIGEST_SHA256, DSIG_NS, ENVELOPED_SIGNATURE, EXC_C14N, RSA_SHA256, canonicalize,
};
use crate::{
    config::{
        BrokerConfig, DatabaseConfig, ObservabilityConfig, SamlConfig, ServerConfig,
        SigningKeySource, StateConfig, TokenConfig,
    },
    models::{AttributeMapping, CreateSamlConnection, SamlConnection},
};

pub const CONNECTION_ID: &str = "conn-1";
pub const ORG_ID: &str = "org-acme";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com";
pub const IDP_SSO_URL: &str = "https://idp.example.com/sso";
pub const SP_ENTITY_ID: &str = "https://sso.example.com";
pub const PUBLIC_BASE: &str = "https://sso.example.com";
pub const ACS_URL: &str = "https://sso.example.com/saml/conn-1/acs";
pub const STATE_KEY: &str = "relay-state-key-0123456789abcdef0123";

const SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

pub struct TestKeys {
    pub idp_key: PKey<Private>,
    pub idp_cert: X509,
    pub other_key: PKey<Private>,
    pub other_cert: X509,
    pub token_key_pem: String,
    pub other_token_key_pem: String,
}

static KEYS: LazyLock<TestKeys> = LazyLock::new(|| {
    let (idp_key, idp_cert) = key_and_cert("idp.example.com");
    let (other_key, other_cert) = key_and_cert("rogue.example.com");
    TestKeys {
        idp_key,
        idp_cert,
        other_key,
        other_cert,
        token_key_pem: rsa_pem(),
        other_token_key_pem: rsa_pem(),
    }
});

impl TestKeys {
    pub fn shared() -> &'static TestKeys {
        &KEYS
    }

    pub fn idp_cert_pem(&self) -> String {
        String::from_utf8(self.idp_cert.to_pem().unwrap()).unwrap()
    }

    pub fn other_cert_pem(&self) -> String {
        String::from_utf8(self.other_cert.to_pem().unwrap()).unwrap()
    }
}

fn rsa_pem() -> String {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap()
}

fn key_and_cert(common_name: &str) -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

/// Connection input for `conn-1`, trusting the given certificates.
pub fn connection_input(certificates: Vec<String>) -> CreateSamlConnection {
    CreateSamlConnection {
        id: CONNECTION_ID.into(),
        organization_id: ORG_ID.into(),
        version: 1,
        idp_entity_id: IDP_ENTITY_ID.into(),
        idp_sso_url: IDP_SSO_URL.into(),
        idp_certificates: certificates,
        sp_entity_id: SP_ENTITY_ID.into(),
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

/// In-memory `conn-1` connection trusting the shared IdP certificate.
pub fn connection() -> SamlConnection {
    connection_from(connection_input(vec![TestKeys::shared().idp_cert_pem()]))
}

pub fn connection_from(input: CreateSamlConnection) -> SamlConnection {
    let now = Utc::now();
    SamlConnection {
        id: input.id,
        organization_id: input.organization_id,
        version: input.version,
        idp_entity_id: input.idp_entity_id,
        idp_sso_url: input.idp_sso_url,
        idp_certificates: input.idp_certificates,
        sp_entity_id: input.sp_entity_id,
        acs_url: input.acs_url,
        attribute_mapping: input.attribute_mapping,
        require_signed_assertions: input.require_signed_assertions,
        name_id_format: input.name_id_format,
        force_authn: input.force_authn,
        token_audience: input.token_audience,
        allowed_return_origins: input.allowed_return_origins,
        enabled: input.enabled,
        created_at: now,
        updated_at: now,
    }
}

/// Broker configuration matching the fixtures. The database section is
/// left empty; tests hand the flow an already-migrated pool.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        server: ServerConfig {
            public_url: PUBLIC_BASE.into(),
            ..Default::default()
        },
        database: DatabaseConfig::None,
        saml: SamlConfig::default(),
        state: StateConfig {
            keys: vec![STATE_KEY.into()],
            ttl_secs: 600,
        },
        token: TokenConfig {
            issuer: PUBLIC_BASE.into(),
            ttl_secs: 300,
            signing_key: SigningKeySource::Pem {
                pem: TestKeys::shared().token_key_pem.clone(),
            },
            key_id: None,
            additional_verification_keys: vec![],
            token_param: "token".into(),
        },
        connections: vec![],
        observability: ObservabilityConfig::default(),
    }
}

/// Which elements of a built response carry a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signing {
    Unsigned,
    Assertion,
    Response,
    Both,
}

/// Builds synthetic IdP responses. Every field starts out valid for
/// `conn-1`; tests override the one they exercise.
pub struct ResponseBuilder {
    pub response_id: String,
    pub assertion_id: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub confirmation_in_response_to: Option<String>,
    pub recipient: String,
    pub audience: String,
    pub name_id: String,
    pub status: String,
    pub issued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub confirmation_not_on_or_after: DateTime<Utc>,
    pub attributes: Vec<(String, Vec<String>)>,
    pub assertion_count: usize,
    pub signing: Signing,
    pub key: &'static PKey<Private>,
}

impl ResponseBuilder {
    pub fn new(request_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            response_id: "_resp-7f3c2a".into(),
            assertion_id: "_assert-91bd4e".into(),
            issuer: IDP_ENTITY_ID.into(),
            destination: Some(ACS_URL.into()),
            in_response_to: Some(request_id.into()),
            confirmation_in_response_to: Some(request_id.into()),
            recipient: ACS_URL.into(),
            audience: SP_ENTITY_ID.into(),
            name_id: "alice@example.com".into(),
            status: SUCCESS.into(),
            issued_at: now,
            not_before: now - Duration::seconds(30),
            not_on_or_after: now + Duration::minutes(5),
            confirmation_not_on_or_after: now + Duration::minutes(5),
            attributes: vec![
                ("email".into(), vec!["alice@example.com".into()]),
                ("displayName".into(), vec!["Alice Liddell".into()]),
            ],
            assertion_count: 1,
            signing: Signing::Assertion,
            key: &TestKeys::shared().idp_key,
        }
    }

    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.retain(|(n, _)| n != name);
        self.attributes.push((name.into(), vec![value.into()]));
        self
    }

    pub fn without_attribute(mut self, name: &str) -> Self {
        self.attributes.retain(|(n, _)| n != name);
        self
    }

    pub fn signing(mut self, signing: Signing) -> Self {
        self.signing = signing;
        self
    }

    pub fn signed_with(mut self, key: &'static PKey<Private>) -> Self {
        self.key = key;
        self
    }

    fn assertion_xml(&self, id: &str) -> String {
        let confirmation_irt = self
            .confirmation_in_response_to
            .as_deref()
            .map(|v| format!(r#" InResponseTo="{}""#, escape(v)))
            .unwrap_or_default();
        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| {
                        format!(
                            r#"<saml:AttributeValue xsi:type="xs:string">{}</saml:AttributeValue>"#,
                            escape(v)
                        )
                    })
                    .collect();
                format!(
                    r#"<saml:Attribute Name="{}" NameFormat="urn:oasis:names:tc:SAML:2.0:attrname-format:basic">{values}</saml:Attribute>"#,
                    escape(name)
                )
            })
            .collect();

        format!(
            concat!(
                r#"<saml:Assertion ID="{id}" IssueInstant="{issued}" Version="2.0">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<saml:Subject>"#,
                r#"<saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">{name_id}</saml:NameID>"#,
                r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
                r#"<saml:SubjectConfirmationData{irt} NotOnOrAfter="{scd_noa}" Recipient="{recipient}"/>"#,
                r#"</saml:SubjectConfirmation>"#,
                r#"</saml:Subject>"#,
                r#"<saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">"#,
                r#"<saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>"#,
                r#"</saml:Conditions>"#,
                r#"<saml:AuthnStatement AuthnInstant="{issued}" SessionIndex="_session-5521">"#,
                r#"<saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>"#,
                r#"</saml:AuthnStatement>"#,
                r#"<saml:AttributeStatement>{attributes}</saml:AttributeStatement>"#,
                r#"</saml:Assertion>"#,
            ),
            id = escape(id),
            issued = timestamp(self.issued_at),
            issuer = escape(&self.issuer),
            name_id = escape(&self.name_id),
            irt = confirmation_irt,
            scd_noa = timestamp(self.confirmation_not_on_or_after),
            recipient = escape(&self.recipient),
            nb = timestamp(self.not_before),
            noa = timestamp(self.not_on_or_after),
            audience = escape(&self.audience),
            attributes = attributes,
        )
    }

    /// The response document, signed per `signing`.
    pub fn build_xml(&self) -> String {
        let destination = self
            .destination
            .as_deref()
            .map(|v| format!(r#" Destination="{}""#, escape(v)))
            .unwrap_or_default();
        let in_response_to = self
            .in_response_to
            .as_deref()
            .map(|v| format!(r#" InResponseTo="{}""#, escape(v)))
            .unwrap_or_default();

        let mut assertions = String::new();
        for i in 0..self.assertion_count {
            let id = if i == 0 {
                self.assertion_id.clone()
            } else {
                format!("{}-{i}", self.assertion_id)
            };
            assertions.push_str(&self.assertion_xml(&id));
        }

        let mut xml = format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
                r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" "#,
                r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{issued}"{destination}{irt}>"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                r#"{assertions}"#,
                r#"</samlp:Response>"#,
            ),
            id = escape(&self.response_id),
            issued = timestamp(self.issued_at),
            destination = destination,
            irt = in_response_to,
            issuer = escape(&self.issuer),
            status = escape(&self.status),
            assertions = assertions,
        );

        if matches!(self.signing, Signing::Assertion | Signing::Both) {
            xml = sign_element(&xml, &self.assertion_id, self.key);
        }
        if matches!(self.signing, Signing::Response | Signing::Both) {
            xml = sign_element(&xml, &self.response_id, self.key);
        }
        xml
    }

    /// Base64 as posted by the HTTP-POST binding.
    pub fn build(&self) -> String {
        STANDARD.encode(self.build_xml())
    }
}

/// Insert an enveloped RSA-SHA256 signature into the element with `id`,
/// directly after its `Issuer` child.
pub fn sign_element(xml: &str, id: &str, key: &PKey<Private>) -> String {
    let doc = roxmltree::Document::parse(xml).unwrap();
    let target = doc
        .descendants()
        .find(|n| n.attribute("ID") == Some(id))
        .unwrap();

    let digest = Sha256::digest(canonicalize(target, None, &[]).unwrap().as_bytes());
    let signed_info = format!(
        concat!(
            r#"<ds:SignedInfo xmlns:ds="{ns}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"></ds:CanonicalizationMethod>"#,
            r#"<ds:SignatureMethod Algorithm="{sig}"></ds:SignatureMethod>"#,
            r##"<ds:Reference URI="#{id}">"##,
            r#"<ds:Transforms>"#,
            r#"<ds:Transform Algorithm="{env}"></ds:Transform>"#,
            r#"<ds:Transform Algorithm="{c14n}"></ds:Transform>"#,
            r#"</ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{dig}"></ds:DigestMethod>"#,
            r#"<ds:DigestValue>{digest}</ds:DigestValue>"#,
            r#"</ds:Reference>"#,
            r#"</ds:SignedInfo>"#,
        ),
        ns = DSIG_NS,
        c14n = EXC_C14N,
        sig = RSA_SHA256,
        id = id,
        env = ENVELOPED_SIGNATURE,
        dig = DIGEST_SHA256,
        digest = STANDARD.encode(digest),
    );

    let signed_info_doc = roxmltree::Document::parse(&signed_info).unwrap();
    let canonical = canonicalize(signed_info_doc.root_element(), None, &[]).unwrap();
    let mut signer = Signer::new(MessageDigest::sha256(), key).unwrap();
    signer.update(canonical.as_bytes()).unwrap();
    let signature_value = STANDARD.encode(signer.sign_to_vec().unwrap());

    let signature = format!(
        r#"<ds:Signature xmlns:ds="{DSIG_NS}">{signed_info}<ds:SignatureValue>{signature_value}</ds:SignatureValue></ds:Signature>"#
    );

    let issuer = target
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == "Issuer")
        .unwrap();
    let at = issuer.range().end;
    format!("{}{}{}", &xml[..at], signature, &xml[at..])
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
