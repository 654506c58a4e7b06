//! SAML Response validation.
//!
//! Takes the raw `SAMLResponse` form value and the connection named in the
//! signed RelayState, and either returns a fully validated assertion or an
//! [`AssertionError`]. Nothing is returned on partial success.
//!
//! Structural checks run before signature verification so that responses
//! carrying duplicate IDs or several assertions never reach the verifier,
//! which is where signature wrapping attacks try to confuse which element
//! was signed.

use std::{collections::BTreeMap, collections::HashSet, io::Read};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use flate2::read::DeflateDecoder;
use roxmltree::{Document, Node};

use super::xmldsig::{self, XmlDsigError, child, children};
use crate::models::SamlConnection;

const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Upper bound on an inflated response.
const MAX_RESPONSE_BYTES: u64 = 512 * 1024;

/// Errors from validating a SAML Response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssertionError {
    #[error("malformed SAML response: {0}")]
    MalformedResponse(String),

    #[error("IdP returned non-success status '{0}'")]
    StatusNotSuccess(String),

    #[error("response carries no signature")]
    SignatureMissing,

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("expected exactly one assertion, found {0}")]
    UnexpectedAssertionCount(usize),

    #[error("assertion conditions not met: {0}")]
    ConditionsNotMet(String),

    #[error("recipient mismatch: expected '{expected}', got '{actual}'")]
    RecipientMismatch { expected: String, actual: String },

    #[error("InResponseTo does not match the request ID")]
    RequestIdMismatch,

    #[error("missing required attribute '{0}'")]
    MissingRequiredAttribute(String),
}

impl AssertionError {
    /// Taxonomy name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedResponse(_) => "MalformedResponse",
            Self::StatusNotSuccess(_) => "StatusNotSuccess",
            Self::SignatureMissing => "SignatureMissing",
            Self::SignatureInvalid(_) => "SignatureInvalid",
            Self::UnexpectedAssertionCount(_) => "UnexpectedAssertionCount",
            Self::ConditionsNotMet(_) => "ConditionsNotMet",
            Self::RecipientMismatch { .. } => "RecipientMismatch",
            Self::RequestIdMismatch => "RequestIdMismatch",
            Self::MissingRequiredAttribute(_) => "MissingRequiredAttribute",
        }
    }
}

impl From<XmlDsigError> for AssertionError {
    fn from(err: XmlDsigError) -> Self {
        match err {
            XmlDsigError::Malformed(msg) => Self::MalformedResponse(msg),
            other => Self::SignatureInvalid(other.to_string()),
        }
    }
}

/// Per-flow inputs that are not part of the connection.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    /// ACS URL the response must be addressed to.
    pub acs_url: &'a str,
    /// Request ID from the signed RelayState.
    pub request_id: &'a str,
    pub now: DateTime<Utc>,
    pub clock_skew: Duration,
}

/// An assertion that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAssertion {
    pub id: String,
    pub issuer: String,
    /// The NameID value.
    pub subject: String,
    /// Stable identifier derived through the attribute mapping.
    pub external_id: String,
    pub email: String,
    /// Every attribute in the assertion, first value only, keyed by `Name`.
    pub attributes: BTreeMap<String, String>,
    /// Extra canonical fields produced by the mapping.
    pub mapped_attributes: BTreeMap<String, String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audience: String,
    pub recipient: String,
    pub in_response_to: String,
    pub session_index: Option<String>,
}

/// Validate a raw `SAMLResponse` value against `connection`.
pub fn validate_response(
    raw: &str,
    connection: &SamlConnection,
    ctx: &ValidationContext<'_>,
) -> Result<ValidatedAssertion, AssertionError> {
    let xml = decode_transport(raw)?;
    let doc = Document::parse(&xml)
        .map_err(|e| AssertionError::MalformedResponse(format!("XML parse error: {e}")))?;

    let response = doc.root_element();
    if !is(response, PROTOCOL_NS, "Response") {
        return Err(AssertionError::MalformedResponse(
            "root element is not samlp:Response".into(),
        ));
    }
    reject_duplicate_ids(&doc)?;

    check_status(response)?;

    if let Some(destination) = response.attribute("Destination")
        && destination != ctx.acs_url
    {
        return Err(AssertionError::RecipientMismatch {
            expected: ctx.acs_url.to_string(),
            actual: destination.to_string(),
        });
    }

    if doc
        .descendants()
        .any(|n| is(n, ASSERTION_NS, "EncryptedAssertion"))
    {
        return Err(AssertionError::MalformedResponse(
            "encrypted assertions are not supported".into(),
        ));
    }

    let assertion = single_assertion(&doc, response)?;

    verify_signatures(response, assertion, connection)?;

    let issuer = child_text(assertion, ASSERTION_NS, "Issuer")?.unwrap_or_default();
    if issuer != connection.idp_entity_id {
        return Err(AssertionError::ConditionsNotMet(format!(
            "issuer '{issuer}' is not the connection's IdP"
        )));
    }

    let conditions = check_conditions(assertion, connection, ctx)?;
    let confirmation = check_subject_confirmation(assertion, ctx)?;

    let response_irt = response.attribute("InResponseTo");
    check_in_response_to(response_irt, confirmation.in_response_to.as_deref(), ctx)?;

    let subject = match child(assertion, ASSERTION_NS, "Subject") {
        Some(s) => child_text(s, ASSERTION_NS, "NameID")?.unwrap_or_default(),
        None => String::new(),
    };

    let attributes = extract_attributes(assertion)?;
    let mapping = &connection.attribute_mapping;

    let external_id = match &mapping.external_id {
        Some(name) => lookup(&attributes, name)
            .ok_or_else(|| AssertionError::MissingRequiredAttribute(name.clone()))?,
        None if subject.is_empty() => {
            return Err(AssertionError::MissingRequiredAttribute("NameID".into()));
        }
        None => subject.clone(),
    };
    let email = lookup(&attributes, &mapping.email)
        .ok_or_else(|| AssertionError::MissingRequiredAttribute(mapping.email.clone()))?;

    let mapped_attributes = mapping
        .attributes
        .iter()
        .filter_map(|(canonical, source)| {
            lookup(&attributes, source).map(|value| (canonical.clone(), value))
        })
        .collect();

    let session_index = assertion
        .children()
        .find(|n| is(*n, ASSERTION_NS, "AuthnStatement"))
        .and_then(|n| n.attribute("SessionIndex"))
        .map(str::to_string);

    Ok(ValidatedAssertion {
        id: assertion.attribute("ID").unwrap_or_default().to_string(),
        issuer,
        subject,
        external_id,
        email,
        attributes: first_values(attributes),
        mapped_attributes,
        not_before: conditions.not_before,
        not_on_or_after: conditions.not_on_or_after,
        audience: conditions.audience,
        recipient: confirmation.recipient,
        in_response_to: ctx.request_id.to_string(),
        session_index,
    })
}

/// Undo the binding's transport encoding: base64, then optionally DEFLATE.
fn decode_transport(raw: &str) -> Result<String, AssertionError> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|_| AssertionError::MalformedResponse("SAMLResponse is not base64".into()))?;

    if bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'<') {
        return String::from_utf8(bytes)
            .map_err(|_| AssertionError::MalformedResponse("response is not UTF-8".into()));
    }

    let mut inflated = String::new();
    DeflateDecoder::new(bytes.as_slice())
        .take(MAX_RESPONSE_BYTES + 1)
        .read_to_string(&mut inflated)
        .map_err(|_| AssertionError::MalformedResponse("response is neither XML nor DEFLATE".into()))?;
    if inflated.len() as u64 > MAX_RESPONSE_BYTES {
        return Err(AssertionError::MalformedResponse(
            "inflated response is too large".into(),
        ));
    }
    Ok(inflated)
}

fn reject_duplicate_ids(doc: &Document<'_>) -> Result<(), AssertionError> {
    let mut seen = HashSet::new();
    for id in doc.descendants().filter_map(|n| n.attribute("ID")) {
        if !seen.insert(id) {
            return Err(AssertionError::MalformedResponse(format!(
                "duplicate ID '{id}'"
            )));
        }
    }
    Ok(())
}

fn check_status(response: Node<'_, '_>) -> Result<(), AssertionError> {
    let code = child(response, PROTOCOL_NS, "Status")
        .and_then(|s| child(s, PROTOCOL_NS, "StatusCode"))
        .and_then(|c| c.attribute("Value"))
        .ok_or_else(|| AssertionError::MalformedResponse("missing StatusCode".into()))?;
    if code != STATUS_SUCCESS {
        return Err(AssertionError::StatusNotSuccess(code.to_string()));
    }
    Ok(())
}

fn single_assertion<'a, 'input>(
    doc: &'a Document<'input>,
    response: Node<'a, 'input>,
) -> Result<Node<'a, 'input>, AssertionError> {
    let all: Vec<_> = doc
        .descendants()
        .filter(|n| is(*n, ASSERTION_NS, "Assertion"))
        .collect();
    match all.as_slice() {
        [only] if only.parent() == Some(response) => Ok(*only),
        _ => Err(AssertionError::UnexpectedAssertionCount(all.len())),
    }
}

fn verify_signatures(
    response: Node<'_, '_>,
    assertion: Node<'_, '_>,
    connection: &SamlConnection,
) -> Result<(), AssertionError> {
    let response_signed = xmldsig::signature_child(response)?.is_some();
    let assertion_signed = xmldsig::signature_child(assertion)?.is_some();

    if !response_signed && !assertion_signed {
        if connection.require_signed_assertions {
            return Err(AssertionError::SignatureMissing);
        }
        tracing::warn!(
            connection_id = %connection.id,
            "Accepting unsigned SAML response; connection does not require signatures"
        );
        return Ok(());
    }

    let keys = xmldsig::trusted_keys(&connection.idp_certificates)
        .map_err(|e| AssertionError::SignatureInvalid(e.to_string()))?;

    for (signed, name) in [(response, "Response"), (assertion, "Assertion")] {
        if xmldsig::signature_child(signed)?.is_none() {
            continue;
        }
        let index = xmldsig::verify_enveloped(signed, &keys)?;
        tracing::debug!(
            connection_id = %connection.id,
            element = name,
            certificate_index = index,
            "SAML signature verified"
        );
    }
    Ok(())
}

struct Conditions {
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
    audience: String,
}

fn check_conditions(
    assertion: Node<'_, '_>,
    connection: &SamlConnection,
    ctx: &ValidationContext<'_>,
) -> Result<Conditions, AssertionError> {
    let conditions = child(assertion, ASSERTION_NS, "Conditions")
        .ok_or_else(|| AssertionError::ConditionsNotMet("assertion has no Conditions".into()))?;

    let not_before = time_attribute(conditions, "NotBefore")?;
    let not_on_or_after = time_attribute(conditions, "NotOnOrAfter")?;

    if let Some(nb) = not_before
        && ctx.now < nb - ctx.clock_skew
    {
        return Err(AssertionError::ConditionsNotMet(
            "assertion is not yet valid".into(),
        ));
    }
    if let Some(noa) = not_on_or_after
        && ctx.now >= noa + ctx.clock_skew
    {
        return Err(AssertionError::ConditionsNotMet("assertion has expired".into()));
    }

    let restrictions: Vec<_> = children(conditions, ASSERTION_NS, "AudienceRestriction").collect();
    if restrictions.is_empty() {
        return Err(AssertionError::ConditionsNotMet(
            "assertion has no AudienceRestriction".into(),
        ));
    }
    for restriction in &restrictions {
        let mut matches = false;
        for audience in children(*restriction, ASSERTION_NS, "Audience") {
            matches |= element_text(audience)? == connection.sp_entity_id;
        }
        if !matches {
            return Err(AssertionError::ConditionsNotMet(format!(
                "audience does not include '{}'",
                connection.sp_entity_id
            )));
        }
    }

    Ok(Conditions {
        not_before,
        not_on_or_after,
        audience: connection.sp_entity_id.clone(),
    })
}

struct Confirmation {
    recipient: String,
    in_response_to: Option<String>,
}

fn check_subject_confirmation(
    assertion: Node<'_, '_>,
    ctx: &ValidationContext<'_>,
) -> Result<Confirmation, AssertionError> {
    let subject = child(assertion, ASSERTION_NS, "Subject")
        .ok_or_else(|| AssertionError::MalformedResponse("assertion has no Subject".into()))?;

    let data = children(subject, ASSERTION_NS, "SubjectConfirmation")
        .filter(|c| c.attribute("Method") == Some(BEARER))
        .find_map(|c| child(c, ASSERTION_NS, "SubjectConfirmationData"))
        .ok_or_else(|| {
            AssertionError::ConditionsNotMet("no bearer SubjectConfirmation".into())
        })?;

    let recipient = data.attribute("Recipient").unwrap_or_default();
    if recipient != ctx.acs_url {
        return Err(AssertionError::RecipientMismatch {
            expected: ctx.acs_url.to_string(),
            actual: recipient.to_string(),
        });
    }

    let not_on_or_after = time_attribute(data, "NotOnOrAfter")?.ok_or_else(|| {
        AssertionError::ConditionsNotMet("SubjectConfirmationData has no NotOnOrAfter".into())
    })?;
    if ctx.now >= not_on_or_after + ctx.clock_skew {
        return Err(AssertionError::ConditionsNotMet(
            "subject confirmation has expired".into(),
        ));
    }

    Ok(Confirmation {
        recipient: recipient.to_string(),
        in_response_to: data.attribute("InResponseTo").map(str::to_string),
    })
}

fn check_in_response_to(
    response: Option<&str>,
    confirmation: Option<&str>,
    ctx: &ValidationContext<'_>,
) -> Result<(), AssertionError> {
    if response.is_none() && confirmation.is_none() {
        return Err(AssertionError::RequestIdMismatch);
    }
    let expected = ctx.request_id.as_bytes();
    for value in [response, confirmation].into_iter().flatten() {
        if !bool::from(subtle::ConstantTimeEq::ct_eq(value.as_bytes(), expected)) {
            return Err(AssertionError::RequestIdMismatch);
        }
    }
    Ok(())
}

struct Attribute {
    name: String,
    friendly_name: Option<String>,
    value: String,
}

fn extract_attributes(assertion: Node<'_, '_>) -> Result<Vec<Attribute>, AssertionError> {
    let mut attributes = Vec::new();
    for attr in children(assertion, ASSERTION_NS, "AttributeStatement")
        .flat_map(|statement| children(statement, ASSERTION_NS, "Attribute"))
    {
        let Some(name) = attr.attribute("Name") else {
            continue;
        };
        let Some(value) = children(attr, ASSERTION_NS, "AttributeValue").next() else {
            continue;
        };
        attributes.push(Attribute {
            name: name.to_string(),
            friendly_name: attr.attribute("FriendlyName").map(str::to_string),
            value: element_text(value)?,
        });
    }
    Ok(attributes)
}

/// Attribute values keyed by `Name`. A repeated name keeps its first value,
/// matching [`lookup`].
fn first_values(attributes: Vec<Attribute>) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for attribute in attributes {
        values.entry(attribute.name).or_insert(attribute.value);
    }
    values
}

fn lookup(attributes: &[Attribute], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|a| a.name == name)
        .or_else(|| {
            attributes
                .iter()
                .find(|a| a.friendly_name.as_deref() == Some(name))
        })
        .map(|a| a.value.clone())
        .filter(|v| !v.is_empty())
}

fn time_attribute(node: Node<'_, '_>, name: &str) -> Result<Option<DateTime<Utc>>, AssertionError> {
    node.attribute(name)
        .map(|value| {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| AssertionError::MalformedResponse(format!("invalid {name} '{value}'")))
        })
        .transpose()
}

fn child_text(node: Node<'_, '_>, ns: &str, name: &str) -> Result<Option<String>, AssertionError> {
    child(node, ns, name).map(element_text).transpose()
}

/// The full character content of a simple-content element, trimmed.
///
/// Every text child is concatenated. Comments and processing instructions
/// are not part of the canonical form a signature covers, so reading only
/// the first text node would let `a<!---->b` be signed as `ab` and read
/// as `a`. Element children are rejected.
fn element_text(node: Node<'_, '_>) -> Result<String, AssertionError> {
    let mut text = String::new();
    for child in node.children() {
        if child.is_element() {
            return Err(AssertionError::MalformedResponse(format!(
                "unexpected element inside <{}>",
                node.tag_name().name()
            )));
        }
        if child.is_text()
            && let Some(t) = child.text()
        {
            text.push_str(t);
        }
    }
    Ok(text.trim().to_string())
}

fn is(node: Node<'_, '_>, ns: &str, name: &str) -> bool {
    node.is_element() && node.tag_name().namespace() == Some(ns) && node.tag_name().name() == name
}
