//! XML digital signature verification for SAML messages.
//!
//! Supports the profile SAML IdPs use in practice: a single enveloped
//! signature per signed element, exclusive canonicalization (with an optional
//! `InclusiveNamespaces` prefix list), RSA PKCS#1 v1.5 with SHA-256 or
//! SHA-512. SHA-1 and inclusive canonicalization are rejected.
//!
//! The certificate embedded in `KeyInfo` is never consulted; only the
//! certificates registered on the connection are trusted.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Public},
    sign::Verifier,
    x509::X509,
};
use roxmltree::{Node, NodeId, NodeType};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, thiserror::Error)]
pub enum XmlDsigError {
    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("signature reference does not point at the signed element")]
    ReferenceMismatch,

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("no trusted certificate verifies the signature")]
    NoMatchingCertificate,

    #[error("invalid certificate: {0}")]
    Certificate(String),
}

/// Parse a trusted certificate given as PEM or bare base64 DER.
pub fn parse_certificate(cert: &str) -> Result<X509, XmlDsigError> {
    let cert = cert.trim();
    if cert.contains("-----BEGIN CERTIFICATE-----") {
        return X509::from_pem(cert.as_bytes()).map_err(|e| XmlDsigError::Certificate(e.to_string()));
    }
    let compact: String = cert.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(compact)
        .map_err(|e| XmlDsigError::Certificate(e.to_string()))?;
    X509::from_der(&der).map_err(|e| XmlDsigError::Certificate(e.to_string()))
}

/// Public keys of the certificates, in registration order.
pub fn trusted_keys(certs: &[String]) -> Result<Vec<PKey<Public>>, XmlDsigError> {
    certs
        .iter()
        .map(|cert| {
            parse_certificate(cert)?
                .public_key()
                .map_err(|e| XmlDsigError::Certificate(e.to_string()))
        })
        .collect()
}

/// The `ds:Signature` that is a direct child of `node`, if any.
pub fn signature_child<'a, 'input>(
    node: Node<'a, 'input>,
) -> Result<Option<Node<'a, 'input>>, XmlDsigError> {
    let mut signatures = children(node, DSIG_NS, "Signature");
    let first = signatures.next();
    if signatures.next().is_some() {
        return Err(XmlDsigError::Malformed(
            "element carries more than one signature".into(),
        ));
    }
    Ok(first)
}

/// Verify the enveloped signature of `signed` against `keys`, tried in order.
///
/// Returns the index of the first key that verifies.
pub fn verify_enveloped(signed: Node<'_, '_>, keys: &[PKey<Public>]) -> Result<usize, XmlDsigError> {
    let signature = signature_child(signed)?
        .ok_or_else(|| XmlDsigError::Malformed("element is not signed".into()))?;
    let id = signed
        .attribute("ID")
        .ok_or_else(|| XmlDsigError::Malformed("signed element has no ID".into()))?;

    let signed_info = required_child(signature, "SignedInfo")?;

    let c14n_method = required_child(signed_info, "CanonicalizationMethod")?;
    let c14n_algorithm = c14n_method.attribute("Algorithm").unwrap_or_default();
    if c14n_algorithm != EXC_C14N {
        return Err(XmlDsigError::UnsupportedAlgorithm(c14n_algorithm.into()));
    }
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let signature_algorithm = required_child(signed_info, "SignatureMethod")?
        .attribute("Algorithm")
        .unwrap_or_default();
    let message_digest = match signature_algorithm {
        RSA_SHA256 => MessageDigest::sha256(),
        RSA_SHA512 => MessageDigest::sha512(),
        other => return Err(XmlDsigError::UnsupportedAlgorithm(other.into())),
    };

    let mut references = children(signed_info, DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| XmlDsigError::Malformed("SignedInfo has no Reference".into()))?;
    if references.next().is_some() {
        return Err(XmlDsigError::Malformed(
            "SignedInfo has more than one Reference".into(),
        ));
    }
    let uri = reference.attribute("URI").unwrap_or_default();
    if uri.strip_prefix('#') != Some(id) {
        return Err(XmlDsigError::ReferenceMismatch);
    }

    let mut enveloped = false;
    let mut reference_prefixes = None;
    if let Some(transforms) = child(reference, DSIG_NS, "Transforms") {
        for transform in children(transforms, DSIG_NS, "Transform") {
            match transform.attribute("Algorithm").unwrap_or_default() {
                ENVELOPED_SIGNATURE => enveloped = true,
                EXC_C14N => reference_prefixes = Some(inclusive_prefixes(transform)),
                other => return Err(XmlDsigError::UnsupportedAlgorithm(other.into())),
            }
        }
    }
    if !enveloped {
        return Err(XmlDsigError::Malformed(
            "missing enveloped-signature transform".into(),
        ));
    }
    let reference_prefixes = reference_prefixes.ok_or_else(|| {
        XmlDsigError::Malformed("missing exclusive canonicalization transform".into())
    })?;

    let digest_algorithm = required_child(reference, "DigestMethod")?
        .attribute("Algorithm")
        .unwrap_or_default();
    let expected_digest = decode_base64_text(required_child(reference, "DigestValue")?)?;

    let canonical = canonicalize(signed, Some(signature.id()), &reference_prefixes)?;
    let actual_digest = match digest_algorithm {
        DIGEST_SHA256 => Sha256::digest(canonical.as_bytes()).to_vec(),
        DIGEST_SHA512 => Sha512::digest(canonical.as_bytes()).to_vec(),
        other => return Err(XmlDsigError::UnsupportedAlgorithm(other.into())),
    };
    if !bool::from(actual_digest.ct_eq(&expected_digest)) {
        return Err(XmlDsigError::DigestMismatch);
    }

    let signature_value = decode_base64_text(required_child(signature, "SignatureValue")?)?;
    let canonical_signed_info = canonicalize(signed_info, None, &signed_info_prefixes)?;

    for (index, key) in keys.iter().enumerate() {
        let mut verifier = Verifier::new(message_digest, key)
            .map_err(|e| XmlDsigError::Certificate(e.to_string()))?;
        verifier
            .update(canonical_signed_info.as_bytes())
            .map_err(|e| XmlDsigError::Certificate(e.to_string()))?;
        if verifier.verify(&signature_value).unwrap_or(false) {
            return Ok(index);
        }
    }

    Err(XmlDsigError::NoMatchingCertificate)
}

/// Exclusive XML canonicalization (without comments) of the subtree rooted
/// at `apex`, omitting the `exclude` subtree.
///
/// `inclusive` lists prefixes treated per inclusive canonicalization;
/// the empty string stands for the default namespace.
pub fn canonicalize(
    apex: Node<'_, '_>,
    exclude: Option<NodeId>,
    inclusive: &[String],
) -> Result<String, XmlDsigError> {
    if !apex.is_element() {
        return Err(XmlDsigError::Malformed("can only canonicalize elements".into()));
    }
    let mut out = String::new();
    write_element(apex, exclude, inclusive, &BTreeMap::new(), &mut out)?;
    Ok(out)
}

fn write_element(
    node: Node<'_, '_>,
    exclude: Option<NodeId>,
    inclusive: &[String],
    rendered: &BTreeMap<String, String>,
    out: &mut String,
) -> Result<(), XmlDsigError> {
    let qname = element_qname(node)?;
    let prefix = qname.split_once(':').map(|(p, _)| p).unwrap_or_default();

    // Namespaces visibly utilized by this element or its attributes
    let mut needed = BTreeMap::new();
    needed.insert(
        prefix.to_string(),
        node.tag_name().namespace().unwrap_or_default().to_string(),
    );

    let mut attributes = Vec::new();
    for attr in node.attributes() {
        match attr.namespace() {
            None => attributes.push((String::new(), attr.name(), attr.name().to_string(), attr.value())),
            Some(XML_NS) => attributes.push((
                XML_NS.to_string(),
                attr.name(),
                format!("xml:{}", attr.name()),
                attr.value(),
            )),
            Some(ns) => {
                let attr_prefix = prefix_for(node, ns).ok_or_else(|| {
                    XmlDsigError::Malformed(format!("no prefix in scope for namespace '{ns}'"))
                })?;
                let qualified = format!("{}:{}", attr_prefix, attr.name());
                needed.insert(attr_prefix, ns.to_string());
                attributes.push((ns.to_string(), attr.name(), qualified, attr.value()));
            }
        }
    }

    for inclusive_prefix in inclusive {
        if !needed.contains_key(inclusive_prefix)
            && let Some(uri) = in_scope_uri(node, inclusive_prefix)
        {
            needed.insert(inclusive_prefix.clone(), uri);
        }
    }

    let mut rendered = rendered.clone();
    out.push('<');
    out.push_str(qname);
    for (ns_prefix, uri) in &needed {
        let current = rendered.get(ns_prefix).map(String::as_str);
        if ns_prefix.is_empty() {
            if uri.as_str() != current.unwrap_or_default() {
                out.push_str(" xmlns=\"");
                escape_attribute(uri, out);
                out.push('"');
            }
        } else if current != Some(uri.as_str()) {
            out.push_str(" xmlns:");
            out.push_str(ns_prefix);
            out.push_str("=\"");
            escape_attribute(uri, out);
            out.push('"');
        }
        rendered.insert(ns_prefix.clone(), uri.clone());
    }

    attributes.sort_by(|a, b| (a.0.as_str(), a.1).cmp(&(b.0.as_str(), b.1)));
    for (_, _, name, value) in &attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attribute(value, out);
        out.push('"');
    }
    out.push('>');

    for child in node.children() {
        if Some(child.id()) == exclude {
            continue;
        }
        match child.node_type() {
            NodeType::Element => write_element(child, exclude, inclusive, &rendered, out)?,
            NodeType::Text => escape_text(child.text().unwrap_or_default(), out),
            NodeType::PI => {
                if let Some(pi) = child.pi() {
                    out.push_str("<?");
                    out.push_str(pi.target);
                    if let Some(value) = pi.value {
                        out.push(' ');
                        out.push_str(value);
                    }
                    out.push_str("?>");
                }
            }
            NodeType::Comment | NodeType::Root => {}
        }
    }

    out.push_str("</");
    out.push_str(qname);
    out.push('>');
    Ok(())
}

/// Qualified element name as written in the source document.
fn element_qname<'input>(node: Node<'_, 'input>) -> Result<&'input str, XmlDsigError> {
    let text = node.document().input_text();
    let rest = text
        .get(node.range().start + 1..)
        .ok_or_else(|| XmlDsigError::Malformed("element outside document".into()))?;
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .unwrap_or(rest.len());
    let qname = &rest[..end];

    let local = qname.rsplit(':').next().unwrap_or_default();
    if local != node.tag_name().name() {
        return Err(XmlDsigError::Malformed(format!(
            "cannot recover name of element '{}'",
            node.tag_name().name()
        )));
    }
    Ok(qname)
}

fn prefix_for(node: Node<'_, '_>, uri: &str) -> Option<String> {
    node.namespaces()
        .filter(|ns| ns.uri() == uri)
        .find_map(|ns| ns.name())
        .map(str::to_string)
}

fn in_scope_uri(node: Node<'_, '_>, prefix: &str) -> Option<String> {
    node.namespaces()
        .find(|ns| ns.name().unwrap_or_default() == prefix)
        .map(|ns| ns.uri().to_string())
}

fn inclusive_prefixes(method: Node<'_, '_>) -> Vec<String> {
    child(method, EXC_C14N, "InclusiveNamespaces")
        .and_then(|n| n.attribute("PrefixList"))
        .map(|list| {
            list.split_whitespace()
                .map(|p| if p == "#default" { String::new() } else { p.to_string() })
                .collect()
        })
        .unwrap_or_default()
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn decode_base64_text(node: Node<'_, '_>) -> Result<Vec<u8>, XmlDsigError> {
    let compact: String = node
        .text()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    STANDARD.decode(compact).map_err(|_| {
        XmlDsigError::Malformed(format!("{} is not base64", node.tag_name().name()))
    })
}

fn required_child<'a, 'input>(
    node: Node<'a, 'input>,
    name: &str,
) -> Result<Node<'a, 'input>, XmlDsigError> {
    child(node, DSIG_NS, name)
        .ok_or_else(|| XmlDsigError::Malformed(format!("missing {name}")))
}

pub(crate) fn child<'a, 'input>(
    node: Node<'a, 'input>,
    ns: &str,
    name: &str,
) -> Option<Node<'a, 'input>> {
    children(node, ns, name).next()
}

pub(crate) fn children<'a, 'input>(
    node: Node<'a, 'input>,
    ns: &str,
    name: &str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    let ns = ns.to_string();
    let name = name.to_string();
    node.children().filter(move |c| {
        c.is_element()
            && c.tag_name().namespace() == Some(ns.as_str())
            && c.tag_name().name() == name
    })
}
