//! Enveloped XML signatures and redirect-binding query signing.
//!
//! One coordinator signs every outgoing document: the caller names the
//! element to sign and where the `ds:Signature` must land. SPID places the
//! signature after the `Issuer` in authentication requests and as the
//! first child of the `EntityDescriptor` in metadata.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use xml_canonicalization::Canonicalizer;

use crate::error::{SpidError, SpidResult};
use crate::saml::XML_DSIG_NS;
use crate::xml::{XmlDocument, XmlElement, XmlNode};

const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";
const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// Digest and signature algorithm pair used for XML signatures and for
/// redirect query signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    #[must_use]
    pub fn signature_uri(&self) -> &'static str {
        match self {
            Self::Sha256 => RSA_SHA256,
            Self::Sha512 => RSA_SHA512,
        }
    }

    #[must_use]
    pub fn digest_uri(&self) -> &'static str {
        match self {
            Self::Sha256 => DIGEST_SHA256,
            Self::Sha512 => DIGEST_SHA512,
        }
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }
}

impl Default for SignatureAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

/// Where the `ds:Signature` element lands inside the signed element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignaturePosition {
    /// First child of the signed element.
    Prepend,
    /// Last child of the signed element.
    Append,
    /// Directly after the first child element with this local name.
    After(String),
}

/// A request to sign one element of a document.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub algorithm: SignatureAlgorithm,
    /// Local name of the element to sign.
    pub target: String,
    pub position: SignaturePosition,
}

/// RSA private key plus the certificate published in `ds:KeyInfo`.
pub struct SigningCredentials {
    private_key: PKey<Private>,
    certificate: Option<X509>,
}

impl SigningCredentials {
    /// Loads a PEM private key and, optionally, the matching certificate.
    /// The certificate may come with PEM armor or as bare base64.
    pub fn from_pem(private_key_pem: &str, certificate_pem: Option<&str>) -> SpidResult<Self> {
        let private_key = PKey::private_key_from_pem(private_key_pem.as_bytes())
            .map_err(|e| SpidError::Signing(format!("invalid private key: {e}")))?;
        let certificate = match certificate_pem {
            Some(pem) => Some(parse_certificate(pem)?),
            None => None,
        };
        Ok(Self {
            private_key,
            certificate,
        })
    }

    /// Signs raw bytes with RSA PKCS#1 v1.5 and the configured digest.
    pub fn sign(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> SpidResult<Vec<u8>> {
        let mut signer = Signer::new(algorithm.message_digest(), &self.private_key)
            .map_err(|e| SpidError::Signing(format!("failed to initialize signer: {e}")))?;
        signer
            .update(data)
            .map_err(|e| SpidError::Signing(format!("failed to feed signer: {e}")))?;
        signer
            .sign_to_vec()
            .map_err(|e| SpidError::Signing(format!("signing failed: {e}")))
    }

    /// Certificate as base64 DER, the form `ds:X509Certificate` carries.
    pub fn certificate_base64_der(&self) -> SpidResult<Option<String>> {
        match &self.certificate {
            Some(certificate) => {
                let der = certificate
                    .to_der()
                    .map_err(|e| SpidError::Signing(format!("certificate DER encoding failed: {e}")))?;
                Ok(Some(STANDARD.encode(der)))
            }
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn certificate(&self) -> Option<&X509> {
        self.certificate.as_ref()
    }
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("has_certificate", &self.certificate.is_some())
            .finish_non_exhaustive()
    }
}

/// Parses a certificate from PEM, wrapping bare base64 in armor first.
pub(crate) fn parse_certificate(pem: &str) -> SpidResult<X509> {
    let trimmed = pem.trim();
    let armored;
    let candidate = if trimmed.contains("-----BEGIN") {
        trimmed
    } else {
        armored = format!("-----BEGIN CERTIFICATE-----\n{trimmed}\n-----END CERTIFICATE-----");
        &armored
    };
    X509::from_pem(candidate.as_bytes())
        .map_err(|e| SpidError::Signing(format!("invalid certificate: {e}")))
}

/// Signs one element of `xml` with an enveloped XML signature and returns
/// the document with the `ds:Signature` inserted at the requested position.
///
/// The digest covers the exclusive canonicalization of the target element
/// with any existing signature children removed. The reference URI points
/// at the target's `ID` attribute when it has one.
pub fn sign_document(
    xml: &str,
    credentials: &SigningCredentials,
    request: &SignRequest,
) -> SpidResult<String> {
    let mut doc = XmlDocument::parse(xml)?;

    let mut detached = doc
        .detached_subtree(&request.target, None)
        .ok_or_else(|| {
            SpidError::Signing(format!("signable element <{}> not found", request.target))
        })?;
    detached.children.retain(|node| {
        !matches!(
            node,
            XmlNode::Element(el)
                if el.local_name == "Signature" && el.namespace.as_deref() == Some(XML_DSIG_NS)
        )
    });
    let reference_uri = detached
        .attr("ID")
        .map(|id| format!("#{id}"))
        .unwrap_or_default();

    let canonical = canonicalize_xml(&detached.to_xml())?;
    let digest = openssl::hash::hash(request.algorithm.message_digest(), canonical.as_bytes())
        .map_err(|e| SpidError::Signing(format!("digest computation failed: {e}")))?;
    let digest_value = STANDARD.encode(digest);

    let signed_info = format!(
        "<ds:SignedInfo xmlns:ds=\"{XML_DSIG_NS}\">\
         <ds:CanonicalizationMethod Algorithm=\"{EXCLUSIVE_C14N}\"/>\
         <ds:SignatureMethod Algorithm=\"{}\"/>\
         <ds:Reference URI=\"{reference_uri}\">\
         <ds:Transforms>\
         <ds:Transform Algorithm=\"{ENVELOPED_SIGNATURE}\"/>\
         <ds:Transform Algorithm=\"{EXCLUSIVE_C14N}\"/>\
         </ds:Transforms>\
         <ds:DigestMethod Algorithm=\"{}\"/>\
         <ds:DigestValue>{digest_value}</ds:DigestValue>\
         </ds:Reference>\
         </ds:SignedInfo>",
        request.algorithm.signature_uri(),
        request.algorithm.digest_uri(),
    );

    let canonical_signed_info = canonicalize_xml(&signed_info)?;
    let signature_value =
        STANDARD.encode(credentials.sign(request.algorithm, canonical_signed_info.as_bytes())?);

    let key_info = match credentials.certificate_base64_der()? {
        Some(certificate) => format!(
            "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"
        ),
        None => String::new(),
    };
    let signature_xml = format!(
        "<ds:Signature xmlns:ds=\"{XML_DSIG_NS}\">{signed_info}\
         <ds:SignatureValue>{signature_value}</ds:SignatureValue>{key_info}</ds:Signature>"
    );
    let signature = XmlDocument::parse(&signature_xml)?.into_root();

    let target = doc.find_first_mut(&request.target, None).ok_or_else(|| {
        SpidError::Signing(format!("signable element <{}> not found", request.target))
    })?;
    insert_signature(target, signature, &request.position)?;

    Ok(doc.to_xml())
}

fn insert_signature(
    target: &mut XmlElement,
    signature: XmlElement,
    position: &SignaturePosition,
) -> SpidResult<()> {
    match position {
        SignaturePosition::Prepend => target.insert_child(0, signature),
        SignaturePosition::Append => target.push_child(signature),
        SignaturePosition::After(anchor) => {
            let mut index = None;
            for (i, node) in target.children.iter().enumerate() {
                if let XmlNode::Element(el) = node {
                    if el.local_name == *anchor {
                        index = Some(i);
                        break;
                    }
                }
            }
            let index = index.ok_or_else(|| {
                SpidError::Signing(format!("signature anchor <{anchor}> not found"))
            })?;
            target.children.insert(index + 1, XmlNode::Element(signature));
        }
    }
    Ok(())
}

/// Builds the signed query string for the HTTP-Redirect binding:
/// `SAMLRequest=..[&RelayState=..]&SigAlg=..&Signature=..` with the
/// signature computed over everything before the `Signature` parameter.
pub fn sign_redirect_query(
    credentials: &SigningCredentials,
    algorithm: SignatureAlgorithm,
    encoded_request: &str,
    relay_state: Option<&str>,
) -> SpidResult<String> {
    let mut query = format!("SAMLRequest={}", urlencoding::encode(encoded_request));
    if let Some(relay_state) = relay_state {
        query.push_str("&RelayState=");
        query.push_str(&urlencoding::encode(relay_state));
    }
    query.push_str("&SigAlg=");
    query.push_str(&urlencoding::encode(algorithm.signature_uri()));

    let signature = credentials.sign(algorithm, query.as_bytes())?;
    query.push_str("&Signature=");
    query.push_str(&urlencoding::encode(&STANDARD.encode(signature)));
    Ok(query)
}

/// Canonicalizes XML using Exclusive C14N without comments.
pub(crate) fn canonicalize_xml(xml: &str) -> SpidResult<String> {
    let mut output = Vec::new();
    Canonicalizer::read_from_str(xml)
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| SpidError::Signing(format!("XML canonicalization failed: {e}")))?;
    String::from_utf8(output)
        .map_err(|e| SpidError::Signing(format!("canonicalized XML is not valid UTF-8: {e}")))
}

#[cfg(test)]
pub(crate) fn test_key_cert_pem() -> (String, String) {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "spid-sp test").unwrap();
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
    let certificate = builder.build();

    (
        String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
        String::from_utf8(certificate.to_pem().unwrap()).unwrap(),
    )
}

#[cfg(test)]
pub(crate) fn test_credentials() -> SigningCredentials {
    let (key, cert) = test_key_cert_pem();
    SigningCredentials::from_pem(&key, Some(&cert)).unwrap()
}
