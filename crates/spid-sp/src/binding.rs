//! SAML binding codecs.
//!
//! HTTP-Redirect carries the request raw-deflated, base64- and
//! URL-encoded in the query string; HTTP-POST carries base64 XML in a
//! form field. Responses arrive over HTTP-POST only.

use std::io::Write;

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{SpidError, SpidResult};

/// Maximum accepted size for a base64 POST payload.
const MAX_ENCODED_SIZE: usize = 512 * 1024;

/// The SAML bindings this service provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    #[serde(rename = "HTTP-Redirect")]
    HttpRedirect,
    #[serde(rename = "HTTP-POST")]
    HttpPost,
}

impl Binding {
    #[must_use]
    pub fn uri(&self) -> &'static str {
        match self {
            Self::HttpRedirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            Self::HttpPost => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpRedirect => "HTTP-Redirect",
            Self::HttpPost => "HTTP-POST",
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw-deflates and base64-encodes XML for the redirect binding.
pub fn deflate_and_encode(xml: &str) -> SpidResult<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| SpidError::Parse(format!("deflate failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SpidError::Parse(format!("deflate failed: {e}")))?;
    Ok(STANDARD.encode(compressed))
}

/// Base64-encodes XML for the POST binding's `SAMLRequest` field.
pub fn encode_post(xml: &str) -> String {
    STANDARD.encode(xml.as_bytes())
}

/// Decodes a base64 `SAMLResponse` POST payload into XML.
pub fn decode_post(encoded: &str) -> SpidResult<String> {
    let encoded = encoded.trim();
    if encoded.len() > MAX_ENCODED_SIZE {
        return Err(SpidError::Parse(format!(
            "encoded payload exceeds {MAX_ENCODED_SIZE} bytes"
        )));
    }
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| SpidError::Parse(format!("invalid base64 payload: {e}")))?;
    String::from_utf8(decoded)
        .map_err(|e| SpidError::Parse(format!("payload is not valid UTF-8: {e}")))
}

/// Appends a prepared query string to a single sign-on URL.
pub fn redirect_url(sso_url: &str, query: &str) -> String {
    let separator = if sso_url.contains('?') { '&' } else { '?' };
    format!("{sso_url}{separator}{query}")
}
