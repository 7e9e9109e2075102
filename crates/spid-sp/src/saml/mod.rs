//! SAML constants and SPID vocabulary shared across the crate.

use chrono::{DateTime, NaiveDateTime, Utc};

pub mod attributes;
pub mod signing;

pub use attributes::{
    idp_short_name, AuthnContextComparison, SpidAttribute, SpidLevel, SPID_IDP_IDENTIFIERS,
};
pub use signing::{SignatureAlgorithm, SignaturePosition, SignRequest, SigningCredentials};

pub const SAML_PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML_ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const SAML_METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const XML_DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Namespace for SPID service-provider metadata extensions.
pub const SPID_EXTENSIONS_NS: &str = "https://spid.gov.it/saml-extensions";
/// Namespace for the electronic invoicing extensions carried by private
/// service providers.
pub const SPID_INVOICING_NS: &str = "https://spid.gov.it/invoicing-extensions";

/// SPID mandates transient name identifiers.
pub const NAMEID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
/// Issuer elements are entity-qualified.
pub const ISSUER_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";
pub const SUBJECT_CONFIRMATION_METHOD_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Parses a SAML instant in the strict `YYYY-MM-DDThh:mm:ss(.sss)?Z` form.
/// Offsets other than `Z` are rejected.
pub(crate) fn parse_saml_instant(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.fZ")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Formats an instant the way outgoing SAML messages carry it.
pub(crate) fn format_saml_instant(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
