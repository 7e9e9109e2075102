//! Identity-provider registry loaded from federation metadata.
//!
//! The registry is built once at startup from the federation's aggregate
//! metadata document and stays immutable afterwards. Each entity must
//! expose a signing certificate and both single sign-on and single logout
//! endpoints for the configured binding; anything missing is a load-time
//! configuration error, not something deferred to request time.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::asn1::Asn1Time;
use openssl::x509::X509;
use tracing::{debug, info};

use crate::binding::Binding;
use crate::config::normalize_pem;
use crate::error::{SpidError, SpidResult};
use crate::saml::{SAML_METADATA_NS, XML_DSIG_NS};
use crate::xml::{XmlDocument, XmlElement};

/// One identity provider as resolved from federation metadata.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    pub entity_id: String,
    /// Signing certificate as base64 DER, selected for current validity.
    pub certificate: String,
    /// Single sign-on endpoint for the binding requested at load.
    pub sso_url: String,
    /// Single logout endpoint for the binding requested at load.
    pub slo_url: String,
}

/// Ordered set of identity providers; the first entry is the default.
#[derive(Debug, Clone)]
pub struct IdpRegistry {
    providers: Vec<IdentityProvider>,
}

impl IdpRegistry {
    /// Loads every `EntityDescriptor` in `xml`, resolving endpoints for
    /// `binding`. Fails on the first unusable entity and on metadata that
    /// describes no identity provider at all.
    pub fn from_metadata(xml: &str, binding: Binding) -> SpidResult<Self> {
        let doc = XmlDocument::parse(xml)?;
        let mut providers = Vec::new();
        for descriptor in doc.find_all("EntityDescriptor", Some(SAML_METADATA_NS)) {
            providers.push(parse_entity(descriptor, binding)?);
        }
        if providers.is_empty() {
            return Err(SpidError::Configuration(
                "federation metadata describes no identity providers".to_string(),
            ));
        }
        info!(providers = providers.len(), binding = %binding, "identity provider registry loaded");
        Ok(Self { providers })
    }

    pub fn lookup(&self, entity_id: &str) -> Option<&IdentityProvider> {
        self.providers
            .iter()
            .find(|provider| provider.entity_id == entity_id)
    }

    /// First provider in metadata order.
    pub fn default_provider(&self) -> Option<&IdentityProvider> {
        self.providers.first()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityProvider> {
        self.providers.iter()
    }
}

fn parse_entity(descriptor: &XmlElement, binding: Binding) -> SpidResult<IdentityProvider> {
    let entity_id = descriptor.attr("entityID").ok_or_else(|| {
        SpidError::Configuration("metadata entity lacks an entityID".to_string())
    })?;

    let idp_descriptor = descriptor
        .child_first("IDPSSODescriptor", Some(SAML_METADATA_NS))
        .ok_or_else(|| {
            SpidError::Configuration(format!("'{entity_id}' has no IDPSSODescriptor"))
        })?;

    let mut candidates = Vec::new();
    for key_descriptor in idp_descriptor.child_elements() {
        if !key_descriptor.matches("KeyDescriptor", Some(SAML_METADATA_NS)) {
            continue;
        }
        // Unmarked keys count as usable for any purpose.
        match key_descriptor.attr("use") {
            Some("signing") | None => {}
            Some(_) => continue,
        }
        for certificate in key_descriptor.find_all("X509Certificate", Some(XML_DSIG_NS)) {
            let text = certificate.text();
            let normalized = normalize_pem(&text);
            if !normalized.is_empty() {
                candidates.push(normalized);
            }
        }
    }
    if candidates.is_empty() {
        return Err(SpidError::Configuration(format!(
            "'{entity_id}' exposes no signing certificate"
        )));
    }
    let certificate = select_certificate(entity_id, candidates);

    let sso_url =
        service_location(idp_descriptor, "SingleSignOnService", binding).ok_or_else(|| {
            SpidError::Configuration(format!(
                "'{entity_id}' has no single sign-on endpoint for {binding}"
            ))
        })?;
    let slo_url =
        service_location(idp_descriptor, "SingleLogoutService", binding).ok_or_else(|| {
            SpidError::Configuration(format!(
                "'{entity_id}' has no single logout endpoint for {binding}"
            ))
        })?;

    Ok(IdentityProvider {
        entity_id: entity_id.to_string(),
        certificate,
        sso_url,
        slo_url,
    })
}

/// Picks the first certificate whose validity window contains the current
/// time. When none qualifies the first candidate is kept anyway and the
/// failure surfaces later, at signature verification.
fn select_certificate(entity_id: &str, mut candidates: Vec<String>) -> String {
    let valid = candidates.iter().position(|candidate| {
        STANDARD
            .decode(candidate)
            .ok()
            .and_then(|der| X509::from_der(&der).ok())
            .is_some_and(|certificate| currently_valid(&certificate))
    });
    match valid {
        Some(index) => candidates.swap_remove(index),
        None => {
            debug!(
                idp = %entity_id,
                "metadata carries no currently valid signing certificate, \
                 deferring the failure to signature verification"
            );
            candidates.swap_remove(0)
        }
    }
}

fn currently_valid(certificate: &X509) -> bool {
    let Ok(now) = Asn1Time::days_from_now(0) else {
        return false;
    };
    certificate.not_before() <= now && certificate.not_after() >= now
}

fn service_location(
    descriptor: &XmlElement,
    service: &str,
    binding: Binding,
) -> Option<String> {
    descriptor
        .child_elements()
        .filter(|el| el.matches(service, Some(SAML_METADATA_NS)))
        .find(|el| el.attr("Binding") == Some(binding.uri()))
        .and_then(|el| el.attr("Location"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::SAML_PROTOCOL_NS;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    fn cert_base64_der(not_before: &Asn1Time, not_after: &Asn1Time) -> String {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "idp test").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(not_before).unwrap();
        builder.set_not_after(not_after).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        STANDARD.encode(builder.build().to_der().unwrap())
    }

    fn valid_cert() -> String {
        cert_base64_der(
            &Asn1Time::days_from_now(0).unwrap(),
            &Asn1Time::days_from_now(365).unwrap(),
        )
    }

    fn expired_cert() -> String {
        // 2000-01-01 .. 2001-01-01
        cert_base64_der(
            &Asn1Time::from_unix(946_684_800).unwrap(),
            &Asn1Time::from_unix(978_307_200).unwrap(),
        )
    }

    fn key_descriptor(use_attr: Option<&str>, certificate: &str) -> String {
        let use_attr = use_attr
            .map(|value| format!(" use=\"{value}\""))
            .unwrap_or_default();
        format!(
            "<md:KeyDescriptor{use_attr}><ds:KeyInfo xmlns:ds=\"{XML_DSIG_NS}\">\
             <ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data>\
             </ds:KeyInfo></md:KeyDescriptor>"
        )
    }

    fn entity_descriptor(entity_id: &str, key_descriptors: &str) -> String {
        format!(
            "<md:EntityDescriptor xmlns:md=\"{SAML_METADATA_NS}\" entityID=\"{entity_id}\">\
             <md:IDPSSODescriptor protocolSupportEnumeration=\"{SAML_PROTOCOL_NS}\">\
             {key_descriptors}\
             <md:SingleSignOnService Binding=\"{redirect}\" Location=\"{entity_id}/sso-redirect\"/>\
             <md:SingleSignOnService Binding=\"{post}\" Location=\"{entity_id}/sso-post\"/>\
             <md:SingleLogoutService Binding=\"{redirect}\" Location=\"{entity_id}/slo-redirect\"/>\
             <md:SingleLogoutService Binding=\"{post}\" Location=\"{entity_id}/slo-post\"/>\
             </md:IDPSSODescriptor>\
             </md:EntityDescriptor>",
            redirect = Binding::HttpRedirect.uri(),
            post = Binding::HttpPost.uri(),
        )
    }

    fn wrap_entities(entities: &str) -> String {
        format!(
            "<md:EntitiesDescriptor xmlns:md=\"{SAML_METADATA_NS}\">{entities}</md:EntitiesDescriptor>"
        )
    }

    #[test]
    fn test_single_entity_loads_with_redirect_endpoints() {
        let certificate = valid_cert();
        let xml = entity_descriptor(
            "https://idp.example.com",
            &key_descriptor(None, &certificate),
        );
        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
        assert_eq!(registry.len(), 1);

        let provider = registry.default_provider().unwrap();
        assert_eq!(provider.entity_id, "https://idp.example.com");
        assert_eq!(provider.certificate, certificate);
        assert_eq!(provider.sso_url, "https://idp.example.com/sso-redirect");
        assert_eq!(provider.slo_url, "https://idp.example.com/slo-redirect");
    }

    #[test]
    fn test_binding_selects_matching_endpoints() {
        let xml = entity_descriptor(
            "https://idp.example.com",
            &key_descriptor(Some("signing"), &valid_cert()),
        );
        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpPost).unwrap();
        let provider = registry.default_provider().unwrap();
        assert_eq!(provider.sso_url, "https://idp.example.com/sso-post");
        assert_eq!(provider.slo_url, "https://idp.example.com/slo-post");
    }

    #[test]
    fn test_valid_certificate_wins_regardless_of_order() {
        let valid = valid_cert();
        let expired = expired_cert();

        for descriptors in [
            format!(
                "{}{}",
                key_descriptor(Some("signing"), &expired),
                key_descriptor(Some("signing"), &valid)
            ),
            format!(
                "{}{}",
                key_descriptor(Some("signing"), &valid),
                key_descriptor(Some("signing"), &expired)
            ),
        ] {
            let xml = entity_descriptor("https://idp.example.com", &descriptors);
            let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
            assert_eq!(registry.default_provider().unwrap().certificate, valid);
        }
    }

    #[test]
    fn test_encryption_keys_are_not_candidates() {
        let encryption_only = valid_cert();
        let signing = valid_cert();
        let descriptors = format!(
            "{}{}",
            key_descriptor(Some("encryption"), &encryption_only),
            key_descriptor(Some("signing"), &signing)
        );
        let xml = entity_descriptor("https://idp.example.com", &descriptors);
        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
        assert_eq!(registry.default_provider().unwrap().certificate, signing);
    }

    #[test]
    fn test_expired_only_metadata_still_loads() {
        let expired = expired_cert();
        let xml = entity_descriptor(
            "https://idp.example.com",
            &key_descriptor(Some("signing"), &expired),
        );
        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
        assert_eq!(registry.default_provider().unwrap().certificate, expired);
    }

    #[test]
    fn test_unparseable_candidate_skipped_during_selection() {
        let valid = valid_cert();
        let descriptors = format!(
            "{}{}",
            key_descriptor(Some("signing"), "bm90IGEgY2VydGlmaWNhdGU="),
            key_descriptor(Some("signing"), &valid)
        );
        let xml = entity_descriptor("https://idp.example.com", &descriptors);
        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
        assert_eq!(registry.default_provider().unwrap().certificate, valid);
    }

    #[test]
    fn test_certificate_text_is_normalized() {
        let certificate = valid_cert();
        let (head, tail) = certificate.split_at(certificate.len() / 2);
        let wrapped = format!("\n        {head}\n        {tail}\n      ");
        let xml = entity_descriptor(
            "https://idp.example.com",
            &key_descriptor(Some("signing"), &wrapped),
        );
        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
        assert_eq!(registry.default_provider().unwrap().certificate, certificate);
    }

    #[test]
    fn test_missing_pieces_fail_at_load() {
        // No signing certificate at all.
        let xml = entity_descriptor("https://idp.example.com", "");
        assert!(matches!(
            IdpRegistry::from_metadata(&xml, Binding::HttpRedirect),
            Err(SpidError::Configuration(_))
        ));

        // No IDPSSODescriptor.
        let xml = format!(
            "<md:EntityDescriptor xmlns:md=\"{SAML_METADATA_NS}\" entityID=\"https://idp.example.com\"/>"
        );
        assert!(matches!(
            IdpRegistry::from_metadata(&xml, Binding::HttpRedirect),
            Err(SpidError::Configuration(_))
        ));

        // No entityID.
        let xml = format!("<md:EntityDescriptor xmlns:md=\"{SAML_METADATA_NS}\"/>");
        assert!(matches!(
            IdpRegistry::from_metadata(&xml, Binding::HttpRedirect),
            Err(SpidError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_logout_endpoint_fails_for_that_binding() {
        let xml = format!(
            "<md:EntityDescriptor xmlns:md=\"{SAML_METADATA_NS}\" entityID=\"https://idp.example.com\">\
             <md:IDPSSODescriptor>{keys}\
             <md:SingleSignOnService Binding=\"{redirect}\" Location=\"https://idp.example.com/sso\"/>\
             <md:SingleLogoutService Binding=\"{post}\" Location=\"https://idp.example.com/slo\"/>\
             </md:IDPSSODescriptor></md:EntityDescriptor>",
            keys = key_descriptor(Some("signing"), &valid_cert()),
            redirect = Binding::HttpRedirect.uri(),
            post = Binding::HttpPost.uri(),
        );
        let err = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap_err();
        assert!(err.to_string().contains("single logout"));
    }

    #[test]
    fn test_empty_metadata_fails() {
        let xml = wrap_entities("");
        assert!(matches!(
            IdpRegistry::from_metadata(&xml, Binding::HttpRedirect),
            Err(SpidError::Configuration(_))
        ));
    }

    #[test]
    fn test_multiple_entities_keep_document_order() {
        let first = entity_descriptor("https://idp-one.example.com", &key_descriptor(None, &valid_cert()));
        let second = entity_descriptor("https://idp-two.example.com", &key_descriptor(None, &valid_cert()));
        let xml = wrap_entities(&format!("{first}{second}"));

        let registry = IdpRegistry::from_metadata(&xml, Binding::HttpRedirect).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.default_provider().unwrap().entity_id,
            "https://idp-one.example.com"
        );
        assert!(registry.lookup("https://idp-two.example.com").is_some());
        assert!(registry.lookup("https://idp-three.example.com").is_none());

        let ids: Vec<&str> = registry.iter().map(|p| p.entity_id.as_str()).collect();
        assert_eq!(ids, ["https://idp-one.example.com", "https://idp-two.example.com"]);
    }
}
