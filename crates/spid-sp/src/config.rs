//! Service-provider configuration.
//!
//! Everything the provider needs to run: SAML settings (keys, binding,
//! requested authentication level, expiration windows) and the
//! service-provider identity published in metadata (entity ID, attribute
//! consuming services, organization and contact persons).

use std::collections::BTreeMap;

use openssl::pkey::PKey;
use serde::{Deserialize, Serialize};

use crate::binding::Binding;
use crate::error::{SpidError, SpidResult};
use crate::saml::signing::parse_certificate;
use crate::saml::{AuthnContextComparison, SignatureAlgorithm, SpidAttribute, SpidLevel};

/// Requests expire 15 minutes after issuance unless configured otherwise.
pub const DEFAULT_REQUEST_EXPIRATION_MS: u64 = 15 * 60 * 1000;

/// Complete SPID service-provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpidConfig {
    pub saml: SamlSettings,
    pub service_provider: ServiceProviderConfig,
}

/// SAML protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlSettings {
    /// Assertion consumer service URL responses are posted to.
    pub callback_url: String,
    /// Single logout response URL published in metadata.
    pub logout_callback_url: String,
    /// Binding used to deliver authentication requests.
    #[serde(default = "default_binding")]
    pub authn_request_binding: Binding,
    /// Algorithm pair for XML and redirect-query signatures.
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
    /// SPID level requested from the identity provider.
    pub authn_context: SpidLevel,
    /// Comparison mode sent in `RequestedAuthnContext`.
    #[serde(default = "default_rac_comparison")]
    pub rac_comparison: AuthnContextComparison,
    /// Which configured attribute consuming service requests cite.
    #[serde(default)]
    pub attribute_consuming_service_index: usize,
    /// How long an issued request stays answerable.
    #[serde(default = "default_request_expiration_ms")]
    pub request_id_expiration_ms: u64,
    /// Tolerated clock skew when checking response issue instants.
    #[serde(default)]
    pub accepted_clock_skew_ms: u64,
    /// PEM RSA private key used for signing.
    pub private_key: String,
}

/// The identity this service provider publishes in its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub entity_id: String,
    /// PEM certificate matching `saml.private_key`; bare base64 accepted.
    pub certificate: String,
    /// At least one service; requests reference these by index.
    pub attribute_consuming_services: Vec<AttributeConsumingService>,
    /// Organization descriptions keyed by language code; `it` is mandatory.
    pub organization: BTreeMap<String, Organization>,
    pub contact_person: ContactPerson,
    /// Mandatory for private service providers.
    #[serde(default)]
    pub billing_contact_person: Option<BillingContactPerson>,
}

/// Public administrations and private companies publish different
/// contact-person extension sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Public,
    Private,
}

/// A named set of attributes the service provider may request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeConsumingService {
    pub name: String,
    pub attributes: Vec<SpidAttribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

/// The `other` contact person with its SPID extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactPerson {
    pub email: String,
    #[serde(default)]
    pub telephone: Option<String>,
    #[serde(default)]
    pub vat_number: Option<String>,
    #[serde(default)]
    pub fiscal_code: Option<String>,
    /// Public-administration code; mandatory for public providers.
    #[serde(default)]
    pub ipa_code: Option<String>,
}

/// The `billing` contact person private providers publish, carrying the
/// electronic-invoicing recipient data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingContactPerson {
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub vat: Option<BillingVat>,
    #[serde(default)]
    pub fiscal_code: Option<String>,
    pub personal_data: BillingPersonalData,
    pub headquarters: BillingHeadquarters,
    #[serde(default)]
    pub third_party_intermediary: Option<String>,
}

/// `fpa:IdFiscaleIVA`: country prefix plus VAT code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingVat {
    pub country_id: String,
    pub code: String,
}

/// `fpa:Anagrafica`: the invoiced party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPersonalData {
    pub full_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub eori_code: Option<String>,
}

/// `fpa:Sede`: the invoicing address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingHeadquarters {
    pub address: String,
    #[serde(default)]
    pub street_number: Option<String>,
    pub postal_code: String,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    pub country: String,
}

fn default_binding() -> Binding {
    Binding::HttpRedirect
}

fn default_rac_comparison() -> AuthnContextComparison {
    AuthnContextComparison::Exact
}

fn default_request_expiration_ms() -> u64 {
    DEFAULT_REQUEST_EXPIRATION_MS
}

impl SpidConfig {
    /// Checks the configuration for everything that would otherwise fail
    /// at request or metadata time. Run once at provider startup.
    pub fn validate(&self) -> SpidResult<()> {
        let saml = &self.saml;
        let sp = &self.service_provider;

        if saml.callback_url.trim().is_empty() {
            return Err(config_error("saml.callback_url must not be empty"));
        }
        if saml.logout_callback_url.trim().is_empty() {
            return Err(config_error("saml.logout_callback_url must not be empty"));
        }
        if saml.request_id_expiration_ms == 0 {
            return Err(config_error("saml.request_id_expiration_ms must be positive"));
        }
        PKey::private_key_from_pem(saml.private_key.as_bytes())
            .map_err(|e| config_error(format!("saml.private_key is not a usable PEM key: {e}")))?;

        if sp.entity_id.trim().is_empty() {
            return Err(config_error("service_provider.entity_id must not be empty"));
        }
        parse_certificate(&sp.certificate).map_err(|e| {
            config_error(format!("service_provider.certificate is not usable: {e}"))
        })?;

        if sp.attribute_consuming_services.is_empty() {
            return Err(config_error(
                "service_provider.attribute_consuming_services must list at least one service",
            ));
        }
        for (index, service) in sp.attribute_consuming_services.iter().enumerate() {
            if service.name.trim().is_empty() {
                return Err(config_error(format!(
                    "attribute consuming service {index} has no name"
                )));
            }
            if service.attributes.is_empty() {
                return Err(config_error(format!(
                    "attribute consuming service {index} requests no attributes"
                )));
            }
        }
        if saml.attribute_consuming_service_index >= sp.attribute_consuming_services.len() {
            return Err(config_error(format!(
                "saml.attribute_consuming_service_index {} is out of range ({} services configured)",
                saml.attribute_consuming_service_index,
                sp.attribute_consuming_services.len()
            )));
        }

        if !sp.organization.contains_key("it") {
            return Err(config_error(
                "service_provider.organization must include an 'it' entry",
            ));
        }
        for (language, organization) in &sp.organization {
            if organization.name.trim().is_empty()
                || organization.display_name.trim().is_empty()
                || organization.url.trim().is_empty()
            {
                return Err(config_error(format!(
                    "organization entry '{language}' has empty fields"
                )));
            }
        }

        if sp.contact_person.email.trim().is_empty() {
            return Err(config_error(
                "service_provider.contact_person.email must not be empty",
            ));
        }
        match sp.provider_type {
            ProviderType::Public => {
                let has_ipa_code = sp
                    .contact_person
                    .ipa_code
                    .as_deref()
                    .is_some_and(|code| !code.trim().is_empty());
                if !has_ipa_code {
                    return Err(config_error(
                        "public service providers require contact_person.ipa_code",
                    ));
                }
            }
            ProviderType::Private => {
                let billing = sp.billing_contact_person.as_ref().ok_or_else(|| {
                    config_error("private service providers require billing_contact_person")
                })?;
                if billing.email.trim().is_empty() {
                    return Err(config_error("billing_contact_person.email must not be empty"));
                }
                if billing.personal_data.full_name.trim().is_empty() {
                    return Err(config_error(
                        "billing_contact_person.personal_data.full_name must not be empty",
                    ));
                }
                let hq = &billing.headquarters;
                if hq.address.trim().is_empty()
                    || hq.postal_code.trim().is_empty()
                    || hq.city.trim().is_empty()
                    || hq.country.trim().is_empty()
                {
                    return Err(config_error(
                        "billing_contact_person.headquarters is missing required fields",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> SpidError {
    SpidError::Configuration(message.into())
}

/// Strips PEM armor and whitespace, leaving the bare base64 body.
pub fn normalize_pem(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .collect()
}

/// Complete valid configuration with freshly generated key material.
#[cfg(test)]
pub(crate) fn test_config(provider_type: ProviderType) -> SpidConfig {
    use crate::saml::signing::test_key_cert_pem;

    let (private_key, certificate) = test_key_cert_pem();
    let mut organization = BTreeMap::new();
    organization.insert(
        "it".to_string(),
        Organization {
            name: "Esempio SRL".to_string(),
            display_name: "Esempio".to_string(),
            url: "https://esempio.example.com".to_string(),
        },
    );
    SpidConfig {
        saml: SamlSettings {
            callback_url: "https://sp.example.com/acs".to_string(),
            logout_callback_url: "https://sp.example.com/slo".to_string(),
            authn_request_binding: Binding::HttpPost,
            signature_algorithm: SignatureAlgorithm::Sha256,
            authn_context: SpidLevel::L2,
            rac_comparison: AuthnContextComparison::Exact,
            attribute_consuming_service_index: 0,
            request_id_expiration_ms: DEFAULT_REQUEST_EXPIRATION_MS,
            accepted_clock_skew_ms: 0,
            private_key,
        },
        service_provider: ServiceProviderConfig {
            provider_type,
            entity_id: "https://sp.example.com".to_string(),
            certificate,
            attribute_consuming_services: vec![AttributeConsumingService {
                name: "acs0".to_string(),
                attributes: vec![
                    SpidAttribute::SpidCode,
                    SpidAttribute::Email,
                    SpidAttribute::FiscalNumber,
                ],
            }],
            organization,
            contact_person: ContactPerson {
                email: "contact@esempio.example.com".to_string(),
                telephone: None,
                vat_number: Some("IT12345678901".to_string()),
                fiscal_code: None,
                ipa_code: match provider_type {
                    ProviderType::Public => Some("ipa_code_1".to_string()),
                    ProviderType::Private => None,
                },
            },
            billing_contact_person: match provider_type {
                ProviderType::Public => None,
                ProviderType::Private => Some(BillingContactPerson {
                    email: "billing@esempio.example.com".to_string(),
                    company: Some("Esempio SRL".to_string()),
                    vat: Some(BillingVat {
                        country_id: "IT".to_string(),
                        code: "12345678901".to_string(),
                    }),
                    fiscal_code: None,
                    personal_data: BillingPersonalData {
                        full_name: "Esempio SRL".to_string(),
                        title: None,
                        eori_code: None,
                    },
                    headquarters: BillingHeadquarters {
                        address: "Via Roma".to_string(),
                        street_number: Some("1".to_string()),
                        postal_code: "00100".to_string(),
                        city: "Roma".to_string(),
                        state: Some("RM".to_string()),
                        country: "IT".to_string(),
                    },
                    third_party_intermediary: None,
                }),
            },
        },
    }
}
