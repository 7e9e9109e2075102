//! Signed service-provider metadata.
//!
//! The generator renders the base `EntityDescriptor`/`SPSSODescriptor`
//! document, decorates it with the SPID-specific parts (attribute consuming
//! services, organization, contact persons with their extension trees) and
//! signs the whole descriptor with the signature as its first child, which
//! is where the federation registry expects it.

use tracing::debug;
use uuid::Uuid;

use crate::binding::Binding;
use crate::config::{normalize_pem, BillingContactPerson, ProviderType, SpidConfig};
use crate::error::{SpidError, SpidResult};
use crate::saml::signing::{sign_document, SignRequest, SignaturePosition, SigningCredentials};
use crate::saml::{
    NAMEID_FORMAT_TRANSIENT, SAML_METADATA_NS, SAML_PROTOCOL_NS, SPID_EXTENSIONS_NS,
    SPID_INVOICING_NS, XML_DSIG_NS,
};
use crate::xml::{xml_escape, XmlDocument, XmlElement};

/// Generates the signed metadata document for one service provider.
pub struct MetadataGenerator<'a> {
    config: &'a SpidConfig,
    credentials: &'a SigningCredentials,
}

impl<'a> MetadataGenerator<'a> {
    pub fn new(config: &'a SpidConfig, credentials: &'a SigningCredentials) -> Self {
        Self {
            config,
            credentials,
        }
    }

    pub fn generate(&self) -> SpidResult<String> {
        let sp = &self.config.service_provider;
        match sp.provider_type {
            ProviderType::Public => {
                let has_ipa_code = sp
                    .contact_person
                    .ipa_code
                    .as_deref()
                    .is_some_and(|code| !code.trim().is_empty());
                if !has_ipa_code {
                    return Err(SpidError::Configuration(
                        "public service providers must publish an IPA code".to_string(),
                    ));
                }
            }
            ProviderType::Private => {
                if sp.billing_contact_person.is_none() {
                    return Err(SpidError::Configuration(
                        "private service providers must publish a billing contact person"
                            .to_string(),
                    ));
                }
            }
        }

        let base = self.base_document();
        let mut doc = XmlDocument::parse(&base)?;

        doc.root_mut().set_attr("xmlns:spid", SPID_EXTENSIONS_NS);

        let descriptor = doc
            .find_first_mut("SPSSODescriptor", Some(SAML_METADATA_NS))
            .ok_or_else(|| {
                SpidError::Parse("metadata template lacks an SPSSODescriptor".to_string())
            })?;
        for (index, service) in sp.attribute_consuming_services.iter().enumerate() {
            let mut consuming = XmlElement::new(
                "md:AttributeConsumingService",
                Some(SAML_METADATA_NS),
            )
            .with_attr("index", &index.to_string());
            consuming.push_child(
                XmlElement::new("md:ServiceName", Some(SAML_METADATA_NS))
                    .with_attr("xml:lang", "it")
                    .with_text(&service.name),
            );
            for attribute in &service.attributes {
                consuming.push_child(
                    XmlElement::new("md:RequestedAttribute", Some(SAML_METADATA_NS))
                        .with_attr("Name", attribute.as_str()),
                );
            }
            descriptor.push_child(consuming);
        }

        let root = doc.root_mut();
        root.push_child(self.organization_element());
        root.push_child(self.primary_contact_element());
        if let Some(billing) = &sp.billing_contact_person {
            root.push_child(billing_contact_element(billing));
        }

        let signed = sign_document(
            &doc.to_xml(),
            self.credentials,
            &SignRequest {
                algorithm: self.config.saml.signature_algorithm,
                target: "EntityDescriptor".to_string(),
                position: SignaturePosition::Prepend,
            },
        )?;
        debug!(
            entity_id = %sp.entity_id,
            services = sp.attribute_consuming_services.len(),
            "generated service provider metadata"
        );
        Ok(signed)
    }

    fn base_document(&self) -> String {
        let saml = &self.config.saml;
        let sp = &self.config.service_provider;
        let document_id = format!("_{}", Uuid::new_v4().simple());
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <md:EntityDescriptor xmlns:md=\"{SAML_METADATA_NS}\" \
             xmlns:ds=\"{XML_DSIG_NS}\" \
             ID=\"{document_id}\" entityID=\"{entity_id}\">\
             <md:SPSSODescriptor protocolSupportEnumeration=\"{SAML_PROTOCOL_NS}\" \
             AuthnRequestsSigned=\"true\" WantAssertionsSigned=\"true\">\
             <md:KeyDescriptor use=\"signing\"><ds:KeyInfo><ds:X509Data>\
             <ds:X509Certificate>{certificate}</ds:X509Certificate>\
             </ds:X509Data></ds:KeyInfo></md:KeyDescriptor>\
             <md:SingleLogoutService Binding=\"{post_binding}\" Location=\"{slo_url}\"/>\
             <md:NameIDFormat>{nameid_format}</md:NameIDFormat>\
             <md:AssertionConsumerService Binding=\"{post_binding}\" \
             Location=\"{acs_url}\" index=\"0\" isDefault=\"true\"/>\
             </md:SPSSODescriptor>\
             </md:EntityDescriptor>",
            entity_id = xml_escape(&sp.entity_id),
            certificate = normalize_pem(&sp.certificate),
            post_binding = Binding::HttpPost.uri(),
            slo_url = xml_escape(&saml.logout_callback_url),
            nameid_format = NAMEID_FORMAT_TRANSIENT,
            acs_url = xml_escape(&saml.callback_url),
        )
    }

    /// Organization names grouped by element kind, languages in sorted
    /// order within each group.
    fn organization_element(&self) -> XmlElement {
        let organization = &self.config.service_provider.organization;
        let mut element = XmlElement::new("md:Organization", Some(SAML_METADATA_NS));
        for (language, entry) in organization {
            element.push_child(
                XmlElement::new("md:OrganizationName", Some(SAML_METADATA_NS))
                    .with_attr("xml:lang", language)
                    .with_text(&entry.name),
            );
        }
        for (language, entry) in organization {
            element.push_child(
                XmlElement::new("md:OrganizationDisplayName", Some(SAML_METADATA_NS))
                    .with_attr("xml:lang", language)
                    .with_text(&entry.display_name),
            );
        }
        for (language, entry) in organization {
            element.push_child(
                XmlElement::new("md:OrganizationURL", Some(SAML_METADATA_NS))
                    .with_attr("xml:lang", language)
                    .with_text(&entry.url),
            );
        }
        element
    }

    fn primary_contact_element(&self) -> XmlElement {
        let sp = &self.config.service_provider;
        let contact = &sp.contact_person;

        let mut extensions = XmlElement::new("md:Extensions", Some(SAML_METADATA_NS));
        if let Some(vat_number) = &contact.vat_number {
            extensions.push_child(
                XmlElement::new("spid:VATNumber", Some(SPID_EXTENSIONS_NS)).with_text(vat_number),
            );
        }
        if let Some(ipa_code) = &contact.ipa_code {
            extensions.push_child(
                XmlElement::new("spid:IPACode", Some(SPID_EXTENSIONS_NS)).with_text(ipa_code),
            );
        }
        if let Some(fiscal_code) = &contact.fiscal_code {
            extensions.push_child(
                XmlElement::new("spid:FiscalCode", Some(SPID_EXTENSIONS_NS)).with_text(fiscal_code),
            );
        }
        let marker = match sp.provider_type {
            ProviderType::Public => "spid:Public",
            ProviderType::Private => "spid:Private",
        };
        extensions.push_child(XmlElement::new(marker, Some(SPID_EXTENSIONS_NS)));

        let mut person = XmlElement::new("md:ContactPerson", Some(SAML_METADATA_NS))
            .with_attr("contactType", "other");
        person.push_child(extensions);
        if let Some(organization) = sp.organization.get("it") {
            person.push_child(
                XmlElement::new("md:Company", Some(SAML_METADATA_NS))
                    .with_text(&organization.name),
            );
        }
        person.push_child(
            XmlElement::new("md:EmailAddress", Some(SAML_METADATA_NS)).with_text(&contact.email),
        );
        if let Some(telephone) = &contact.telephone {
            person.push_child(
                XmlElement::new("md:TelephoneNumber", Some(SAML_METADATA_NS)).with_text(telephone),
            );
        }
        person
    }
}

/// Billing contact with the electronic-invoicing recipient tree private
/// providers must publish.
fn billing_contact_element(billing: &BillingContactPerson) -> XmlElement {
    let mut dati_anagrafici = XmlElement::new("fpa:DatiAnagrafici", Some(SPID_INVOICING_NS));
    if let Some(vat) = &billing.vat {
        dati_anagrafici.push_child(
            XmlElement::new("fpa:IdFiscaleIVA", Some(SPID_INVOICING_NS))
                .with_child(
                    XmlElement::new("fpa:IdPaese", Some(SPID_INVOICING_NS))
                        .with_text(&vat.country_id),
                )
                .with_child(
                    XmlElement::new("fpa:IdCodice", Some(SPID_INVOICING_NS)).with_text(&vat.code),
                ),
        );
    }
    if let Some(fiscal_code) = &billing.fiscal_code {
        dati_anagrafici.push_child(
            XmlElement::new("fpa:CodiceFiscale", Some(SPID_INVOICING_NS)).with_text(fiscal_code),
        );
    }
    let mut anagrafica = XmlElement::new("fpa:Anagrafica", Some(SPID_INVOICING_NS)).with_child(
        XmlElement::new("fpa:Denominazione", Some(SPID_INVOICING_NS))
            .with_text(&billing.personal_data.full_name),
    );
    if let Some(title) = &billing.personal_data.title {
        anagrafica
            .push_child(XmlElement::new("fpa:Titolo", Some(SPID_INVOICING_NS)).with_text(title));
    }
    if let Some(eori_code) = &billing.personal_data.eori_code {
        anagrafica.push_child(
            XmlElement::new("fpa:CodiceEORI", Some(SPID_INVOICING_NS)).with_text(eori_code),
        );
    }
    dati_anagrafici.push_child(anagrafica);

    let hq = &billing.headquarters;
    let mut sede = XmlElement::new("fpa:Sede", Some(SPID_INVOICING_NS)).with_child(
        XmlElement::new("fpa:Indirizzo", Some(SPID_INVOICING_NS)).with_text(&hq.address),
    );
    if let Some(street_number) = &hq.street_number {
        sede.push_child(
            XmlElement::new("fpa:NumeroCivico", Some(SPID_INVOICING_NS)).with_text(street_number),
        );
    }
    sede.push_child(XmlElement::new("fpa:CAP", Some(SPID_INVOICING_NS)).with_text(&hq.postal_code));
    sede.push_child(XmlElement::new("fpa:Comune", Some(SPID_INVOICING_NS)).with_text(&hq.city));
    if let Some(state) = &hq.state {
        sede.push_child(XmlElement::new("fpa:Provincia", Some(SPID_INVOICING_NS)).with_text(state));
    }
    sede.push_child(XmlElement::new("fpa:Nazione", Some(SPID_INVOICING_NS)).with_text(&hq.country));

    let mut extensions = XmlElement::new("md:Extensions", Some(SAML_METADATA_NS))
        .with_attr("xmlns:fpa", SPID_INVOICING_NS);
    extensions.push_child(
        XmlElement::new("fpa:CessionarioCommittente", Some(SPID_INVOICING_NS))
            .with_child(dati_anagrafici)
            .with_child(sede),
    );
    if let Some(intermediary) = &billing.third_party_intermediary {
        extensions.push_child(
            XmlElement::new(
                "fpa:TerzoIntermediarioSoggettoEmittente",
                Some(SPID_INVOICING_NS),
            )
            .with_text(intermediary),
        );
    }

    let mut person = XmlElement::new("md:ContactPerson", Some(SAML_METADATA_NS))
        .with_attr("contactType", "billing");
    person.push_child(extensions);
    if let Some(company) = &billing.company {
        person.push_child(XmlElement::new("md:Company", Some(SAML_METADATA_NS)).with_text(company));
    }
    person.push_child(
        XmlElement::new("md:EmailAddress", Some(SAML_METADATA_NS)).with_text(&billing.email),
    );
    person
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, AttributeConsumingService};
    use crate::saml::signing::test_credentials;
    use crate::saml::SpidAttribute;

    fn generate(provider_type: ProviderType) -> XmlDocument {
        let config = test_config(provider_type);
        let credentials =
            SigningCredentials::from_pem(&config.saml.private_key, Some(&config.service_provider.certificate))
                .unwrap();
        let xml = MetadataGenerator::new(&config, &credentials)
            .generate()
            .unwrap();
        XmlDocument::parse(&xml).unwrap()
    }

    #[test]
    fn test_signature_is_first_child_of_descriptor() {
        let doc = generate(ProviderType::Public);
        let root = doc.root();
        assert!(root.matches("EntityDescriptor", Some(SAML_METADATA_NS)));
        let first = root.child_elements().next().unwrap();
        assert!(first.matches("Signature", Some(XML_DSIG_NS)));

        let id = root.attr("ID").unwrap();
        let reference = doc.find_first("Reference", Some(XML_DSIG_NS)).unwrap();
        assert_eq!(reference.attr("URI").unwrap(), format!("#{id}"));
    }

    #[test]
    fn test_descriptor_carries_sp_profile() {
        let doc = generate(ProviderType::Public);
        let root = doc.root();
        assert_eq!(root.attr("entityID"), Some("https://sp.example.com"));
        assert_eq!(root.attr("xmlns:spid"), Some(SPID_EXTENSIONS_NS));

        let descriptor = doc.find_first("SPSSODescriptor", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(descriptor.attr("AuthnRequestsSigned"), Some("true"));
        assert_eq!(descriptor.attr("WantAssertionsSigned"), Some("true"));

        let acs = doc
            .find_first("AssertionConsumerService", Some(SAML_METADATA_NS))
            .unwrap();
        assert_eq!(acs.attr("index"), Some("0"));
        assert_eq!(acs.attr("isDefault"), Some("true"));
        assert_eq!(acs.attr("Location"), Some("https://sp.example.com/acs"));
        assert_eq!(acs.attr("Binding"), Some(Binding::HttpPost.uri()));

        let slo = doc
            .find_first("SingleLogoutService", Some(SAML_METADATA_NS))
            .unwrap();
        assert_eq!(slo.attr("Location"), Some("https://sp.example.com/slo"));

        let name_id_format = doc.find_first("NameIDFormat", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(name_id_format.text(), NAMEID_FORMAT_TRANSIENT);
    }

    #[test]
    fn test_attribute_consuming_services_are_listed() {
        let mut config = test_config(ProviderType::Public);
        config
            .service_provider
            .attribute_consuming_services
            .push(AttributeConsumingService {
                name: "acs1".to_string(),
                attributes: vec![SpidAttribute::Name, SpidAttribute::FamilyName],
            });
        let credentials = test_credentials();
        let xml = MetadataGenerator::new(&config, &credentials)
            .generate()
            .unwrap();
        let doc = XmlDocument::parse(&xml).unwrap();

        let services = doc.find_all("AttributeConsumingService", Some(SAML_METADATA_NS));
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].attr("index"), Some("0"));
        assert_eq!(services[1].attr("index"), Some("1"));

        let second_names: Vec<String> = services[1]
            .find_all("RequestedAttribute", Some(SAML_METADATA_NS))
            .iter()
            .filter_map(|el| el.attr("Name").map(str::to_string))
            .collect();
        assert_eq!(second_names, ["name", "familyName"]);

        let service_name = services[0].find_first("ServiceName", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(service_name.attr("xml:lang"), Some("it"));
        assert_eq!(service_name.text(), "acs0");
    }

    #[test]
    fn test_organization_groups_elements_by_kind() {
        let doc = generate(ProviderType::Public);
        let organization = doc.find_first("Organization", Some(SAML_METADATA_NS)).unwrap();
        let kinds: Vec<&str> = organization
            .child_elements()
            .map(|el| el.local_name.as_str())
            .collect();
        assert_eq!(
            kinds,
            ["OrganizationName", "OrganizationDisplayName", "OrganizationURL"]
        );
        let name = organization
            .child_first("OrganizationName", Some(SAML_METADATA_NS))
            .unwrap();
        assert_eq!(name.attr("xml:lang"), Some("it"));
        assert_eq!(name.text(), "Esempio SRL");
    }

    #[test]
    fn test_public_contact_person_extensions() {
        let doc = generate(ProviderType::Public);
        let person = doc.find_first("ContactPerson", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(person.attr("contactType"), Some("other"));

        assert!(doc.find_first("Public", Some(SPID_EXTENSIONS_NS)).is_some());
        assert!(doc.find_first("Private", Some(SPID_EXTENSIONS_NS)).is_none());
        let ipa_code = doc.find_first("IPACode", Some(SPID_EXTENSIONS_NS)).unwrap();
        assert_eq!(ipa_code.text(), "ipa_code_1");
        let email = person.find_first("EmailAddress", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(email.text(), "contact@esempio.example.com");
    }

    #[test]
    fn test_private_metadata_carries_billing_tree() {
        let doc = generate(ProviderType::Private);
        assert!(doc.find_first("Private", Some(SPID_EXTENSIONS_NS)).is_some());

        let persons = doc.find_all("ContactPerson", Some(SAML_METADATA_NS));
        assert_eq!(persons.len(), 2);
        let billing = persons
            .iter()
            .find(|person| person.attr("contactType") == Some("billing"))
            .unwrap();

        let extensions = billing.child_first("Extensions", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(extensions.attr("xmlns:fpa"), Some(SPID_INVOICING_NS));

        let cessionario = extensions
            .child_first("CessionarioCommittente", Some(SPID_INVOICING_NS))
            .unwrap();
        let id_paese = cessionario.find_first("IdPaese", Some(SPID_INVOICING_NS)).unwrap();
        assert_eq!(id_paese.text(), "IT");
        let denominazione = cessionario
            .find_first("Denominazione", Some(SPID_INVOICING_NS))
            .unwrap();
        assert_eq!(denominazione.text(), "Esempio SRL");
        let sede = cessionario.child_first("Sede", Some(SPID_INVOICING_NS)).unwrap();
        assert_eq!(
            sede.child_first("CAP", Some(SPID_INVOICING_NS)).unwrap().text(),
            "00100"
        );
        assert_eq!(
            sede.child_first("Nazione", Some(SPID_INVOICING_NS)).unwrap().text(),
            "IT"
        );
    }

    #[test]
    fn test_public_provider_without_ipa_code_fails() {
        let mut config = test_config(ProviderType::Public);
        config.service_provider.contact_person.ipa_code = None;
        let credentials = test_credentials();
        let result = MetadataGenerator::new(&config, &credentials).generate();
        assert!(matches!(result, Err(SpidError::Configuration(_))));
    }

    #[test]
    fn test_private_provider_without_billing_fails() {
        let mut config = test_config(ProviderType::Private);
        config.service_provider.billing_contact_person = None;
        let credentials = test_credentials();
        let result = MetadataGenerator::new(&config, &credentials).generate();
        assert!(matches!(result, Err(SpidError::Configuration(_))));
    }

    #[test]
    fn test_key_descriptor_publishes_the_certificate() {
        let config = test_config(ProviderType::Public);
        let credentials = SigningCredentials::from_pem(
            &config.saml.private_key,
            Some(&config.service_provider.certificate),
        )
        .unwrap();
        let xml = MetadataGenerator::new(&config, &credentials)
            .generate()
            .unwrap();
        let doc = XmlDocument::parse(&xml).unwrap();

        let key_descriptor = doc.find_first("KeyDescriptor", Some(SAML_METADATA_NS)).unwrap();
        assert_eq!(key_descriptor.attr("use"), Some("signing"));
        let certificate = key_descriptor
            .find_first("X509Certificate", Some(XML_DSIG_NS))
            .unwrap();
        assert_eq!(
            certificate.text(),
            normalize_pem(&config.service_provider.certificate)
        );
    }
}
