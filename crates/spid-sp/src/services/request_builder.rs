//! Authentication request production.
//!
//! Requests are rendered as standard SAML 2.0 `AuthnRequest` documents and
//! then reshaped to the SPID profile: the `Issuer` becomes entity-qualified,
//! the `NameIDPolicy` drops `AllowCreate` and pins the transient format, and
//! levels above `SpidL1` force reauthentication. For the HTTP-POST binding
//! the document carries an enveloped signature placed after the `Issuer`;
//! redirect requests are signed at the query-string level instead.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::binding::Binding;
use crate::config::SpidConfig;
use crate::error::{SpidError, SpidResult};
use crate::saml::signing::{sign_document, SignRequest, SignaturePosition, SigningCredentials};
use crate::saml::{
    format_saml_instant, parse_saml_instant, ISSUER_FORMAT_ENTITY, NAMEID_FORMAT_TRANSIENT,
    SAML_ASSERTION_NS, SAML_PROTOCOL_NS,
};
use crate::services::idp_registry::IdentityProvider;
use crate::xml::{xml_escape, XmlDocument};

/// A freshly built authentication request, ready for delivery and for
/// correlation storage.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub request_id: String,
    pub issue_instant: DateTime<Utc>,
    /// Serialized request; signed when the configured binding is HTTP-POST.
    pub xml: String,
}

/// Builds SPID authentication requests for one service provider.
pub struct RequestBuilder<'a> {
    config: &'a SpidConfig,
    credentials: &'a SigningCredentials,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a SpidConfig, credentials: &'a SigningCredentials) -> Self {
        Self {
            config,
            credentials,
        }
    }

    /// Builds a request addressed to `idp`.
    pub fn build(&self, idp: &IdentityProvider) -> SpidResult<BuiltRequest> {
        let request_id = format!("_{}", Uuid::new_v4().simple());
        let issue_instant = Utc::now();

        let standard = self.standard_request(&request_id, &issue_instant, idp);
        let mut doc = XmlDocument::parse(&standard)?;
        self.apply_spid_profile(&mut doc)?;
        let xml = doc.to_xml();

        let xml = match self.config.saml.authn_request_binding {
            Binding::HttpPost => sign_document(
                &xml,
                self.credentials,
                &SignRequest {
                    algorithm: self.config.saml.signature_algorithm,
                    target: "AuthnRequest".to_string(),
                    position: SignaturePosition::After("Issuer".to_string()),
                },
            )?,
            Binding::HttpRedirect => xml,
        };

        debug!(
            request_id = %request_id,
            idp = %idp.entity_id,
            level = %self.config.saml.authn_context.uri(),
            "built authentication request"
        );
        Ok(BuiltRequest {
            request_id,
            issue_instant,
            xml,
        })
    }

    /// Renders the request as plain SAML 2.0, before SPID reshaping.
    /// `ProtocolBinding` names HTTP-POST because responses always return to
    /// the assertion consumer service by POST, whatever carried the request.
    fn standard_request(
        &self,
        request_id: &str,
        issue_instant: &DateTime<Utc>,
        idp: &IdentityProvider,
    ) -> String {
        let saml = &self.config.saml;
        let force_authn = if saml.authn_context.requires_force_authn() {
            " ForceAuthn=\"true\""
        } else {
            ""
        };
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <samlp:AuthnRequest xmlns:samlp=\"{SAML_PROTOCOL_NS}\" \
             xmlns:saml=\"{SAML_ASSERTION_NS}\" \
             ID=\"{request_id}\" Version=\"2.0\" \
             IssueInstant=\"{issue_instant}\" \
             Destination=\"{destination}\" \
             AssertionConsumerServiceURL=\"{acs_url}\" \
             ProtocolBinding=\"{post_binding}\" \
             AttributeConsumingServiceIndex=\"{acs_index}\"{force_authn}>\
             <saml:Issuer>{issuer}</saml:Issuer>\
             <samlp:NameIDPolicy Format=\"{nameid_format}\" AllowCreate=\"true\"/>\
             <samlp:RequestedAuthnContext Comparison=\"{comparison}\">\
             <saml:AuthnContextClassRef>{class_ref}</saml:AuthnContextClassRef>\
             </samlp:RequestedAuthnContext>\
             </samlp:AuthnRequest>",
            issue_instant = format_saml_instant(issue_instant),
            destination = xml_escape(&idp.sso_url),
            acs_url = xml_escape(&saml.callback_url),
            post_binding = Binding::HttpPost.uri(),
            acs_index = saml.attribute_consuming_service_index,
            issuer = xml_escape(&self.config.service_provider.entity_id),
            nameid_format = NAMEID_FORMAT_TRANSIENT,
            comparison = saml.rac_comparison,
            class_ref = saml.authn_context.uri(),
        )
    }

    /// Applies the SPID deviations from plain SAML 2.0.
    fn apply_spid_profile(&self, doc: &mut XmlDocument) -> SpidResult<()> {
        let root = doc.root_mut();
        if !root.matches("AuthnRequest", Some(SAML_PROTOCOL_NS)) {
            return Err(SpidError::Parse(
                "document is not a samlp:AuthnRequest".to_string(),
            ));
        }

        let entity_id = self.config.service_provider.entity_id.clone();
        let issuer = root
            .find_first_mut("Issuer", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::Parse("authentication request carries no Issuer".to_string())
            })?;
        issuer.set_attr("Format", ISSUER_FORMAT_ENTITY);
        issuer.set_attr("NameQualifier", &entity_id);

        if let Some(policy) = root.find_first_mut("NameIDPolicy", Some(SAML_PROTOCOL_NS)) {
            policy.set_attr("Format", NAMEID_FORMAT_TRANSIENT);
            policy.remove_attr("AllowCreate");
        }
        Ok(())
    }
}

/// The parts of a stored authentication request the response validator
/// reads back: identity, timing, and where the response must land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAuthnRequest {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub acs_url: String,
    pub acs_index: usize,
}

impl StoredAuthnRequest {
    pub fn parse(xml: &str) -> SpidResult<Self> {
        let doc = XmlDocument::parse(xml)?;
        let root = doc.root();
        if !root.matches("AuthnRequest", Some(SAML_PROTOCOL_NS)) {
            return Err(SpidError::Parse(
                "stored request is not a samlp:AuthnRequest".to_string(),
            ));
        }

        let id = required_attr(root.attr("ID"), "ID")?.to_string();
        let issue_instant = required_attr(root.attr("IssueInstant"), "IssueInstant")?;
        let issue_instant = parse_saml_instant(issue_instant).ok_or_else(|| {
            SpidError::Parse(format!(
                "stored request has unparseable IssueInstant '{issue_instant}'"
            ))
        })?;
        let acs_url =
            required_attr(root.attr("AssertionConsumerServiceURL"), "AssertionConsumerServiceURL")?
                .to_string();
        let acs_index = required_attr(
            root.attr("AttributeConsumingServiceIndex"),
            "AttributeConsumingServiceIndex",
        )?;
        let acs_index = acs_index.parse::<usize>().map_err(|_| {
            SpidError::Parse(format!(
                "stored request has unparseable AttributeConsumingServiceIndex '{acs_index}'"
            ))
        })?;

        Ok(Self {
            id,
            issue_instant,
            acs_url,
            acs_index,
        })
    }
}

fn required_attr<'v>(value: Option<&'v str>, name: &str) -> SpidResult<&'v str> {
    value.ok_or_else(|| SpidError::Parse(format!("stored request is missing {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, ProviderType};
    use crate::saml::signing::test_credentials;
    use crate::saml::{SpidLevel, XML_DSIG_NS};

    fn test_idp() -> IdentityProvider {
        IdentityProvider {
            entity_id: "https://idp.example.com".to_string(),
            certificate: String::new(),
            sso_url: "https://idp.example.com/sso".to_string(),
            slo_url: "https://idp.example.com/slo".to_string(),
        }
    }

    #[test]
    fn test_post_request_is_signed_after_issuer() {
        let config = test_config(ProviderType::Public);
        let credentials = test_credentials();
        let built = RequestBuilder::new(&config, &credentials)
            .build(&test_idp())
            .unwrap();

        let doc = XmlDocument::parse(&built.xml).unwrap();
        let names: Vec<&str> = doc
            .root()
            .child_elements()
            .map(|el| el.local_name.as_str())
            .collect();
        assert_eq!(
            names,
            ["Issuer", "Signature", "NameIDPolicy", "RequestedAuthnContext"]
        );
        let signature = doc.find_first("Signature", Some(XML_DSIG_NS)).unwrap();
        assert!(signature.find_first("X509Certificate", Some(XML_DSIG_NS)).is_some());
    }

    #[test]
    fn test_request_carries_spid_profile() {
        let config = test_config(ProviderType::Public);
        let credentials = test_credentials();
        let idp = test_idp();
        let built = RequestBuilder::new(&config, &credentials).build(&idp).unwrap();

        let doc = XmlDocument::parse(&built.xml).unwrap();
        let root = doc.root();
        assert_eq!(root.attr("ID"), Some(built.request_id.as_str()));
        assert_eq!(root.attr("Version"), Some("2.0"));
        assert_eq!(root.attr("Destination"), Some(idp.sso_url.as_str()));
        assert_eq!(
            root.attr("AssertionConsumerServiceURL"),
            Some(config.saml.callback_url.as_str())
        );
        assert_eq!(root.attr("ProtocolBinding"), Some(Binding::HttpPost.uri()));
        assert_eq!(root.attr("AttributeConsumingServiceIndex"), Some("0"));
        assert_eq!(root.attr("ForceAuthn"), Some("true"));

        let issuer = root.child_first("Issuer", Some(SAML_ASSERTION_NS)).unwrap();
        assert_eq!(issuer.text(), config.service_provider.entity_id);
        assert_eq!(issuer.attr("Format"), Some(ISSUER_FORMAT_ENTITY));
        assert_eq!(
            issuer.attr("NameQualifier"),
            Some(config.service_provider.entity_id.as_str())
        );

        let policy = root
            .child_first("NameIDPolicy", Some(SAML_PROTOCOL_NS))
            .unwrap();
        assert_eq!(policy.attr("Format"), Some(NAMEID_FORMAT_TRANSIENT));
        assert_eq!(policy.attr("AllowCreate"), None);

        let class_ref = doc
            .find_first("AuthnContextClassRef", Some(SAML_ASSERTION_NS))
            .unwrap();
        assert_eq!(class_ref.text(), SpidLevel::L2.uri());
    }

    #[test]
    fn test_level_one_does_not_force_reauthentication() {
        let mut config = test_config(ProviderType::Public);
        config.saml.authn_context = SpidLevel::L1;
        let credentials = test_credentials();
        let built = RequestBuilder::new(&config, &credentials)
            .build(&test_idp())
            .unwrap();

        let doc = XmlDocument::parse(&built.xml).unwrap();
        assert_eq!(doc.root().attr("ForceAuthn"), None);
        let class_ref = doc
            .find_first("AuthnContextClassRef", Some(SAML_ASSERTION_NS))
            .unwrap();
        assert_eq!(class_ref.text(), SpidLevel::L1.uri());
    }

    #[test]
    fn test_redirect_request_stays_unsigned() {
        let mut config = test_config(ProviderType::Public);
        config.saml.authn_request_binding = Binding::HttpRedirect;
        let credentials = test_credentials();
        let built = RequestBuilder::new(&config, &credentials)
            .build(&test_idp())
            .unwrap();

        let doc = XmlDocument::parse(&built.xml).unwrap();
        assert!(doc.find_first("Signature", Some(XML_DSIG_NS)).is_none());
    }

    #[test]
    fn test_stored_request_round_trips() {
        let config = test_config(ProviderType::Public);
        let credentials = test_credentials();
        let built = RequestBuilder::new(&config, &credentials)
            .build(&test_idp())
            .unwrap();

        let stored = StoredAuthnRequest::parse(&built.xml).unwrap();
        assert_eq!(stored.id, built.request_id);
        assert_eq!(stored.acs_url, config.saml.callback_url);
        assert_eq!(stored.acs_index, 0);
        // Serialized instants carry second precision.
        assert_eq!(
            stored.issue_instant,
            parse_saml_instant(&format_saml_instant(&built.issue_instant)).unwrap()
        );
    }

    #[test]
    fn test_stored_request_rejects_other_documents() {
        assert!(matches!(
            StoredAuthnRequest::parse("<Response xmlns=\"urn:oasis:names:tc:SAML:2.0:protocol\"/>"),
            Err(SpidError::Parse(_))
        ));
    }

    #[test]
    fn test_stored_request_requires_core_attributes() {
        let xml = "<samlp:AuthnRequest xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" \
                   ID=\"_x\" IssueInstant=\"2024-03-01T10:00:00Z\"/>";
        let err = StoredAuthnRequest::parse(xml).unwrap_err();
        assert!(err.to_string().contains("AssertionConsumerServiceURL"));
    }
}
