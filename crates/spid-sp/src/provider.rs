//! The service-provider facade.
//!
//! `SpidProvider` owns the validated configuration, the signing key, the
//! identity-provider registry and the correlation store, and exposes the
//! three operations a host application needs: start a login, finish a
//! login, and publish metadata. Everything is request-scoped; the only
//! shared state is the store, so logins for different request IDs run in
//! parallel without coordination.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::binding::{decode_post, deflate_and_encode, encode_post, redirect_url, Binding};
use crate::cache::{CorrelationRecord, CorrelationStore};
use crate::config::SpidConfig;
use crate::error::{SpidError, SpidResult};
use crate::saml::signing::{sign_redirect_query, SigningCredentials};
use crate::services::{
    IdpRegistry, MetadataGenerator, RequestBuilder, ResponseValidator, ValidatedProfile,
};
use crate::xml::XmlDocument;

/// An issued authentication request together with its delivery payload.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub request_id: String,
    pub idp_entity_id: String,
    /// The request document as stored for later correlation.
    pub request_xml: String,
    pub payload: LoginPayload,
}

/// How the host should deliver the request to the identity provider.
#[derive(Debug, Clone)]
pub enum LoginPayload {
    /// Location for a 302 redirect; the query string is already signed.
    Redirect { url: String },
    /// Fields for an auto-submitting form POST.
    Post {
        destination: String,
        saml_request: String,
        relay_state: Option<String>,
    },
}

/// SPID service provider over one configuration and identity federation.
pub struct SpidProvider {
    config: SpidConfig,
    credentials: SigningCredentials,
    registry: IdpRegistry,
    store: Arc<dyn CorrelationStore>,
}

impl SpidProvider {
    /// Validates the configuration, loads the signing key and the identity
    /// provider registry. Fails fast: anything wrong here would otherwise
    /// break every request later.
    pub fn new(
        config: SpidConfig,
        idp_metadata: &str,
        store: Arc<dyn CorrelationStore>,
    ) -> SpidResult<Self> {
        config.validate()?;
        let credentials = SigningCredentials::from_pem(
            &config.saml.private_key,
            Some(&config.service_provider.certificate),
        )?;
        let registry =
            IdpRegistry::from_metadata(idp_metadata, config.saml.authn_request_binding)?;
        info!(
            entity_id = %config.service_provider.entity_id,
            identity_providers = registry.len(),
            binding = %config.saml.authn_request_binding,
            "SPID provider initialized"
        );
        Ok(Self {
            config,
            credentials,
            registry,
            store,
        })
    }

    /// Starts a login: builds the request for the chosen identity provider
    /// (the registry default when `idp_entity_id` is `None`), stores it
    /// for correlation and returns the binding-specific delivery payload.
    ///
    /// `relay_state` is carried opaquely and, on the redirect binding,
    /// covered by the query signature.
    pub async fn generate_authn_request(
        &self,
        idp_entity_id: Option<&str>,
        relay_state: Option<&str>,
    ) -> SpidResult<LoginRequest> {
        let idp = match idp_entity_id {
            Some(entity_id) => self.registry.lookup(entity_id).ok_or_else(|| {
                SpidError::Configuration(format!("unknown identity provider '{entity_id}'"))
            })?,
            None => self.registry.default_provider().ok_or_else(|| {
                SpidError::Configuration("identity provider registry is empty".to_string())
            })?,
        };

        let built = RequestBuilder::new(&self.config, &self.credentials).build(idp)?;

        self.store
            .set(CorrelationRecord {
                request_id: built.request_id.clone(),
                request_xml: built.xml.clone(),
                idp_entity_id: idp.entity_id.clone(),
                issue_instant: built.issue_instant,
            })
            .await?;
        let ttl = Duration::from_millis(self.config.saml.request_id_expiration_ms);
        if !self.store.expire(&built.request_id, ttl).await? {
            self.schedule_local_expiry(built.request_id.clone(), ttl);
        }

        let payload = match self.config.saml.authn_request_binding {
            Binding::HttpRedirect => {
                let encoded = deflate_and_encode(&built.xml)?;
                let query = sign_redirect_query(
                    &self.credentials,
                    self.config.saml.signature_algorithm,
                    &encoded,
                    relay_state,
                )?;
                LoginPayload::Redirect {
                    url: redirect_url(&idp.sso_url, &query),
                }
            }
            Binding::HttpPost => LoginPayload::Post {
                destination: idp.sso_url.clone(),
                saml_request: encode_post(&built.xml),
                relay_state: relay_state.map(str::to_string),
            },
        };

        info!(
            request_id = %built.request_id,
            idp = %idp.entity_id,
            binding = %self.config.saml.authn_request_binding,
            "authentication request issued"
        );
        Ok(LoginRequest {
            request_id: built.request_id,
            idp_entity_id: idp.entity_id.clone(),
            request_xml: built.xml,
            payload,
        })
    }

    /// Finishes a login from the raw response XML: correlates it with the
    /// pending request, consumes the stored record and validates. The
    /// record is deleted before validation so a second response for the
    /// same request fails correlation regardless of its content.
    pub async fn validate_response(&self, response_xml: &str) -> SpidResult<ValidatedProfile> {
        let doc = XmlDocument::parse(response_xml)?;
        let in_response_to = doc
            .root()
            .attr("InResponseTo")
            .map(str::to_string)
            .ok_or_else(|| {
                SpidError::Correlation("response carries no InResponseTo".to_string())
            })?;

        let record = self.store.get(&in_response_to).await?.ok_or_else(|| {
            SpidError::Correlation(format!("no pending request for '{in_response_to}'"))
        })?;
        self.store.delete(&in_response_to).await?;

        match ResponseValidator::new(&self.config).validate(&doc, &record) {
            Ok(profile) => {
                info!(
                    request_id = %in_response_to,
                    idp = %record.idp_entity_id,
                    attributes = profile.attributes.len(),
                    "login completed"
                );
                Ok(profile)
            }
            Err(SpidError::Validation {
                rule,
                expected,
                observed,
            }) => {
                warn!(
                    request_id = %in_response_to,
                    rule = %rule,
                    expected = %expected,
                    observed = %observed,
                    "response rejected"
                );
                Err(SpidError::Validation {
                    rule,
                    expected,
                    observed,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Finishes a login from the base64 form field of the POST binding.
    pub async fn validate_post_response(&self, form_value: &str) -> SpidResult<ValidatedProfile> {
        let xml = decode_post(form_value)?;
        self.validate_response(&xml).await
    }

    /// The signed metadata document to publish at the metadata endpoint.
    pub fn service_provider_metadata(&self) -> SpidResult<String> {
        MetadataGenerator::new(&self.config, &self.credentials).generate()
    }

    pub fn registry(&self) -> &IdpRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SpidConfig {
        &self.config
    }

    /// Fallback cleanup for stores without native TTL support. Best
    /// effort; pending deletions are lost on process restart.
    fn schedule_local_expiry(&self, request_id: String, ttl: Duration) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(e) = store.delete(&request_id).await {
                debug!(request_id = %request_id, "deferred expiry cleanup failed: {e}");
            }
        });
    }
}
