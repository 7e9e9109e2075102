//! SPID service-provider implementation of the SAML2 Web Browser SSO profile.
//!
//! This crate provides:
//! - Signed `AuthnRequest` production for the HTTP-POST and HTTP-Redirect bindings
//! - Request/response correlation through a pluggable async store
//! - Ordered validation of incoming responses against the SPID profile
//! - Identity-provider registry loading from federation metadata
//! - Signed service-provider metadata with the SPID and invoicing extensions
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spid_sp::{InMemoryCorrelationStore, LoginPayload, SpidProvider};
//!
//! let store = Arc::new(InMemoryCorrelationStore::new());
//! let provider = SpidProvider::new(config, &federation_metadata, store)?;
//!
//! // Start a login
//! let login = provider.generate_authn_request(None, Some("/dashboard")).await?;
//! if let LoginPayload::Redirect { url } = &login.payload {
//!     // 302 the browser to `url`
//! }
//!
//! // Finish it when the response posts back
//! let profile = provider.validate_post_response(&form.saml_response).await?;
//! println!("welcome {}", profile.name_id);
//! ```

pub mod binding;
pub mod cache;
pub mod config;
pub mod error;
pub mod provider;
pub mod saml;
pub mod services;
pub mod xml;

// Re-export public API
pub use binding::Binding;
pub use cache::{CorrelationRecord, CorrelationStore, InMemoryCorrelationStore, StoreError};
pub use config::{
    AttributeConsumingService, BillingContactPerson, ContactPerson, Organization, ProviderType,
    SamlSettings, ServiceProviderConfig, SpidConfig,
};
pub use error::{SpidError, SpidResult, ValidationRule};
pub use provider::{LoginPayload, LoginRequest, SpidProvider};
pub use saml::{AuthnContextComparison, SignatureAlgorithm, SpidAttribute, SpidLevel};
pub use services::{IdentityProvider, IdpRegistry, ValidatedProfile};
