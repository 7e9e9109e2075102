//! Service-provider workflows: authentication request production,
//! response validation, identity-provider federation metadata, and the
//! published service-provider metadata document.

pub mod idp_registry;
pub mod metadata_generator;
pub mod request_builder;
pub mod response_validator;

pub use idp_registry::{IdentityProvider, IdpRegistry};
pub use metadata_generator::MetadataGenerator;
pub use request_builder::{BuiltRequest, RequestBuilder, StoredAuthnRequest};
pub use response_validator::{ResponseValidator, ValidatedProfile};
