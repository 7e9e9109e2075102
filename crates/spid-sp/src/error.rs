//! Error types for SPID service-provider operations.

use thiserror::Error;

use crate::cache::StoreError;

/// Result type for SPID operations.
pub type SpidResult<T> = Result<T, SpidError>;

/// Errors raised while building requests, validating responses or
/// generating metadata.
#[derive(Debug, Error)]
pub enum SpidError {
    /// Malformed XML or wire payload. Fatal for the message being processed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid or incomplete service-provider configuration, including
    /// federation metadata that cannot be loaded into the registry.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Signing failure: bad key material, canonicalization failure or a
    /// missing signature target.
    #[error("Signing error: {0}")]
    Signing(String),

    /// No pending request matches an incoming response, or the response
    /// carries no `InResponseTo` at all. Typically expiry, replay or a
    /// forged response.
    #[error("Correlation failure: {0}")]
    Correlation(String),

    /// Correlation store backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A response violated one of the ordered validation rules. Carries
    /// the rule that failed plus the expected and observed values.
    #[error("Validation failed ({rule}): expected {expected}, observed {observed}")]
    Validation {
        rule: ValidationRule,
        expected: String,
        observed: String,
    },
}

impl SpidError {
    /// Shorthand used by the response validator.
    pub(crate) fn violation(
        rule: ValidationRule,
        expected: impl Into<String>,
        observed: impl Into<String>,
    ) -> Self {
        Self::Validation {
            rule,
            expected: expected.into(),
            observed: observed.into(),
        }
    }
}

/// The ordered checks applied to an incoming SAML response.
///
/// Validation stops at the first violated rule, so an error names exactly
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    /// Document element is a `samlp:Response` containing one assertion.
    ResponseStructure,
    /// The response carries a non-empty `ID`.
    ResponseId,
    /// Response and assertion declare SAML version 2.0.
    Version,
    /// Response and assertion issue instants are well-formed and fall
    /// inside the originating request's expiration window.
    IssueInstant,
    /// `Destination` matches the configured assertion consumer URL.
    Destination,
    /// Top-level status code is `Success`.
    StatusCode,
    /// Response and assertion issuers match the identity provider the
    /// request was sent to.
    Issuer,
    /// Transient `NameID` qualified by the identity provider.
    NameId,
    /// Subject confirmation method is `bearer`.
    SubjectConfirmation,
    /// Subject confirmation data matches the original request and has not
    /// expired.
    SubjectConfirmationData,
    /// Assertion conditions window covers the response issue instant.
    Conditions,
    /// Achieved SPID authentication level satisfies the requested one.
    AuthnContext,
    /// Returned attributes match the requested attribute consuming service.
    Attributes,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResponseStructure => "response-structure",
            Self::ResponseId => "response-id",
            Self::Version => "saml-version",
            Self::IssueInstant => "issue-instant",
            Self::Destination => "destination",
            Self::StatusCode => "status-code",
            Self::Issuer => "issuer",
            Self::NameId => "name-id",
            Self::SubjectConfirmation => "subject-confirmation",
            Self::SubjectConfirmationData => "subject-confirmation-data",
            Self::Conditions => "conditions",
            Self::AuthnContext => "authn-context",
            Self::Attributes => "attribute-set",
        }
    }
}

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
