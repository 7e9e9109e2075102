//! SAML response validation against the SPID profile.
//!
//! The validator receives a parsed response together with the correlation
//! record of the request it answers, and walks a fixed sequence of checks.
//! The first violated check fails the whole validation with an error naming
//! that check and the expected versus observed values. The identity
//! provider is taken from the correlation record, never re-derived from the
//! response, so a response cannot talk itself into a different issuer.
//!
//! The validator never reads the wall clock. Every temporal check is
//! anchored to the instants carried by the request and the response, which
//! keeps validation deterministic and replayable from stored documents.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::cache::CorrelationRecord;
use crate::config::SpidConfig;
use crate::error::{SpidError, SpidResult, ValidationRule};
use crate::saml::{
    format_saml_instant, parse_saml_instant, AuthnContextComparison, SpidLevel,
    ISSUER_FORMAT_ENTITY, NAMEID_FORMAT_TRANSIENT, SAML_ASSERTION_NS, SAML_PROTOCOL_NS,
    STATUS_SUCCESS, SUBJECT_CONFIRMATION_METHOD_BEARER,
};
use crate::services::request_builder::StoredAuthnRequest;
use crate::xml::{XmlDocument, XmlElement};

/// The outcome of a successful validation: the authenticated subject and
/// the attributes the identity provider asserted.
#[derive(Debug, Clone)]
pub struct ValidatedProfile {
    /// Transient identifier the identity provider issued for this login.
    pub name_id: String,
    /// Session handle for single logout, when the assertion carries one.
    pub session_index: Option<String>,
    /// Asserted attributes keyed by wire name.
    pub attributes: HashMap<String, String>,
    /// When the response was issued.
    pub issue_instant: DateTime<Utc>,
    /// The originating request XML, kept for audit trails.
    pub request_xml: String,
}

/// Validates incoming responses for one service provider.
pub struct ResponseValidator<'a> {
    config: &'a SpidConfig,
}

impl<'a> ResponseValidator<'a> {
    pub fn new(config: &'a SpidConfig) -> Self {
        Self { config }
    }

    /// Runs every check in order and stops at the first violation.
    pub fn validate(
        &self,
        doc: &XmlDocument,
        record: &CorrelationRecord,
    ) -> SpidResult<ValidatedProfile> {
        let request = StoredAuthnRequest::parse(&record.request_xml)?;
        let saml = &self.config.saml;

        // Document shape: a samlp:Response wrapping one saml:Assertion.
        let response = doc.root();
        if !response.matches("Response", Some(SAML_PROTOCOL_NS)) {
            return Err(SpidError::violation(
                ValidationRule::ResponseStructure,
                "a samlp:Response document",
                format!("document element <{}>", response.local_name),
            ));
        }
        let assertion = response
            .child_first("Assertion", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::ResponseStructure,
                    "an assertion inside the response",
                    "no saml:Assertion element",
                )
            })?;

        if !response.attr("ID").is_some_and(|id| !id.trim().is_empty()) {
            return Err(SpidError::violation(
                ValidationRule::ResponseId,
                "a non-empty ID on the response",
                "missing or empty ID",
            ));
        }

        for (label, element) in [("response", response), ("assertion", assertion)] {
            let version = element.attr("Version").unwrap_or("(absent)");
            if version != "2.0" {
                return Err(SpidError::violation(
                    ValidationRule::Version,
                    "SAML version 2.0",
                    format!("{label} version {version}"),
                ));
            }
        }

        // Both issue instants must sit inside the window opened by the
        // original request, stretched by the tolerated clock skew.
        let response_instant = strict_instant(
            ValidationRule::IssueInstant,
            "the response",
            response.attr("IssueInstant"),
        )?;
        let assertion_instant = strict_instant(
            ValidationRule::IssueInstant,
            "the assertion",
            assertion.attr("IssueInstant"),
        )?;
        let skew = Duration::milliseconds(saml.accepted_clock_skew_ms as i64);
        let window_start = request.issue_instant - skew;
        let window_end =
            request.issue_instant + Duration::milliseconds(saml.request_id_expiration_ms as i64) + skew;
        for (label, instant) in [
            ("response", response_instant),
            ("assertion", assertion_instant),
        ] {
            if instant < window_start || instant >= window_end {
                return Err(SpidError::violation(
                    ValidationRule::IssueInstant,
                    format!(
                        "an instant in {} .. {}",
                        format_saml_instant(&window_start),
                        format_saml_instant(&window_end)
                    ),
                    format!("{label} issued at {}", format_saml_instant(&instant)),
                ));
            }
        }

        let destination = response.attr("Destination").unwrap_or("(absent)");
        if destination != saml.callback_url {
            return Err(SpidError::violation(
                ValidationRule::Destination,
                saml.callback_url.clone(),
                destination,
            ));
        }

        let status = response
            .child_first("Status", Some(SAML_PROTOCOL_NS))
            .and_then(|status| status.child_first("StatusCode", Some(SAML_PROTOCOL_NS)))
            .and_then(|code| code.attr("Value"))
            .unwrap_or("(absent)");
        if status != STATUS_SUCCESS {
            return Err(SpidError::violation(
                ValidationRule::StatusCode,
                STATUS_SUCCESS,
                status,
            ));
        }

        // Issuers at both levels must name the identity provider the
        // request went to.
        let response_issuer = response
            .child_first("Issuer", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::Issuer,
                    "an issuer on the response",
                    "no saml:Issuer element",
                )
            })?;
        let assertion_issuer = assertion
            .child_first("Issuer", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::Issuer,
                    "an issuer on the assertion",
                    "no saml:Issuer element",
                )
            })?;
        for (label, issuer) in [
            ("response", response_issuer),
            ("assertion", assertion_issuer),
        ] {
            let text = issuer.text();
            let text = text.trim();
            if text != record.idp_entity_id {
                return Err(SpidError::violation(
                    ValidationRule::Issuer,
                    format!("issuer '{}'", record.idp_entity_id),
                    format!("{label} issuer '{text}'"),
                ));
            }
            if let Some(format) = issuer.attr("Format") {
                if format != ISSUER_FORMAT_ENTITY {
                    return Err(SpidError::violation(
                        ValidationRule::Issuer,
                        format!("issuer format {ISSUER_FORMAT_ENTITY}"),
                        format!("{label} issuer format {format}"),
                    ));
                }
            }
        }

        let subject = assertion
            .child_first("Subject", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::NameId,
                    "a subject with a transient NameID",
                    "no saml:Subject element",
                )
            })?;
        let name_id = subject
            .child_first("NameID", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::NameId,
                    "a subject with a transient NameID",
                    "no saml:NameID element",
                )
            })?;
        let name_id_text = name_id.text();
        let name_id_text = name_id_text.trim();
        if name_id_text.is_empty() {
            return Err(SpidError::violation(
                ValidationRule::NameId,
                "a non-empty NameID",
                "empty NameID",
            ));
        }
        let name_id_format = name_id.attr("Format").unwrap_or("(absent)");
        if name_id_format != NAMEID_FORMAT_TRANSIENT {
            return Err(SpidError::violation(
                ValidationRule::NameId,
                format!("NameID format {NAMEID_FORMAT_TRANSIENT}"),
                name_id_format,
            ));
        }
        let name_qualifier = name_id.attr("NameQualifier").unwrap_or("(absent)");
        if name_qualifier != record.idp_entity_id {
            return Err(SpidError::violation(
                ValidationRule::NameId,
                format!("NameQualifier '{}'", record.idp_entity_id),
                format!("NameQualifier '{name_qualifier}'"),
            ));
        }

        let confirmation = subject
            .child_first("SubjectConfirmation", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::SubjectConfirmation,
                    "a bearer subject confirmation",
                    "no saml:SubjectConfirmation element",
                )
            })?;
        let method = confirmation.attr("Method").unwrap_or("(absent)");
        if method != SUBJECT_CONFIRMATION_METHOD_BEARER {
            return Err(SpidError::violation(
                ValidationRule::SubjectConfirmation,
                SUBJECT_CONFIRMATION_METHOD_BEARER,
                method,
            ));
        }

        // Confirmation data ties the assertion back to the stored request.
        let data = confirmation
            .child_first("SubjectConfirmationData", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::SubjectConfirmationData,
                    "subject confirmation data",
                    "no saml:SubjectConfirmationData element",
                )
            })?;
        let in_response_to = data.attr("InResponseTo").unwrap_or("(absent)");
        if in_response_to != request.id {
            return Err(SpidError::violation(
                ValidationRule::SubjectConfirmationData,
                format!("InResponseTo '{}'", request.id),
                format!("InResponseTo '{in_response_to}'"),
            ));
        }
        let recipient = data.attr("Recipient").unwrap_or("(absent)");
        if recipient != request.acs_url {
            return Err(SpidError::violation(
                ValidationRule::SubjectConfirmationData,
                format!("Recipient '{}'", request.acs_url),
                format!("Recipient '{recipient}'"),
            ));
        }
        let data_deadline = strict_instant(
            ValidationRule::SubjectConfirmationData,
            "SubjectConfirmationData NotOnOrAfter",
            data.attr("NotOnOrAfter"),
        )?;
        if data_deadline <= response_instant {
            return Err(SpidError::violation(
                ValidationRule::SubjectConfirmationData,
                format!(
                    "a NotOnOrAfter after {}",
                    format_saml_instant(&response_instant)
                ),
                format_saml_instant(&data_deadline),
            ));
        }

        let conditions = assertion
            .child_first("Conditions", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::Conditions,
                    "a conditions window",
                    "no saml:Conditions element",
                )
            })?;
        let not_before = strict_instant(
            ValidationRule::Conditions,
            "Conditions NotBefore",
            conditions.attr("NotBefore"),
        )?;
        let not_on_or_after = strict_instant(
            ValidationRule::Conditions,
            "Conditions NotOnOrAfter",
            conditions.attr("NotOnOrAfter"),
        )?;
        if not_before > response_instant {
            return Err(SpidError::violation(
                ValidationRule::Conditions,
                format!(
                    "a NotBefore at or before {}",
                    format_saml_instant(&response_instant)
                ),
                format_saml_instant(&not_before),
            ));
        }
        if not_on_or_after <= response_instant {
            return Err(SpidError::violation(
                ValidationRule::Conditions,
                format!(
                    "a NotOnOrAfter after {}",
                    format_saml_instant(&response_instant)
                ),
                format_saml_instant(&not_on_or_after),
            ));
        }

        // The achieved SPID level must satisfy the requested one under the
        // configured comparison.
        let authn_statement = assertion.child_first("AuthnStatement", Some(SAML_ASSERTION_NS));
        let class_ref = authn_statement
            .and_then(|statement| statement.child_first("AuthnContext", Some(SAML_ASSERTION_NS)))
            .and_then(|context| context.child_first("AuthnContextClassRef", Some(SAML_ASSERTION_NS)))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::AuthnContext,
                    "an AuthnContextClassRef naming a SPID level",
                    "no saml:AuthnContextClassRef element",
                )
            })?;
        let class_ref_text = class_ref.text();
        let class_ref_text = class_ref_text.trim();
        let achieved = SpidLevel::from_uri(class_ref_text).ok_or_else(|| {
            SpidError::violation(
                ValidationRule::AuthnContext,
                "one of the SPID level URIs",
                class_ref_text,
            )
        })?;
        let requested = saml.authn_context;
        let satisfied = match saml.rac_comparison {
            AuthnContextComparison::Minimum => achieved >= requested,
            AuthnContextComparison::Exact => achieved == requested,
            AuthnContextComparison::Better => achieved > requested,
            AuthnContextComparison::Maximum => true,
        };
        if !satisfied {
            return Err(SpidError::violation(
                ValidationRule::AuthnContext,
                format!("{} under {} comparison", requested.uri(), saml.rac_comparison),
                achieved.uri(),
            ));
        }
        let session_index = authn_statement
            .and_then(|statement| statement.attr("SessionIndex"))
            .map(str::to_string);

        let attributes = self.check_attributes(assertion, &request)?;

        debug!(
            request_id = %request.id,
            attributes = attributes.len(),
            "response validated"
        );
        Ok(ValidatedProfile {
            name_id: name_id_text.to_string(),
            session_index,
            attributes,
            issue_instant: response_instant,
            request_xml: record.request_xml.clone(),
        })
    }

    /// The returned attribute names must equal the set configured for the
    /// attribute consuming service the request cited, and every attribute
    /// must carry a value.
    fn check_attributes(
        &self,
        assertion: &XmlElement,
        request: &StoredAuthnRequest,
    ) -> SpidResult<HashMap<String, String>> {
        let services = &self.config.service_provider.attribute_consuming_services;
        let service = services.get(request.acs_index).ok_or_else(|| {
            SpidError::Configuration(format!(
                "request cites attribute consuming service {} but {} are configured",
                request.acs_index,
                services.len()
            ))
        })?;
        let mut expected: Vec<&str> = service
            .attributes
            .iter()
            .map(|attribute| attribute.as_str())
            .collect();
        expected.sort_unstable();

        let statement = assertion
            .child_first("AttributeStatement", Some(SAML_ASSERTION_NS))
            .ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::Attributes,
                    expected.join(", "),
                    "no saml:AttributeStatement element",
                )
            })?;

        let mut attributes = HashMap::new();
        let mut observed_names = Vec::new();
        for attribute in statement.child_elements() {
            if !attribute.matches("Attribute", Some(SAML_ASSERTION_NS)) {
                continue;
            }
            let name = attribute.attr("Name").ok_or_else(|| {
                SpidError::violation(
                    ValidationRule::Attributes,
                    "a Name on every returned attribute",
                    "an Attribute element without a Name",
                )
            })?;
            let value = attribute
                .child_first("AttributeValue", Some(SAML_ASSERTION_NS))
                .map(|el| el.text())
                .unwrap_or_default();
            let value = value.trim();
            if value.is_empty() {
                return Err(SpidError::violation(
                    ValidationRule::Attributes,
                    "a value for every returned attribute",
                    format!("attribute '{name}' has no value"),
                ));
            }
            observed_names.push(name.to_string());
            attributes.insert(name.to_string(), value.to_string());
        }

        let mut observed: Vec<&str> = observed_names.iter().map(String::as_str).collect();
        observed.sort_unstable();
        if observed != expected {
            let observed = if observed.is_empty() {
                "no attributes".to_string()
            } else {
                observed.join(", ")
            };
            return Err(SpidError::violation(
                ValidationRule::Attributes,
                expected.join(", "),
                observed,
            ));
        }
        Ok(attributes)
    }
}

fn strict_instant(
    rule: ValidationRule,
    label: &str,
    value: Option<&str>,
) -> SpidResult<DateTime<Utc>> {
    let value = value.ok_or_else(|| {
        SpidError::violation(rule, format!("a UTC timestamp on {label}"), "(absent)")
    })?;
    parse_saml_instant(value)
        .ok_or_else(|| SpidError::violation(rule, format!("a UTC timestamp on {label}"), value))
}
