//! SPID attribute set, authentication levels and the public IdP registry.

use serde::{Deserialize, Serialize};

/// Attributes a SPID identity provider can assert about a subject.
///
/// The serialized names are the wire names used in metadata
/// (`RequestedAttribute/@Name`) and in assertion attribute statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpidAttribute {
    SpidCode,
    Name,
    FamilyName,
    PlaceOfBirth,
    DateOfBirth,
    Gender,
    CompanyName,
    RegisteredOffice,
    FiscalNumber,
    IvaCode,
    IdCard,
    MobilePhone,
    Email,
    Address,
    DigitalAddress,
}

impl SpidAttribute {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpidCode => "spidCode",
            Self::Name => "name",
            Self::FamilyName => "familyName",
            Self::PlaceOfBirth => "placeOfBirth",
            Self::DateOfBirth => "dateOfBirth",
            Self::Gender => "gender",
            Self::CompanyName => "companyName",
            Self::RegisteredOffice => "registeredOffice",
            Self::FiscalNumber => "fiscalNumber",
            Self::IvaCode => "ivaCode",
            Self::IdCard => "idCard",
            Self::MobilePhone => "mobilePhone",
            Self::Email => "email",
            Self::Address => "address",
            Self::DigitalAddress => "digitalAddress",
        }
    }

    /// Parses a wire name back into the enum.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "spidCode" => Self::SpidCode,
            "name" => Self::Name,
            "familyName" => Self::FamilyName,
            "placeOfBirth" => Self::PlaceOfBirth,
            "dateOfBirth" => Self::DateOfBirth,
            "gender" => Self::Gender,
            "companyName" => Self::CompanyName,
            "registeredOffice" => Self::RegisteredOffice,
            "fiscalNumber" => Self::FiscalNumber,
            "ivaCode" => Self::IvaCode,
            "idCard" => Self::IdCard,
            "mobilePhone" => Self::MobilePhone,
            "email" => Self::Email,
            "address" => Self::Address,
            "digitalAddress" => Self::DigitalAddress,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SpidAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SPID authentication levels, ordered by assurance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpidLevel {
    #[serde(rename = "SpidL1")]
    L1,
    #[serde(rename = "SpidL2")]
    L2,
    #[serde(rename = "SpidL3")]
    L3,
}

impl SpidLevel {
    #[must_use]
    pub fn uri(&self) -> &'static str {
        match self {
            Self::L1 => "https://www.spid.gov.it/SpidL1",
            Self::L2 => "https://www.spid.gov.it/SpidL2",
            Self::L3 => "https://www.spid.gov.it/SpidL3",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Some(match uri {
            "https://www.spid.gov.it/SpidL1" => Self::L1,
            "https://www.spid.gov.it/SpidL2" => Self::L2,
            "https://www.spid.gov.it/SpidL3" => Self::L3,
            _ => return None,
        })
    }

    /// Levels 2 and 3 force re-authentication at the identity provider.
    #[must_use]
    pub fn requires_force_authn(&self) -> bool {
        matches!(self, Self::L2 | Self::L3)
    }
}

/// How the requested authentication context is compared against the one
/// the identity provider achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthnContextComparison {
    /// Achieved level must be at least the requested one.
    Minimum,
    /// Achieved level must equal the requested one.
    Exact,
    /// Achieved level must exceed the requested one.
    Better,
    /// No lower bound on the achieved level.
    Maximum,
}

impl AuthnContextComparison {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimum => "minimum",
            Self::Exact => "exact",
            Self::Better => "better",
            Self::Maximum => "maximum",
        }
    }
}

impl std::fmt::Display for AuthnContextComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity IDs of the public SPID identity providers with their customary
/// short names. Useful for building IdP choice pages.
pub const SPID_IDP_IDENTIFIERS: &[(&str, &str)] = &[
    ("https://id.lepida.it/idp/shibboleth", "lepida"),
    ("https://identity.infocert.it", "infocert"),
    ("https://identity.sieltecloud.it", "sielte"),
    ("https://idp.namirialtsp.com/idp", "namirial"),
    (
        "https://login.id.tim.it/affwebservices/public/saml2sso",
        "tim",
    ),
    ("https://loginspid.aruba.it", "aruba"),
    ("https://posteid.poste.it", "poste"),
    ("https://spid.intesa.it", "intesa"),
    ("https://spid.register.it", "spiditalia"),
];

/// Short name for a public identity provider, if known.
pub fn idp_short_name(entity_id: &str) -> Option<&'static str> {
    SPID_IDP_IDENTIFIERS
        .iter()
        .find(|(id, _)| *id == entity_id)
        .map(|(_, name)| *name)
}
