//! Closed vocabulary of contract elements.
//!
//! Validation and element detection only ever report tags from
//! [`ContractElement`]. Strings returned by the model that are not in the
//! vocabulary are dropped by [`parse_elements`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractElement {
    PartiesIdentification,
    OfferAndAcceptance,
    Consideration,
    LegalCapacity,
    MutualConsent,
    LawfulPurpose,
    Signatures,
    PaymentTerms,
    GoverningLaw,
    DisputeResolution,
    TerminationClause,
    EffectiveDate,
    TermDuration,
    DeliveryTerms,
    Warranties,
    LiabilityLimitation,
    Confidentiality,
    ForceMajeure,
    IntellectualProperty,
    Indemnification,
}

/// Elements every enforceable contract needs; drives `element_completeness`.
pub const REQUIRED_ELEMENTS: [ContractElement; 6] = [
    ContractElement::PartiesIdentification,
    ContractElement::OfferAndAcceptance,
    ContractElement::Consideration,
    ContractElement::LegalCapacity,
    ContractElement::MutualConsent,
    ContractElement::LawfulPurpose,
];

impl ContractElement {
    pub const ALL: [ContractElement; 20] = [
        ContractElement::PartiesIdentification,
        ContractElement::OfferAndAcceptance,
        ContractElement::Consideration,
        ContractElement::LegalCapacity,
        ContractElement::MutualConsent,
        ContractElement::LawfulPurpose,
        ContractElement::Signatures,
        ContractElement::PaymentTerms,
        ContractElement::GoverningLaw,
        ContractElement::DisputeResolution,
        ContractElement::TerminationClause,
        ContractElement::EffectiveDate,
        ContractElement::TermDuration,
        ContractElement::DeliveryTerms,
        ContractElement::Warranties,
        ContractElement::LiabilityLimitation,
        ContractElement::Confidentiality,
        ContractElement::ForceMajeure,
        ContractElement::IntellectualProperty,
        ContractElement::Indemnification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractElement::PartiesIdentification => "parties_identification",
            ContractElement::OfferAndAcceptance => "offer_and_acceptance",
            ContractElement::Consideration => "consideration",
            ContractElement::LegalCapacity => "legal_capacity",
            ContractElement::MutualConsent => "mutual_consent",
            ContractElement::LawfulPurpose => "lawful_purpose",
            ContractElement::Signatures => "signatures",
            ContractElement::PaymentTerms => "payment_terms",
            ContractElement::GoverningLaw => "governing_law",
            ContractElement::DisputeResolution => "dispute_resolution",
            ContractElement::TerminationClause => "termination_clause",
            ContractElement::EffectiveDate => "effective_date",
            ContractElement::TermDuration => "term_duration",
            ContractElement::DeliveryTerms => "delivery_terms",
            ContractElement::Warranties => "warranties",
            ContractElement::LiabilityLimitation => "liability_limitation",
            ContractElement::Confidentiality => "confidentiality",
            ContractElement::ForceMajeure => "force_majeure",
            ContractElement::IntellectualProperty => "intellectual_property",
            ContractElement::Indemnification => "indemnification",
        }
    }

    pub fn is_required(&self) -> bool {
        REQUIRED_ELEMENTS.contains(self)
    }
}

impl fmt::Display for ContractElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractElement {
    type Err = String;

    /// Accepts the canonical tag as well as the spaced / dashed / camel
    /// spellings models tend to produce (`"Governing Law"`, `"governing-law"`,
    /// `"governingLaw"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_tag(s);
        ContractElement::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| format!("unknown contract element: {}", s))
    }
}

fn normalize_tag(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for ch in s.trim().chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        match ch {
            ' ' | '-' | '/' => out.push('_'),
            '&' => out.push_str("and"),
            c => out.push(c.to_ascii_lowercase()),
        }
        prev_lower = ch.is_ascii_lowercase();
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out
}

/// Maps free-form tags onto the vocabulary, dropping anything unknown.
pub fn parse_elements<I, S>(tags: I) -> BTreeSet<ContractElement>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|t| match t.as_ref().parse::<ContractElement>() {
            Ok(e) => Some(e),
            Err(_) => {
                tracing::warn!(tag = t.as_ref(), "dropping element outside the vocabulary");
                None
            }
        })
        .collect()
}

/// Comma-separated vocabulary, for prompts.
pub fn vocabulary_list() -> String {
    ContractElement::ALL
        .iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
