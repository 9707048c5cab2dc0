//! Address canonicalization
//!
//! Computes a stable identity hash for a physical address so that the same place is
//! recognized across records from different sources. Two addresses that differ only in
//! case, punctuation, spacing, common street-suffix spellings, or ZIP+4 extension hash
//! to the same value.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Street designators folded to their USPS abbreviation before hashing
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("STREET", "ST"),
    ("AVENUE", "AVE"),
    ("BOULEVARD", "BLVD"),
    ("DRIVE", "DR"),
    ("ROAD", "RD"),
    ("LANE", "LN"),
    ("COURT", "CT"),
    ("PLACE", "PL"),
    ("PARKWAY", "PKWY"),
    ("HIGHWAY", "HWY"),
    ("SUITE", "STE"),
    ("BUILDING", "BLDG"),
    ("FLOOR", "FL"),
    ("APARTMENT", "APT"),
    ("NORTH", "N"),
    ("SOUTH", "S"),
    ("EAST", "E"),
    ("WEST", "W"),
];

/// Address components as received from any source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressParts {
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl AddressParts {
    pub fn new(
        line1: impl Into<String>,
        line2: Option<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        zip: impl Into<String>,
    ) -> Self {
        Self {
            line1: line1.into(),
            line2,
            city: city.into(),
            state: state.into(),
            zip: zip.into(),
        }
    }

    /// Canonical single-line form used for hashing
    pub fn canonical_form(&self) -> String {
        let line2 = self
            .line2
            .as_deref()
            .map(normalize_component)
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}",
            normalize_component(&self.line1),
            line2,
            normalize_component(&self.city),
            normalize_component(&self.state),
            zip5(&self.zip)
        )
    }

    /// Stable address identity hash (hex SHA-256 of the canonical form)
    pub fn identity_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_form().as_bytes());
        format!("{:x}", digest)
    }

    /// Free-form address string sent to the geocoder
    pub fn query_string(&self) -> String {
        let mut parts = vec![self.line1.trim().to_string()];
        if let Some(line2) = self.line2.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            parts.push(line2.to_string());
        }
        parts.push(self.city.trim().to_string());
        format!("{}, {} {}", parts.join(", "), self.state.trim(), zip5(&self.zip))
    }
}

/// Uppercase, strip punctuation, collapse whitespace, fold street designators
fn normalize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .map(|token| {
            ABBREVIATIONS
                .iter()
                .find(|(long, _)| *long == token)
                .map(|(_, short)| *short)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// First five digits of a ZIP or ZIP+4
fn zip5(zip: &str) -> String {
    zip.chars().filter(|c| c.is_ascii_digit()).take(5).collect()
}
