//! Database row models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::address::AddressParts;
use crate::time::{from_db, from_db_opt};
use crate::{Error, Result, SourceTier};

/// Declares a closed set of stored string values with `as_str`/`FromStr`/`Display`
macro_rules! stored_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Internal(format!(
                        "Unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

stored_enum! {
    /// Individual practitioner or organization
    EntityKind {
        Individual => "individual",
        Organization => "organization",
    }
}

stored_enum! {
    /// Acceptance status of a provider/plan link
    AcceptanceStatus {
        Pending => "PENDING",
        Accepted => "ACCEPTED",
        NotAccepted => "NOT_ACCEPTED",
        Unknown => "UNKNOWN",
    }
}

stored_enum! {
    /// Direction of a crowd verification
    Vote {
        Up => "up",
        Down => "down",
    }
}

stored_enum! {
    /// Discrepancy severity
    Severity {
        Critical => "CRITICAL",
        Warning => "WARNING",
        Info => "INFO",
    }
}

stored_enum! {
    /// What kind of registry difference was detected
    DiscrepancyCategory {
        Deactivated => "DEACTIVATED",
        NotInRegistry => "NOT_IN_REGISTRY",
        NameMismatch => "NAME_MISMATCH",
        TaxonomyMismatch => "TAXONOMY_MISMATCH",
        CredentialMismatch => "CREDENTIAL_MISMATCH",
        StateMismatch => "STATE_MISMATCH",
    }
}

stored_enum! {
    /// Terminal geocoding status of a location row
    GeocodeStatus {
        Ok => "ok",
        NoResult => "no_result",
    }
}

stored_enum! {
    /// Entity a merge conflict was recorded against
    ConflictEntity {
        Provider => "provider",
        Location => "location",
        Acceptance => "acceptance",
    }
}

impl DiscrepancyCategory {
    /// Severity implied by the category
    pub fn severity(self) -> Severity {
        match self {
            DiscrepancyCategory::Deactivated | DiscrepancyCategory::NotInRegistry => {
                Severity::Critical
            }
            DiscrepancyCategory::NameMismatch
            | DiscrepancyCategory::TaxonomyMismatch
            | DiscrepancyCategory::CredentialMismatch => Severity::Warning,
            DiscrepancyCategory::StateMismatch => Severity::Info,
        }
    }
}

impl Vote {
    /// +1 for an upvote, -1 for a downvote
    pub fn sign(self) -> i64 {
        match self {
            Vote::Up => 1,
            Vote::Down => -1,
        }
    }
}

/// Per-field source tier map, stored as a JSON object
///
/// Fields absent from the map are owned by [`SourceTier::Registry`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldTiers(BTreeMap<String, SourceTier>);

impl FieldTiers {
    pub fn get(&self, field: &str) -> SourceTier {
        self.0.get(field).copied().unwrap_or_default()
    }

    pub fn set(&mut self, field: &str, tier: SourceTier) {
        self.0.insert(field.to_string(), tier);
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize field tiers: {}", e)))
    }

    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| Error::Internal(format!("Failed to deserialize field tiers: {}", e)))
    }
}

fn parse_opt<T: FromStr<Err = Error>>(value: Option<String>) -> Result<Option<T>> {
    value.as_deref().map(str::parse).transpose()
}

/// Provider record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub npi: String,
    pub entity_kind: Option<EntityKind>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub organization_name: Option<String>,
    pub credential: Option<String>,
    pub taxonomy_code: Option<String>,
    pub deactivation_date: Option<String>,
    pub field_tiers: FieldTiers,
    /// Watermark of the last successful registry reconciliation
    pub registry_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let field_tiers: String = row.try_get("field_tiers")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Self {
            npi: row.try_get("npi")?,
            entity_kind: parse_opt(row.try_get("entity_kind")?)?,
            first_name: row.try_get("first_name")?,
            middle_name: row.try_get("middle_name")?,
            last_name: row.try_get("last_name")?,
            organization_name: row.try_get("organization_name")?,
            credential: row.try_get("credential")?,
            taxonomy_code: row.try_get("taxonomy_code")?,
            deactivation_date: row.try_get("deactivation_date")?,
            field_tiers: FieldTiers::from_json(&field_tiers)?,
            registry_synced_at: from_db_opt(row.try_get("registry_synced_at")?)?,
            created_at: from_db(&created_at)?,
            updated_at: from_db(&updated_at)?,
        })
    }

    /// Display name: organization name, or "first [middle] last"
    pub fn display_name(&self) -> String {
        if let Some(org) = self.organization_name.as_deref().filter(|s| !s.trim().is_empty()) {
            return org.trim().to_string();
        }
        [&self.first_name, &self.middle_name, &self.last_name]
            .iter()
            .filter_map(|part| part.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivation_date
            .as_deref()
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Practice location of a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PracticeLocation {
    pub id: i64,
    pub provider_npi: String,
    pub location_name: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub address_hash: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocoded_at: Option<DateTime<Utc>>,
    pub geocode_status: Option<GeocodeStatus>,
    pub source_tier: SourceTier,
    pub field_tiers: FieldTiers,
    pub enriched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PracticeLocation {
    /// Address components as stored
    pub fn address(&self) -> AddressParts {
        AddressParts::new(
            self.address_line1.clone().unwrap_or_default(),
            self.address_line2.clone(),
            self.city.clone().unwrap_or_default(),
            self.state.clone().unwrap_or_default(),
            self.zip.clone().unwrap_or_default(),
        )
    }

    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let source_tier: String = row.try_get("source_tier")?;
        let field_tiers: String = row.try_get("field_tiers")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            provider_npi: row.try_get("provider_npi")?,
            location_name: row.try_get("location_name")?,
            address_line1: row.try_get("address_line1")?,
            address_line2: row.try_get("address_line2")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            zip: row.try_get("zip")?,
            phone: row.try_get("phone")?,
            fax: row.try_get("fax")?,
            address_hash: row.try_get("address_hash")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            geocoded_at: from_db_opt(row.try_get("geocoded_at")?)?,
            geocode_status: parse_opt(row.try_get("geocode_status")?)?,
            source_tier: source_tier.parse()?,
            field_tiers: FieldTiers::from_json(&field_tiers)?,
            enriched_at: from_db_opt(row.try_get("enriched_at")?)?,
            created_at: from_db(&created_at)?,
            updated_at: from_db(&updated_at)?,
        })
    }
}

/// Canonical insurance plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsurancePlan {
    pub plan_id: String,
    pub plan_name: Option<String>,
    pub carrier_name: Option<String>,
    pub issuer_name: Option<String>,
    pub plan_type: Option<String>,
}

impl InsurancePlan {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            plan_id: row.try_get("plan_id")?,
            plan_name: row.try_get("plan_name")?,
            carrier_name: row.try_get("carrier_name")?,
            issuer_name: row.try_get("issuer_name")?,
            plan_type: row.try_get("plan_type")?,
        })
    }
}

/// Provider/plan acceptance record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acceptance {
    pub id: i64,
    pub provider_npi: String,
    pub plan_id: String,
    pub location_id: Option<i64>,
    pub status: AcceptanceStatus,
    pub confidence_score: i64,
    pub source_tier: SourceTier,
    pub verification_count: i64,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Acceptance {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("acceptance_status")?;
        let source_tier: String = row.try_get("source_tier")?;
        let expires_at: String = row.try_get("expires_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            provider_npi: row.try_get("provider_npi")?,
            plan_id: row.try_get("plan_id")?,
            location_id: row.try_get("location_id")?,
            status: status.parse()?,
            confidence_score: row.try_get("confidence_score")?,
            source_tier: source_tier.parse()?,
            verification_count: row.try_get("verification_count")?,
            last_verified_at: from_db_opt(row.try_get("last_verified_at")?)?,
            expires_at: from_db(&expires_at)?,
            created_at: from_db(&created_at)?,
            updated_at: from_db(&updated_at)?,
        })
    }
}

/// Immutable crowd verification event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub id: i64,
    pub provider_npi: String,
    pub plan_id: String,
    pub vote: Vote,
    pub weight: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationEvent {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let vote: String = row.try_get("vote")?;
        let created_at: String = row.try_get("created_at")?;
        let expires_at: String = row.try_get("expires_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            provider_npi: row.try_get("provider_npi")?,
            plan_id: row.try_get("plan_id")?,
            vote: vote.parse()?,
            weight: row.try_get("weight")?,
            created_at: from_db(&created_at)?,
            expires_at: from_db(&expires_at)?,
        })
    }

    pub fn is_live_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at > at
    }
}

/// Audit record of a rejected merge attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConflict {
    pub id: i64,
    pub entity_kind: ConflictEntity,
    pub entity_id: String,
    pub field: String,
    pub kept_value: Option<String>,
    pub rejected_value: Option<String>,
    pub current_source: SourceTier,
    pub incoming_source: SourceTier,
    pub created_at: DateTime<Utc>,
}

impl ImportConflict {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let entity_kind: String = row.try_get("entity_kind")?;
        let current_source: String = row.try_get("current_source")?;
        let incoming_source: String = row.try_get("incoming_source")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            entity_kind: entity_kind.parse()?,
            entity_id: row.try_get("entity_id")?,
            field: row.try_get("field")?,
            kept_value: row.try_get("kept_value")?,
            rejected_value: row.try_get("rejected_value")?,
            current_source: current_source.parse()?,
            incoming_source: incoming_source.parse()?,
            created_at: from_db(&created_at)?,
        })
    }
}

/// Audit record of a registry discrepancy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: i64,
    pub run_id: Option<String>,
    pub provider_npi: String,
    pub severity: Severity,
    pub category: DiscrepancyCategory,
    pub field: Option<String>,
    pub observed_value: Option<String>,
    pub expected_value: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Discrepancy {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let severity: String = row.try_get("severity")?;
        let category: String = row.try_get("category")?;
        let resolved: i64 = row.try_get("resolved")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            provider_npi: row.try_get("provider_npi")?,
            severity: severity.parse()?,
            category: category.parse()?,
            field: row.try_get("field")?,
            observed_value: row.try_get("observed_value")?,
            expected_value: row.try_get("expected_value")?,
            resolved: resolved != 0,
            created_at: from_db(&created_at)?,
            resolved_at: from_db_opt(row.try_get("resolved_at")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_enum_round_trip() {
        assert_eq!("NOT_ACCEPTED".parse::<AcceptanceStatus>().unwrap(), AcceptanceStatus::NotAccepted);
        assert_eq!(AcceptanceStatus::Pending.as_str(), "PENDING");
        assert!("pending".parse::<AcceptanceStatus>().is_err());
    }

    #[test]
    fn test_category_severity() {
        assert_eq!(DiscrepancyCategory::NotInRegistry.severity(), Severity::Critical);
        assert_eq!(DiscrepancyCategory::CredentialMismatch.severity(), Severity::Warning);
        assert_eq!(DiscrepancyCategory::StateMismatch.severity(), Severity::Info);
    }

    #[test]
    fn test_field_tiers_default_to_registry() {
        let mut tiers = FieldTiers::default();
        assert_eq!(tiers.get("last_name"), SourceTier::Registry);

        tiers.set("last_name", SourceTier::EnrichmentImport);
        let json = tiers.to_json().unwrap();
        assert_eq!(json, r#"{"last_name":"enrichment_import"}"#);
        assert_eq!(FieldTiers::from_json(&json).unwrap(), tiers);
        assert_eq!(FieldTiers::from_json("{}").unwrap().get("credential"), SourceTier::Registry);
    }

    #[test]
    fn test_vote_sign() {
        assert_eq!(Vote::Up.sign(), 1);
        assert_eq!(Vote::Down.sign(), -1);
    }
}
