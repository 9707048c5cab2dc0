//! Provenance merge engine
//!
//! Every ingestion path (registry corrections, bulk/enrichment import, crowd-verified
//! confidence) writes through the single decision function [`decide`]. A source may only
//! overwrite a field it outranks; anything else is recorded as an `ImportConflict` and the
//! stored value is kept.
//!
//! **Decision table:**
//! - incoming empty: skip (never clears a stored value)
//! - current empty: apply, record the incoming tier
//! - values equal: unchanged
//! - write-once field already set: conflict, regardless of tier
//! - incoming tier > current tier: apply, update the tier
//! - otherwise: conflict
//!
//! All fields of one source record are merged inside one transaction; a store failure on
//! any field rolls back the whole record.

use chrono::{DateTime, Utc};
use provdir_common::address::AddressParts;
use provdir_common::db::{
    AcceptanceStatus, ConflictEntity, EntityKind, FieldTiers, PracticeLocation, Provider,
};
use provdir_common::{Error, Result, SourceTier};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::fmt;

use crate::db::acceptances::{self, NewAcceptance};
use crate::db::conflicts::{self, NewConflict};
use crate::db::{locations, providers};
use crate::utils::RecordTransaction;

/// Outcome of comparing one incoming value against the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    Apply,
    Unchanged,
    Conflict,
    Skip,
}

/// Decide what to do with one incoming field value
///
/// # Arguments
/// * `current` / `current_tier` - Stored value and the tier that wrote it
/// * `incoming` / `incoming_tier` - Candidate value and its source tier
/// * `write_once` - Field may only be set while empty
pub fn decide(
    current: Option<&str>,
    current_tier: SourceTier,
    incoming: Option<&str>,
    incoming_tier: SourceTier,
    write_once: bool,
) -> MergeDecision {
    let Some(incoming) = present(incoming) else {
        return MergeDecision::Skip;
    };
    let Some(current) = present(current) else {
        return MergeDecision::Apply;
    };

    if current == incoming {
        MergeDecision::Unchanged
    } else if write_once {
        MergeDecision::Conflict
    } else if incoming_tier > current_tier {
        MergeDecision::Apply
    } else {
        MergeDecision::Conflict
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A mergeable column of some entity
pub trait MergeField: Copy + fmt::Debug {
    fn column(self) -> &'static str;

    /// Only settable while empty
    fn write_once(self) -> bool {
        false
    }

    /// Canonical stored form of an incoming value; rejects malformed values
    fn canonicalize(self, value: &str) -> Result<String> {
        Ok(value.trim().to_string())
    }
}

/// Mutable provider fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderField {
    EntityKind,
    FirstName,
    MiddleName,
    LastName,
    OrganizationName,
    Credential,
    TaxonomyCode,
    DeactivationDate,
}

impl ProviderField {
    fn current(self, provider: &Provider) -> Option<String> {
        match self {
            ProviderField::EntityKind => provider.entity_kind.map(|k| k.as_str().to_string()),
            ProviderField::FirstName => provider.first_name.clone(),
            ProviderField::MiddleName => provider.middle_name.clone(),
            ProviderField::LastName => provider.last_name.clone(),
            ProviderField::OrganizationName => provider.organization_name.clone(),
            ProviderField::Credential => provider.credential.clone(),
            ProviderField::TaxonomyCode => provider.taxonomy_code.clone(),
            ProviderField::DeactivationDate => provider.deactivation_date.clone(),
        }
    }
}

impl MergeField for ProviderField {
    fn column(self) -> &'static str {
        match self {
            ProviderField::EntityKind => "entity_kind",
            ProviderField::FirstName => "first_name",
            ProviderField::MiddleName => "middle_name",
            ProviderField::LastName => "last_name",
            ProviderField::OrganizationName => "organization_name",
            ProviderField::Credential => "credential",
            ProviderField::TaxonomyCode => "taxonomy_code",
            ProviderField::DeactivationDate => "deactivation_date",
        }
    }

    fn canonicalize(self, value: &str) -> Result<String> {
        match self {
            ProviderField::EntityKind => {
                let kind: EntityKind = value.trim().to_ascii_lowercase().parse().map_err(|_| {
                    Error::InvalidInput(format!("entity_kind must be individual or organization, got '{}'", value))
                })?;
                Ok(kind.as_str().to_string())
            }
            _ => Ok(value.trim().to_string()),
        }
    }
}

/// Mutable practice-location fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationField {
    LocationName,
    AddressLine1,
    AddressLine2,
    City,
    State,
    Zip,
    Phone,
    Fax,
}

impl LocationField {
    fn current(self, location: &PracticeLocation) -> Option<String> {
        match self {
            LocationField::LocationName => location.location_name.clone(),
            LocationField::AddressLine1 => location.address_line1.clone(),
            LocationField::AddressLine2 => location.address_line2.clone(),
            LocationField::City => location.city.clone(),
            LocationField::State => location.state.clone(),
            LocationField::Zip => location.zip.clone(),
            LocationField::Phone => location.phone.clone(),
            LocationField::Fax => location.fax.clone(),
        }
    }
}

impl MergeField for LocationField {
    fn column(self) -> &'static str {
        match self {
            LocationField::LocationName => "location_name",
            LocationField::AddressLine1 => "address_line1",
            LocationField::AddressLine2 => "address_line2",
            LocationField::City => "city",
            LocationField::State => "state",
            LocationField::Zip => "zip",
            LocationField::Phone => "phone",
            LocationField::Fax => "fax",
        }
    }

    fn write_once(self) -> bool {
        !matches!(self, LocationField::LocationName | LocationField::Fax)
    }

    fn canonicalize(self, value: &str) -> Result<String> {
        match self {
            LocationField::State => Ok(value.trim().to_ascii_uppercase()),
            _ => Ok(value.trim().to_string()),
        }
    }
}

/// One incoming field value; `None` means the source had no information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdate<F> {
    pub field: F,
    pub value: Option<String>,
}

impl<F> FieldUpdate<F> {
    pub fn new(field: F, value: impl Into<String>) -> Self {
        Self {
            field,
            value: Some(value.into()),
        }
    }

    pub fn maybe(field: F, value: Option<String>) -> Self {
        Self { field, value }
    }
}

/// What a merge did to one source record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The target entity was created by this record
    pub created: bool,
    pub applied: Vec<&'static str>,
    pub conflicts: Vec<&'static str>,
    pub unchanged: usize,
    pub skipped: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.created || !self.applied.is_empty()
    }

    pub fn was_applied(&self, column: &str) -> bool {
        self.applied.iter().any(|c| *c == column)
    }
}

/// Validate an NPI: exactly ten ASCII digits
pub fn validate_npi(npi: &str) -> Result<()> {
    if npi.len() == 10 && npi.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("NPI must be 10 digits, got '{}'", npi)))
    }
}

/// Per-field merge loop shared by providers and locations
struct FieldMerger {
    entity_kind: ConflictEntity,
    entity_id: String,
    tier: SourceTier,
    tiers: FieldTiers,
    columns: Vec<(&'static str, Option<String>)>,
    outcome: MergeOutcome,
    now: DateTime<Utc>,
}

impl FieldMerger {
    fn new(
        entity_kind: ConflictEntity,
        entity_id: String,
        tier: SourceTier,
        tiers: FieldTiers,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_kind,
            entity_id,
            tier,
            tiers,
            columns: Vec::new(),
            outcome: MergeOutcome::default(),
            now,
        }
    }

    async fn merge<F: MergeField>(
        &mut self,
        conn: &mut SqliteConnection,
        field: F,
        stored: Option<String>,
        incoming: Option<&str>,
    ) -> Result<()> {
        let column = field.column();
        let incoming = match present(incoming) {
            Some(value) => Some(field.canonicalize(value)?),
            None => None,
        };
        // A field repeated within one record sees its pending value
        let current = self
            .columns
            .iter()
            .rev()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v.clone())
            .unwrap_or(stored);
        let current_tier = self.tiers.get(column);

        match decide(
            current.as_deref(),
            current_tier,
            incoming.as_deref(),
            self.tier,
            field.write_once(),
        ) {
            MergeDecision::Apply => {
                tracing::debug!(
                    entity = %self.entity_kind,
                    id = %self.entity_id,
                    field = column,
                    from_tier = %current_tier,
                    to_tier = %self.tier,
                    "Applying field"
                );
                self.tiers.set(column, self.tier);
                self.columns.push((column, incoming));
                self.outcome.applied.push(column);
            }
            MergeDecision::Conflict => {
                tracing::warn!(
                    entity = %self.entity_kind,
                    id = %self.entity_id,
                    field = column,
                    current_tier = %current_tier,
                    incoming_tier = %self.tier,
                    "Merge rejected, recording import conflict"
                );
                conflicts::insert_conflict(
                    &mut *conn,
                    &NewConflict {
                        entity_kind: self.entity_kind,
                        entity_id: &self.entity_id,
                        field: column,
                        kept_value: current.as_deref(),
                        rejected_value: incoming.as_deref(),
                        current_source: current_tier,
                        incoming_source: self.tier,
                    },
                    self.now,
                )
                .await?;
                self.outcome.conflicts.push(column);
            }
            MergeDecision::Unchanged => self.outcome.unchanged += 1,
            MergeDecision::Skip => self.outcome.skipped += 1,
        }

        Ok(())
    }
}

/// Merge provider fields on an open connection (caller owns the transaction)
pub async fn merge_provider(
    conn: &mut SqliteConnection,
    npi: &str,
    updates: &[FieldUpdate<ProviderField>],
    tier: SourceTier,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    validate_npi(npi)?;

    let created = providers::insert_provider_shell(&mut *conn, npi, now).await?;
    let provider = providers::get_provider(&mut *conn, npi)
        .await?
        .ok_or_else(|| Error::Internal(format!("Provider {} vanished during merge", npi)))?;

    let mut merger = FieldMerger::new(
        ConflictEntity::Provider,
        npi.to_string(),
        tier,
        provider.field_tiers.clone(),
        now,
    );
    for update in updates {
        merger
            .merge(&mut *conn, update.field, update.field.current(&provider), update.value.as_deref())
            .await?;
    }

    if !merger.columns.is_empty() {
        providers::update_provider_columns(conn, npi, &merger.columns, &merger.tiers, now).await?;
    }

    let mut outcome = merger.outcome;
    outcome.created = created;
    Ok(outcome)
}

/// Merge a practice location identified by (provider, address identity)
///
/// The address components are write-once. An incoming address whose canonical form equals
/// the stored one is the same address and is neither written nor logged; any other
/// difference is recorded as a conflict.
///
/// # Returns
/// Location row id and the merge outcome
pub async fn merge_location(
    conn: &mut SqliteConnection,
    npi: &str,
    address: &AddressParts,
    updates: &[FieldUpdate<LocationField>],
    tier: SourceTier,
    now: DateTime<Utc>,
) -> Result<(i64, MergeOutcome)> {
    validate_npi(npi)?;
    if address.line1.trim().is_empty() || address.zip.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "Location for {} needs at least address line 1 and zip",
            npi
        )));
    }

    providers::insert_provider_shell(&mut *conn, npi, now).await?;

    let address_hash = address.identity_hash();
    let (location, created) = match locations::find_location(&mut *conn, npi, &address_hash).await? {
        Some(location) => (location, false),
        None => {
            let id = locations::insert_location(conn, npi, address, &address_hash, tier, now).await?;
            let location = locations::get_location(&mut *conn, id)
                .await?
                .ok_or_else(|| Error::Internal(format!("Location {} vanished during merge", id)))?;
            (location, true)
        }
    };

    let mut tiers = location.field_tiers.clone();
    let address_updates = [
        FieldUpdate::new(LocationField::AddressLine1, address.line1.clone()),
        FieldUpdate::maybe(LocationField::AddressLine2, address.line2.clone()),
        FieldUpdate::new(LocationField::City, address.city.clone()),
        FieldUpdate::new(LocationField::State, address.state.clone()),
        FieldUpdate::new(LocationField::Zip, address.zip.clone()),
    ];
    if created {
        for update in &address_updates {
            if present(update.value.as_deref()).is_some() {
                tiers.set(update.field.column(), tier);
            }
        }
    }

    let mut merger = FieldMerger::new(
        ConflictEntity::Location,
        location.id.to_string(),
        tier,
        tiers,
        now,
    );
    let same_address = location.address().canonical_form() == address.canonical_form();
    let address_part = if created || same_address {
        &address_updates[..0]
    } else {
        &address_updates[..]
    };
    for update in address_part.iter().chain(updates) {
        merger
            .merge(&mut *conn, update.field, update.field.current(&location), update.value.as_deref())
            .await?;
    }

    let applied_any = !merger.columns.is_empty();
    if applied_any || created {
        let source_tier = if applied_any {
            location.source_tier.max(tier)
        } else {
            location.source_tier
        };
        let enriched_at = (tier > SourceTier::Registry).then_some(now);
        locations::update_location_columns(
            conn,
            location.id,
            &merger.columns,
            &merger.tiers,
            source_tier,
            enriched_at,
            now,
        )
        .await?;
    }

    let mut outcome = merger.outcome;
    outcome.created = created;
    Ok((location.id, outcome))
}

/// Merge an imported confidence score into a provider/plan acceptance
///
/// A crowd-verified score is never replaced by a lower-tier import; the attempt is
/// recorded as a conflict on field `confidence_score`.
#[allow(clippy::too_many_arguments)]
pub async fn merge_acceptance_confidence(
    conn: &mut SqliteConnection,
    npi: &str,
    plan_id: &str,
    location_id: Option<i64>,
    confidence_score: i64,
    tier: SourceTier,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    validate_npi(npi)?;
    if !(0..=100).contains(&confidence_score) {
        return Err(Error::InvalidInput(format!(
            "confidence_score must be within 0..=100, got {}",
            confidence_score
        )));
    }

    let mut outcome = MergeOutcome::default();

    let Some(existing) = acceptances::find_acceptance(&mut *conn, npi, plan_id, location_id).await? else {
        providers::insert_provider_shell(&mut *conn, npi, now).await?;
        acceptances::insert_acceptance(
            conn,
            &NewAcceptance {
                provider_npi: npi,
                plan_id,
                location_id,
                status: AcceptanceStatus::Pending,
                confidence_score,
                source_tier: tier,
                expires_at,
            },
            now,
        )
        .await?;
        outcome.created = true;
        return Ok(outcome);
    };

    let entity_id = existing.id.to_string();
    let mut merger = FieldMerger::new(
        ConflictEntity::Acceptance,
        entity_id,
        tier,
        FieldTiers::default(),
        now,
    );
    merger.tiers.set(ConfidenceField.column(), existing.source_tier);
    merger
        .merge(
            &mut *conn,
            ConfidenceField,
            Some(existing.confidence_score.to_string()),
            Some(&confidence_score.to_string()),
        )
        .await?;

    if !merger.columns.is_empty() {
        acceptances::store_score_and_tier(&mut *conn, existing.id, confidence_score, tier, now).await?;
    }

    Ok(merger.outcome)
}

/// The acceptance confidence score viewed as a mergeable field
#[derive(Debug, Clone, Copy)]
struct ConfidenceField;

impl MergeField for ConfidenceField {
    fn column(self) -> &'static str {
        "confidence_score"
    }
}

/// Pool-owning front end: one transaction per source record
#[derive(Clone)]
pub struct MergeEngine {
    db: SqlitePool,
}

impl MergeEngine {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Merge one provider record
    pub async fn apply_provider(
        &self,
        npi: &str,
        updates: &[FieldUpdate<ProviderField>],
        tier: SourceTier,
    ) -> Result<MergeOutcome> {
        let mut tx = RecordTransaction::begin(&self.db, "merge_provider").await?;
        let outcome = merge_provider(tx.conn()?, npi, updates, tier, provdir_common::time::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Merge one practice-location record
    pub async fn apply_location(
        &self,
        npi: &str,
        address: &AddressParts,
        updates: &[FieldUpdate<LocationField>],
        tier: SourceTier,
    ) -> Result<(i64, MergeOutcome)> {
        let mut tx = RecordTransaction::begin(&self.db, "merge_location").await?;
        let result = merge_location(tx.conn()?, npi, address, updates, tier, provdir_common::time::now()).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Merge one imported acceptance confidence
    pub async fn apply_acceptance_confidence(
        &self,
        npi: &str,
        plan_id: &str,
        location_id: Option<i64>,
        confidence_score: i64,
        tier: SourceTier,
        expires_at: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let mut tx = RecordTransaction::begin(&self.db, "merge_acceptance").await?;
        let outcome = merge_acceptance_confidence(
            tx.conn()?,
            npi,
            plan_id,
            location_id,
            confidence_score,
            tier,
            expires_at,
            provdir_common::time::now(),
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }
}
