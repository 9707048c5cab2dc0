//! Source tier ranking
//!
//! Every mutable field on a provider or location, and every acceptance record, carries the
//! tier of whoever last wrote it. The ranking is fixed:
//!
//! `registry` (10) < `bulk_scrape` (70) < `enrichment_import` (80) < `crowd_verified` (90)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Trust rank of a data origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// External canonical registry (also the default for never-touched fields)
    #[default]
    Registry,
    /// Bulk scraped directory data
    BulkScrape,
    /// Curated enrichment import
    EnrichmentImport,
    /// End-user crowd verification
    CrowdVerified,
}

impl SourceTier {
    pub const ALL: [SourceTier; 4] = [
        SourceTier::Registry,
        SourceTier::BulkScrape,
        SourceTier::EnrichmentImport,
        SourceTier::CrowdVerified,
    ];

    /// Numeric rank (higher is more trusted)
    pub fn rank(self) -> u8 {
        match self {
            SourceTier::Registry => 10,
            SourceTier::BulkScrape => 70,
            SourceTier::EnrichmentImport => 80,
            SourceTier::CrowdVerified => 90,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTier::Registry => "registry",
            SourceTier::BulkScrape => "bulk_scrape",
            SourceTier::EnrichmentImport => "enrichment_import",
            SourceTier::CrowdVerified => "crowd_verified",
        }
    }
}

impl PartialOrd for SourceTier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SourceTier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "registry" => Ok(SourceTier::Registry),
            "bulk_scrape" => Ok(SourceTier::BulkScrape),
            "enrichment_import" => Ok(SourceTier::EnrichmentImport),
            "crowd_verified" => Ok(SourceTier::CrowdVerified),
            other => Err(Error::InvalidInput(format!("Unknown source tier: {}", other))),
        }
    }
}
