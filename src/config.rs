// ⚙️ Configuration - thresholds and the source precedence table
//
// Every value has a default; a JSON file only needs the keys it changes.

use crate::entity::Field;
use crate::provenance::SourceTag;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// RESOLVER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Records further apart than this never merge, whatever their names
    pub max_merge_radius_m: f64,

    /// Records this close in the same grid cell merge on a loose name match
    pub same_site_radius_m: f64,

    /// Name similarity needed to merge across cells (within the max radius)
    pub name_match_threshold: f64,

    /// Name similarity needed when both records share a grid cell
    pub same_cell_name_threshold: f64,

    /// Weight of name similarity in the combined score (distance gets the rest)
    pub name_weight: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            max_merge_radius_m: 2_000.0,
            same_site_radius_m: 150.0,
            name_match_threshold: 0.85,
            same_cell_name_threshold: 0.6,
            name_weight: 0.6,
        }
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Two high-precision coordinate sources further apart than this make
    /// the merge ambiguous
    pub coordinate_conflict_m: f64,

    /// Sources whose coordinates count as high precision
    pub high_precision_sources: Vec<SourceTag>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            coordinate_conflict_m: 500.0,
            high_precision_sources: vec![SourceTag::MapFeature, SourceTag::Geocoder],
        }
    }
}

// ============================================================================
// PARCEL AGGREGATOR
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// A parcel this many times the median of the others is an outlier
    pub outlier_ratio: f64,

    /// Absolute cap; larger parcels are always flagged
    pub max_parcel_area_sqm: Option<f64>,

    /// Buffer around the park point for the parcel intersection query
    pub parcel_buffer_m: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            outlier_ratio: 20.0,
            max_parcel_area_sqm: None,
            parcel_buffer_m: 120.0,
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Exponential backoff for collaborator calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests, offline steps)
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms)
    }
}

// ============================================================================
// PRECEDENCE TABLE
// ============================================================================

/// PrecedenceTable - per field, sources from highest to lowest precedence.
/// A source missing from a field's list ranks below every listed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecedenceTable {
    order: BTreeMap<Field, Vec<SourceTag>>,
}

impl PrecedenceTable {
    pub fn new() -> Self {
        PrecedenceTable {
            order: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, field: Field, sources: Vec<SourceTag>) {
        self.order.insert(field, sources);
    }

    /// Higher is better; 0 = not listed for this field
    pub fn rank(&self, field: Field, source: SourceTag) -> usize {
        match self.order.get(&field) {
            Some(list) => list
                .iter()
                .position(|s| *s == source)
                .map(|i| list.len() - i)
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn sources_for(&self, field: Field) -> &[SourceTag] {
        self.order.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        use SourceTag::*;

        let mut table = PrecedenceTable::new();

        // Identity: community map names over marketing names
        table.set(Field::Name, vec![MapFeature, BrandDirectory, BrandInference]);
        table.set(Field::State, vec![MapFeature, BrandDirectory, Geocoder]);
        table.set(Field::Coordinates, vec![Geocoder, MapFeature, BrandDirectory]);

        for field in [Field::AddressLine, Field::Suburb, Field::Postcode, Field::Lga] {
            table.set(field, vec![MapFeature, Geocoder, BrandDirectory]);
        }
        for field in [Field::Website, Field::Phone, Field::Email] {
            table.set(field, vec![MapFeature, BrandDirectory, PlaceDetails]);
        }
        table.set(Field::BusinessStatus, vec![PlaceDetails]);
        table.set(Field::Tourism, vec![MapFeature]);

        for field in [
            Field::OperatorBrand,
            Field::OperatorCompany,
            Field::OperatorSourceUrl,
        ] {
            table.set(field, vec![BrandDirectory, BrandInference, MapFeature]);
        }
        for field in [Field::SitesTotal, Field::SitesPowered, Field::SitesPermanent] {
            table.set(field, vec![BrandDirectory, MapFeature]);
        }
        for field in [
            Field::LandParcelIds,
            Field::LandAreaSqm,
            Field::LandAreaSource,
            Field::LandAreaConfidence,
            Field::ParcelFlags,
        ] {
            table.set(field, vec![ParcelService]);
        }

        table
    }
}

// ============================================================================
// REGISTRY CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub resolver: ResolverConfig,
    pub reconciler: ReconcilerConfig,
    pub aggregator: AggregatorConfig,
    pub retry: RetryPolicy,
    pub precedence: PrecedenceTable,
}

impl RegistryConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: RegistryConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        Ok(config)
    }
}
