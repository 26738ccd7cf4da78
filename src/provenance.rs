// 🧾 Provenance - where every field value came from, and when
//
// A park is one identity observed by many sources over time. Each field keeps
// the source and observation time of the value it currently holds.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SOURCE TAG
// ============================================================================

/// SourceTag - Which kind of collaborator produced an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    /// Map-feature export (OSM tourism=caravan_site etc.)
    MapFeature,

    /// Operator brand directory (BIG4, NRMA, Discovery...)
    BrandDirectory,

    /// Brand inferred offline from website host, tags or name
    BrandInference,

    /// Reverse geocoder / address lookup
    Geocoder,

    /// Cadastral parcel intersection service
    ParcelService,

    /// Place-details directory (phone, website, business status)
    PlaceDetails,
}

impl SourceTag {
    pub const ALL: [SourceTag; 6] = [
        SourceTag::MapFeature,
        SourceTag::BrandDirectory,
        SourceTag::BrandInference,
        SourceTag::Geocoder,
        SourceTag::ParcelService,
        SourceTag::PlaceDetails,
    ];

    /// Short code used in the registry file
    pub fn code(&self) -> &'static str {
        match self {
            SourceTag::MapFeature => "map_feature",
            SourceTag::BrandDirectory => "brand_directory",
            SourceTag::BrandInference => "brand_inference",
            SourceTag::Geocoder => "geocoder",
            SourceTag::ParcelService => "parcel_service",
            SourceTag::PlaceDetails => "place_details",
        }
    }

    /// Parse a code, accepting the short aliases fetchers emit
    pub fn from_code(code: &str) -> Option<SourceTag> {
        let code = code.trim().to_lowercase();
        match code.as_str() {
            "osm" | "osm_overpass" => Some(SourceTag::MapFeature),
            "brand" => Some(SourceTag::BrandDirectory),
            "nominatim" | "geocode" => Some(SourceTag::Geocoder),
            "cadastre" => Some(SourceTag::ParcelService),
            "places" | "google" => Some(SourceTag::PlaceDetails),
            _ => SourceTag::ALL.iter().copied().find(|tag| tag.code() == code),
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// PROVENANCE
// ============================================================================

/// Provenance - (source, observation time) of one field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: SourceTag,
    pub observed_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(source: SourceTag, observed_at: DateTime<Utc>) -> Self {
        Provenance {
            source,
            observed_at,
        }
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Clock - injected so batch runs are reproducible in tests
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at(year: i32, month: u32, day: u32) -> Self {
        let instant = Utc
            .with_ymd_and_hms(year, month, day, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        FixedClock(instant)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tag_codes_round_trip() {
        for tag in SourceTag::ALL {
            assert_eq!(SourceTag::from_code(tag.code()), Some(tag));
        }
        assert_eq!(SourceTag::from_code(" Map_Feature "), Some(SourceTag::MapFeature));
        assert_eq!(SourceTag::from_code("osm"), Some(SourceTag::MapFeature));
        assert_eq!(SourceTag::from_code("brand"), Some(SourceTag::BrandDirectory));
        assert_eq!(SourceTag::from_code("fax"), None);
    }

    #[test]
    fn test_fixed_clock_is_stable() {
        let clock = FixedClock::at(2025, 3, 1);
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-03-01T00:00:00+00:00");
    }
}
