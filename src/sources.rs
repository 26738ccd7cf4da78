// 🔌 Source boundary - raw observations and the collaborators that fetch them
//
// Fetchers (map features, brand directories, cadastral services, geocoders)
// live outside this crate. They only have to implement these traits.

use crate::error::{RegistryError, Result};
use crate::geo::{GeoPoint, Jurisdiction};
use crate::provenance::SourceTag;
use anyhow::Context;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// RAW RECORD
// ============================================================================

/// RawRecord - one observation exactly as a fetcher returned it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: SourceTag,

    /// Identifier inside the source, e.g. "osm:way:123"
    pub source_ref: Option<String>,

    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub state: Option<String>,

    /// addr:housenumber, addr:street, addr:city, addr:postcode ...
    pub address_tags: BTreeMap<String, String>,

    /// tourism, brand, operator, disused:tourism ...
    pub tags: BTreeMap<String, String>,

    pub website: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,

    pub operator_brand: Option<String>,
    pub operator_company: Option<String>,
    pub source_url: Option<String>,

    /// Site counts as published; parsed by the normalizer
    pub sites_total: Option<String>,
    pub sites_powered: Option<String>,
    pub sites_permanent: Option<String>,

    pub notes: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(source: SourceTag, observed_at: DateTime<Utc>) -> Self {
        RawRecord {
            source,
            source_ref: None,
            name: None,
            lat: None,
            lon: None,
            state: None,
            address_tags: BTreeMap::new(),
            tags: BTreeMap::new(),
            website: None,
            phone: None,
            email: None,
            operator_brand: None,
            operator_company: None,
            source_url: None,
            sites_total: None,
            sites_powered: None,
            sites_permanent: None,
            notes: None,
            observed_at,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_coords(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    pub fn with_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn with_address_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.address_tags.insert(key.to_string(), value.into());
        self
    }

    pub fn with_operator(mut self, brand: impl Into<String>, company: impl Into<String>) -> Self {
        self.operator_brand = Some(brand.into());
        self.operator_company = Some(company.into());
        self
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

// ============================================================================
// COLLABORATOR CONTRACTS
// ============================================================================

/// Map-feature fetcher: all park-like features inside one jurisdiction
pub trait FeatureSource {
    fn fetch(&self, region: Jurisdiction) -> Result<Vec<RawRecord>>;

    fn name(&self) -> &str;
}

/// Operator brand directory (one per brand)
pub trait BrandDirectory {
    fn fetch(&self) -> Result<Vec<RawRecord>>;

    fn brand(&self) -> &str;
}

/// ParcelReference - one cadastral parcel returned by an intersection query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelReference {
    /// "lot/plan" label or service id
    pub parcel_id: String,
    pub area_sqm: f64,
    /// Opaque geometry as returned by the service, if requested
    pub geometry: Option<String>,
}

impl ParcelReference {
    pub fn new(parcel_id: impl Into<String>, area_sqm: f64) -> Self {
        ParcelReference {
            parcel_id: parcel_id.into(),
            area_sqm,
            geometry: None,
        }
    }
}

/// Cadastral service: parcels intersecting a buffered point
pub trait ParcelQuery {
    fn parcels_near(&self, point: GeoPoint, buffer_m: f64) -> Result<Vec<ParcelReference>>;

    /// Value written to land_area_source, e.g. "nsw_dcdb"
    fn source_label(&self) -> &str;
}

/// Reverse geocoder answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressLookup {
    pub address_line: Option<String>,
    pub suburb: Option<String>,
    pub postcode: Option<String>,
    pub lga: Option<String>,
}

impl AddressLookup {
    pub fn is_empty(&self) -> bool {
        self.address_line.is_none()
            && self.suburb.is_none()
            && self.postcode.is_none()
            && self.lga.is_none()
    }
}

/// Address/geocode service; Ok(None) means not found
pub trait Geocoder {
    fn reverse(&self, point: GeoPoint) -> Result<Option<AddressLookup>>;
}

/// Best listing a place-details directory returned for a name search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceMatch {
    /// Directory's own id for the place
    pub place_ref: String,
    pub name: String,
    pub point: Option<GeoPoint>,
    pub phone: Option<String>,
    pub website: Option<String>,
    /// As published, e.g. "OPERATIONAL", "CLOSED_PERMANENTLY"
    pub business_status: Option<String>,
}

/// Place-details directory searched by name near a point; Ok(None) means
/// no listing
pub trait PlaceDetails {
    fn find(&self, name: &str, near: GeoPoint) -> Result<Option<PlaceMatch>>;
}

// ============================================================================
// FLAT OBSERVATION FILES
// ============================================================================

/// One row of a flat observations CSV (what fetchers dump to disk)
#[derive(Debug, Deserialize)]
struct ObservationRow {
    source: String,
    #[serde(default)]
    source_ref: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "addr:housenumber")]
    housenumber: Option<String>,
    #[serde(default, rename = "addr:street")]
    street: Option<String>,
    #[serde(default, rename = "addr:city")]
    city: Option<String>,
    #[serde(default, rename = "addr:postcode")]
    postcode: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    tourism: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    operator_brand: Option<String>,
    #[serde(default)]
    operator_company: Option<String>,
    #[serde(default)]
    operator_source_url: Option<String>,
    #[serde(default)]
    sites_total: Option<String>,
    #[serde(default)]
    sites_powered: Option<String>,
    #[serde(default)]
    sites_permanent: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    observed_at: Option<String>,
}

impl ObservationRow {
    fn into_raw(self, fallback_time: DateTime<Utc>) -> Result<RawRecord> {
        let source = SourceTag::from_code(&self.source).ok_or_else(|| RegistryError::MalformedSource {
            source_tag: self.source.clone(),
            reason: "unknown source tag".to_string(),
        })?;

        let observed_at = match self.observed_at.as_deref().map(str::trim) {
            Some(ts) if !ts.is_empty() => DateTime::parse_from_rfc3339(ts)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| RegistryError::MalformedSource {
                    source_tag: source.to_string(),
                    reason: format!("bad observed_at '{}': {}", ts, e),
                })?,
            _ => fallback_time,
        };

        let mut raw = RawRecord::new(source, observed_at);
        raw.source_ref = self.source_ref;
        raw.name = self.name;
        raw.lat = self.latitude;
        raw.lon = self.longitude;
        raw.state = self.state;
        raw.website = self.website;
        raw.phone = self.phone;
        raw.email = self.email;
        raw.operator_brand = self.operator_brand;
        raw.operator_company = self.operator_company;
        raw.source_url = self.operator_source_url;
        raw.sites_total = self.sites_total;
        raw.sites_powered = self.sites_powered;
        raw.sites_permanent = self.sites_permanent;
        raw.notes = self.notes;

        let address = [
            ("addr:housenumber", self.housenumber),
            ("addr:street", self.street),
            ("addr:city", self.city),
            ("addr:postcode", self.postcode),
        ];
        for (key, value) in address {
            if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
                raw.address_tags.insert(key.to_string(), v);
            }
        }
        let tags = [
            ("tourism", self.tourism),
            ("brand", self.brand),
            ("operator", self.operator),
        ];
        for (key, value) in tags {
            if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
                raw.tags.insert(key.to_string(), v);
            }
        }

        Ok(raw)
    }
}

/// Load a flat observations CSV. Rows that cannot be read are logged and
/// skipped; only an unreadable file is an error.
pub fn load_observations(path: &Path, fallback_time: DateTime<Utc>) -> anyhow::Result<(Vec<RawRecord>, usize)> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open observations file: {:?}", path))?;

    let mut records = Vec::new();
    let mut skipped = 0;

    for (line, result) in rdr.deserialize::<ObservationRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!("observation row {} unreadable: {}", line + 2, e);
                skipped += 1;
                continue;
            }
        };
        match row.into_raw(fallback_time) {
            Ok(raw) => records.push(raw),
            Err(e) => {
                warn!("observation row {} skipped: {}", line + 2, e);
                skipped += 1;
            }
        }
    }

    Ok((records, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder() {
        let raw = RawRecord::new(SourceTag::MapFeature, Utc::now())
            .with_name("Sunny Caravan Park")
            .with_coords(-33.1, 151.2)
            .with_tag("tourism", "caravan_site");

        assert_eq!(raw.name.as_deref(), Some("Sunny Caravan Park"));
        assert_eq!(raw.lat, Some(-33.1));
        assert_eq!(raw.tags.get("tourism").map(String::as_str), Some("caravan_site"));
    }

    #[test]
    fn test_load_observations_skips_bad_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source,name,latitude,longitude,addr:street,tourism,observed_at").unwrap();
        writeln!(file, "osm,Sunny Caravan Park,-33.1,151.2,Beach Rd,caravan_site,2025-01-01T00:00:00Z").unwrap();
        writeln!(file, "carrier_pigeon,Nowhere,-33.1,151.2,,,").unwrap();
        writeln!(file, "brand,Sunny Caravan Park,-33.1002,151.2001,,,not-a-date").unwrap();
        writeln!(file, "brand,BIG4 Sunny,-33.1002,151.2001,,,").unwrap();
        file.flush().unwrap();

        let (records, skipped) = load_observations(file.path(), Utc::now()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 2);
        assert_eq!(records[0].source, SourceTag::MapFeature);
        assert_eq!(
            records[0].address_tags.get("addr:street").map(String::as_str),
            Some("Beach Rd")
        );
        assert_eq!(records[1].source, SourceTag::BrandDirectory);
    }

    #[test]
    fn test_address_lookup_empty() {
        assert!(AddressLookup::default().is_empty());
        let found = AddressLookup {
            suburb: Some("Byron Bay".into()),
            ..Default::default()
        };
        assert!(!found.is_empty());
    }
}
