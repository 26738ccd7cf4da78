// 🗄️ Persisted Registry - one CSV row per park, keyed by park_id
//
// The registry file is the durable state across every batch boundary.
// Writes go to a temp file first and are renamed into place, so a crash
// leaves either the old file or the new one, never half of each.
//
// Reading is strict: a row that cannot be decoded, or a value without
// provenance, aborts the run (CorruptRegistry).

use crate::entity::{Category, EnrichmentKind, Field, FieldEntry, FieldValue, OpeningStatus, ParkEntity};
use crate::error::{RegistryError, Result};
use crate::geo::GeoPoint;
use crate::provenance::{Provenance, SourceTag};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Separator for multi-valued cells
const LIST_SEP: &str = ";";

// ============================================================================
// REGISTRY (in memory)
// ============================================================================

/// Registry - every park, ordered by park_id (the batch cursor order)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    parks: BTreeMap<String, ParkEntity>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            parks: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.parks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parks.is_empty()
    }

    pub fn contains(&self, park_id: &str) -> bool {
        self.parks.contains_key(park_id)
    }

    pub fn get(&self, park_id: &str) -> Option<&ParkEntity> {
        self.parks.get(park_id)
    }

    pub fn get_mut(&mut self, park_id: &str) -> Option<&mut ParkEntity> {
        self.parks.get_mut(park_id)
    }

    /// Insert or replace by park_id
    pub fn upsert(&mut self, park: ParkEntity) {
        self.parks.insert(park.park_id.clone(), park);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParkEntity> {
        self.parks.values()
    }

    pub fn park_ids(&self) -> Vec<String> {
        self.parks.keys().cloned().collect()
    }

    /// park_ids at positions [offset, offset + limit) in park_id order
    pub fn window(&self, offset: usize, limit: usize) -> Vec<String> {
        self.parks.keys().skip(offset).take(limit).cloned().collect()
    }

    /// Park that already claims a parcel for its area, other than `except`
    pub fn parcel_owner(&self, parcel_id: &str, except: &str) -> Option<&str> {
        self.parks
            .values()
            .filter(|p| p.park_id != except)
            .find(|p| {
                p.text(Field::LandParcelIds)
                    .map(|ids| split_list(ids).iter().any(|id| id == parcel_id))
                    .unwrap_or(false)
            })
            .map(|p| p.park_id.as_str())
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Where the registry lives between runs
pub trait RegistryStore {
    /// Missing state is an empty registry; unreadable state is fatal
    fn load(&self) -> Result<Registry>;

    /// Replace the stored state atomically
    fn save(&self, registry: &Registry) -> Result<()>;
}

/// Registry as a CSV file in the export schema
pub struct CsvRegistryStore {
    path: PathBuf,
}

impl CsvRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvRegistryStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RegistryStore for CsvRegistryStore {
    fn load(&self) -> Result<Registry> {
        if !self.path.exists() {
            info!("No registry at {:?}, starting empty", self.path);
            return Ok(Registry::new());
        }

        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut registry = Registry::new();

        for (i, result) in rdr.deserialize::<RegistryRow>().enumerate() {
            let line = i + 2; // header is line 1
            let row = result.map_err(|e| RegistryError::corrupt(line, e.to_string()))?;
            let park = row.into_entity(line)?;
            if registry.contains(&park.park_id) {
                return Err(RegistryError::corrupt(line, format!("duplicate park_id {}", park.park_id)));
            }
            registry.upsert(park);
        }

        debug!("Loaded {} parks from {:?}", registry.len(), self.path);
        Ok(registry)
    }

    fn save(&self, registry: &Registry) -> Result<()> {
        let tmp = self.temp_path();
        {
            let mut wtr = csv::Writer::from_path(&tmp)?;
            for park in registry.iter() {
                wtr.serialize(RegistryRow::from_entity(park)?)?;
            }
            let file = wtr.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// ROW (export schema)
// ============================================================================

/// RegistryRow - the export schema, column order fixed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRow {
    pub park_id: String,
    pub name: String,
    pub state: String,
    pub address_line: String,
    pub suburb: String,
    pub postcode: String,
    pub lga: String,
    pub latitude: String,
    pub longitude: String,
    pub category: String,
    pub operator_brand: String,
    pub operator_company: String,
    pub operator_source_url: String,
    pub opening_status: String,
    /// Absent from files written before place details existed
    #[serde(default)]
    pub business_status: String,
    pub website: String,
    pub phone: String,
    pub email: String,
    pub tourism: String,
    pub sites_total: String,
    pub sites_powered: String,
    pub sites_permanent: String,
    pub land_parcel_ids: String,
    pub land_area_sqm: String,
    pub land_area_source: String,
    pub land_area_confidence: String,
    pub parcel_flags: String,
    pub source_primary: String,
    pub source_secondary: String,
    pub source_refs: String,
    pub provenance: String,
    pub confidence: String,
    pub needs_review: String,
    pub review_reasons: String,
    pub date_collected_utc: String,
    pub parcel_checked_at: String,
    pub address_checked_at: String,
    pub brand_checked_at: String,
    #[serde(default)]
    pub place_details_checked_at: String,
    pub notes: String,
}

impl RegistryRow {
    pub fn from_entity(park: &ParkEntity) -> Result<Self> {
        let text = |field: Field| park.get(field).map(|v| v.to_string()).unwrap_or_default();
        let (latitude, longitude) = match park.point() {
            Some(p) => (format!("{:.6}", p.lat), format!("{:.6}", p.lon)),
            None => (String::new(), String::new()),
        };
        let checked = |kind: EnrichmentKind| {
            park.checkpoints
                .get(&kind)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        };

        let primary = park.primary_source();
        let secondary: Vec<&str> = park
            .contributors
            .iter()
            .filter(|s| Some(**s) != primary)
            .map(|s| s.code())
            .collect();

        let provenance: BTreeMap<&str, Provenance> = park
            .fields
            .iter()
            .map(|(field, entry)| (field.as_str(), entry.provenance))
            .collect();

        Ok(RegistryRow {
            park_id: park.park_id.clone(),
            name: text(Field::Name),
            state: text(Field::State),
            address_line: text(Field::AddressLine),
            suburb: text(Field::Suburb),
            postcode: text(Field::Postcode),
            lga: text(Field::Lga),
            latitude,
            longitude,
            category: park.category.as_str().to_string(),
            operator_brand: text(Field::OperatorBrand),
            operator_company: text(Field::OperatorCompany),
            operator_source_url: text(Field::OperatorSourceUrl),
            opening_status: park.opening_status.as_str().to_string(),
            business_status: text(Field::BusinessStatus),
            website: text(Field::Website),
            phone: text(Field::Phone),
            email: text(Field::Email),
            tourism: text(Field::Tourism),
            sites_total: text(Field::SitesTotal),
            sites_powered: text(Field::SitesPowered),
            sites_permanent: text(Field::SitesPermanent),
            land_parcel_ids: text(Field::LandParcelIds),
            land_area_sqm: text(Field::LandAreaSqm),
            land_area_source: text(Field::LandAreaSource),
            land_area_confidence: text(Field::LandAreaConfidence),
            parcel_flags: text(Field::ParcelFlags),
            source_primary: primary.map(|s| s.code().to_string()).unwrap_or_default(),
            source_secondary: secondary.join(LIST_SEP),
            source_refs: park.source_refs.iter().cloned().collect::<Vec<_>>().join(LIST_SEP),
            provenance: serde_json::to_string(&provenance)?,
            confidence: format!("{:.2}", park.confidence),
            needs_review: if park.needs_review { "1" } else { "0" }.to_string(),
            review_reasons: park.review_reasons.join(LIST_SEP),
            date_collected_utc: park.collected_at.to_rfc3339(),
            parcel_checked_at: checked(EnrichmentKind::ParcelArea),
            address_checked_at: checked(EnrichmentKind::Address),
            brand_checked_at: checked(EnrichmentKind::Brand),
            place_details_checked_at: checked(EnrichmentKind::PlaceDetails),
            notes: park.notes.join(LIST_SEP),
        })
    }

    pub fn into_entity(self, line: usize) -> Result<ParkEntity> {
        let corrupt = |reason: String| RegistryError::corrupt(line, reason);

        let park_id = self.park_id.trim().to_string();
        if park_id.is_empty() {
            return Err(corrupt("blank park_id".into()));
        }

        let collected_at = parse_time(&self.date_collected_utc)
            .map_err(|e| corrupt(format!("date_collected_utc: {}", e)))?
            .ok_or_else(|| corrupt("blank date_collected_utc".into()))?;

        let provenance: BTreeMap<String, Provenance> = if self.provenance.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&self.provenance).map_err(|e| corrupt(format!("provenance: {}", e)))?
        };

        let mut park = ParkEntity::new(park_id, collected_at);

        // Column values
        let mut values: Vec<(Field, FieldValue)> = Vec::new();
        let texts = [
            (Field::Name, &self.name),
            (Field::State, &self.state),
            (Field::AddressLine, &self.address_line),
            (Field::Suburb, &self.suburb),
            (Field::Postcode, &self.postcode),
            (Field::Lga, &self.lga),
            (Field::OperatorBrand, &self.operator_brand),
            (Field::OperatorCompany, &self.operator_company),
            (Field::OperatorSourceUrl, &self.operator_source_url),
            (Field::Website, &self.website),
            (Field::Phone, &self.phone),
            (Field::Email, &self.email),
            (Field::Tourism, &self.tourism),
            (Field::LandParcelIds, &self.land_parcel_ids),
            (Field::LandAreaSource, &self.land_area_source),
            (Field::LandAreaConfidence, &self.land_area_confidence),
            (Field::ParcelFlags, &self.parcel_flags),
            (Field::BusinessStatus, &self.business_status),
        ];
        for (field, raw) in texts {
            if !raw.trim().is_empty() {
                values.push((field, FieldValue::Text(raw.clone())));
            }
        }

        let counts = [
            (Field::SitesTotal, &self.sites_total),
            (Field::SitesPowered, &self.sites_powered),
            (Field::SitesPermanent, &self.sites_permanent),
        ];
        for (field, raw) in counts {
            if !raw.trim().is_empty() {
                let n = raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| corrupt(format!("{}: {}", field, e)))?;
                values.push((field, FieldValue::Count(n)));
            }
        }

        if !self.land_area_sqm.trim().is_empty() {
            let area = parse_f64(&self.land_area_sqm).map_err(|e| corrupt(format!("land_area_sqm: {}", e)))?;
            values.push((Field::LandAreaSqm, FieldValue::Area(area)));
        }

        match (self.latitude.trim(), self.longitude.trim()) {
            ("", "") => {}
            (lat, lon) => {
                let lat = parse_f64(lat).map_err(|e| corrupt(format!("latitude: {}", e)))?;
                let lon = parse_f64(lon).map_err(|e| corrupt(format!("longitude: {}", e)))?;
                let point = GeoPoint::new(lat, lon)
                    .ok_or_else(|| corrupt(format!("coordinates out of range: {},{}", lat, lon)))?;
                values.push((Field::Coordinates, FieldValue::Point(point)));
            }
        }

        // Every value must say where it came from
        for (field, value) in values {
            let prov = provenance
                .get(field.as_str())
                .copied()
                .ok_or_else(|| corrupt(format!("{} has a value but no provenance", field)))?;
            park.fields.insert(field, FieldEntry { value, provenance: prov });
        }

        park.category = Category::from_str(&self.category)
            .ok_or_else(|| corrupt(format!("unknown category '{}'", self.category)))?;
        park.opening_status = OpeningStatus::from_str(&self.opening_status)
            .ok_or_else(|| corrupt(format!("unknown opening_status '{}'", self.opening_status)))?;
        park.confidence = if self.confidence.trim().is_empty() {
            0.0
        } else {
            parse_f64(&self.confidence).map_err(|e| corrupt(format!("confidence: {}", e)))?
        };
        park.needs_review = match self.needs_review.trim() {
            "1" | "true" | "" => true,
            "0" | "false" => false,
            other => return Err(corrupt(format!("needs_review '{}'", other))),
        };
        park.review_reasons = split_list(&self.review_reasons);
        park.notes = split_list(&self.notes);
        park.source_refs = split_list(&self.source_refs).into_iter().collect();

        let mut contributors = BTreeSet::new();
        for code in std::iter::once(self.source_primary.as_str()).chain(self.source_secondary.split(LIST_SEP)) {
            let code = code.trim();
            if code.is_empty() {
                continue;
            }
            let tag = SourceTag::from_code(code).ok_or_else(|| corrupt(format!("unknown source '{}'", code)))?;
            contributors.insert(tag);
        }
        park.contributors = contributors;

        let checkpoints = [
            (EnrichmentKind::ParcelArea, &self.parcel_checked_at),
            (EnrichmentKind::Address, &self.address_checked_at),
            (EnrichmentKind::Brand, &self.brand_checked_at),
            (EnrichmentKind::PlaceDetails, &self.place_details_checked_at),
        ];
        for (kind, raw) in checkpoints {
            if let Some(at) = parse_time(raw).map_err(|e| corrupt(format!("{} checkpoint: {}", kind, e)))? {
                park.mark_enriched(kind, at);
            }
        }

        Ok(park)
    }
}

fn parse_time(raw: &str) -> std::result::Result<Option<DateTime<Utc>>, chrono::ParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw).map(|t| Some(t.with_timezone(&Utc)))
}

fn parse_f64(raw: &str) -> std::result::Result<f64, String> {
    let v: f64 = raw.trim().parse().map_err(|e: std::num::ParseFloatError| e.to_string())?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("not a finite number: {}", raw))
    }
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(LIST_SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::{Clock, FixedClock};
    use std::io::Write;

    fn sample_park() -> ParkEntity {
        let clock = FixedClock::at(2025, 3, 1);
        let prov = Provenance::new(SourceTag::MapFeature, clock.now());
        let mut park = ParkEntity::new("park_0123456789abcdef", clock.now());
        park.put(Field::Name, FieldValue::Text("Sunny Caravan Park".into()), prov);
        park.put(Field::Coordinates, FieldValue::Point(GeoPoint::new(-33.1, 151.2).unwrap()), prov);
        park.put(Field::SitesTotal, FieldValue::Count(120), prov);
        park.put(
            Field::LandAreaSqm,
            FieldValue::Area(2700.0),
            Provenance::new(SourceTag::ParcelService, clock.now()),
        );
        park.put(
            Field::OperatorBrand,
            FieldValue::Text("BIG4".into()),
            Provenance::new(SourceTag::BrandDirectory, clock.now()),
        );
        park.contributors.insert(SourceTag::MapFeature);
        park.contributors.insert(SourceTag::BrandDirectory);
        park.source_refs.insert("osm:way:1".into());
        park.category = Category::Holiday;
        park.opening_status = OpeningStatus::Open;
        park.confidence = 0.8;
        park.needs_review = false;
        park.add_note("permanent residents");
        park.mark_enriched(EnrichmentKind::ParcelArea, clock.now());
        park
    }

    #[test]
    fn test_save_and_load_csv_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvRegistryStore::new(dir.path().join("registry.csv"));

        let mut registry = Registry::new();
        registry.upsert(sample_park());
        store.save(&registry).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, registry);
        assert!(!store.temp_path().exists());
        println!("✅ Registry survives a save/load cycle");
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvRegistryStore::new(dir.path().join("nope.csv"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_header_in_export_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.csv");
        let store = CsvRegistryStore::new(&path);
        let mut registry = Registry::new();
        registry.upsert(sample_park());
        store.save(&registry).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.starts_with("park_id,name,state,address_line,suburb,postcode,lga,latitude,longitude,category"));
        assert!(header.contains(",opening_status,business_status,website,"));
        assert!(header.ends_with("brand_checked_at,place_details_checked_at,notes"));
    }

    #[test]
    fn test_value_without_provenance_is_corrupt() {
        let mut row = RegistryRow::from_entity(&sample_park()).unwrap();
        row.phone = "02 6685 0000".into();
        let err = row.into_entity(2).unwrap_err();
        assert!(matches!(err, RegistryError::CorruptRegistry { row: 2, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_garbled_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "park_id,name").unwrap();
        writeln!(file, "park_x,Sunny").unwrap();

        let err = CsvRegistryStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RegistryError::CorruptRegistry { .. }));
    }

    #[test]
    fn test_window_and_parcel_owner() {
        let mut registry = Registry::new();
        for i in 0..5 {
            let mut park = ParkEntity::new(format!("park_{}", i), Utc::now());
            if i == 3 {
                park.put(
                    Field::LandParcelIds,
                    FieldValue::Text("1/DP100;2/DP100".into()),
                    Provenance::new(SourceTag::ParcelService, Utc::now()),
                );
            }
            registry.upsert(park);
        }

        assert_eq!(registry.window(1, 2), vec!["park_1".to_string(), "park_2".to_string()]);
        assert_eq!(registry.window(4, 10), vec!["park_4".to_string()]);
        assert!(registry.window(9, 10).is_empty());

        assert_eq!(registry.parcel_owner("2/DP100", "park_0"), Some("park_3"));
        assert_eq!(registry.parcel_owner("2/DP100", "park_3"), None);
    }
}
