// 🏕️ Entity Model - candidate observations and canonical parks
//
// Identity vs values:
// - park_id is IDENTITY: derived once from (normalized name, rounded
//   coordinates), never reassigned.
// - Every field is a VALUE with its own provenance, updated independently.

use crate::geo::{round_to, GeoPoint, Jurisdiction, KEY_DECIMALS};
use crate::provenance::{Provenance, SourceTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// FIELDS
// ============================================================================

/// Field - every schema column that carries a reconciled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Coordinates,
    State,
    AddressLine,
    Suburb,
    Postcode,
    Lga,
    Website,
    Phone,
    Email,
    Tourism,
    OperatorBrand,
    OperatorCompany,
    OperatorSourceUrl,
    SitesTotal,
    SitesPowered,
    SitesPermanent,
    LandParcelIds,
    LandAreaSqm,
    LandAreaSource,
    LandAreaConfidence,
    ParcelFlags,
    BusinessStatus,
}

impl Field {
    pub const ALL: [Field; 23] = [
        Field::Name,
        Field::Coordinates,
        Field::State,
        Field::AddressLine,
        Field::Suburb,
        Field::Postcode,
        Field::Lga,
        Field::Website,
        Field::Phone,
        Field::Email,
        Field::Tourism,
        Field::OperatorBrand,
        Field::OperatorCompany,
        Field::OperatorSourceUrl,
        Field::SitesTotal,
        Field::SitesPowered,
        Field::SitesPermanent,
        Field::LandParcelIds,
        Field::LandAreaSqm,
        Field::LandAreaSource,
        Field::LandAreaConfidence,
        Field::ParcelFlags,
        Field::BusinessStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Coordinates => "coordinates",
            Field::State => "state",
            Field::AddressLine => "address_line",
            Field::Suburb => "suburb",
            Field::Postcode => "postcode",
            Field::Lga => "lga",
            Field::Website => "website",
            Field::Phone => "phone",
            Field::Email => "email",
            Field::Tourism => "tourism",
            Field::OperatorBrand => "operator_brand",
            Field::OperatorCompany => "operator_company",
            Field::OperatorSourceUrl => "operator_source_url",
            Field::SitesTotal => "sites_total",
            Field::SitesPowered => "sites_powered",
            Field::SitesPermanent => "sites_permanent",
            Field::LandParcelIds => "land_parcel_ids",
            Field::LandAreaSqm => "land_area_sqm",
            Field::LandAreaSource => "land_area_source",
            Field::LandAreaConfidence => "land_area_confidence",
            Field::ParcelFlags => "parcel_flags",
            Field::BusinessStatus => "business_status",
        }
    }

    pub fn from_str(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FieldValue - typed value of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Count(u32),
    Area(f64),
    Point(GeoPoint),
}

impl FieldValue {
    /// Blank values never overwrite anything
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Area(a) => !a.is_finite(),
            FieldValue::Count(_) | FieldValue::Point(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Count(n) => write!(f, "{}", n),
            FieldValue::Area(a) => write!(f, "{:.2}", a),
            FieldValue::Point(p) => write!(f, "{:.6},{:.6}", p.lat, p.lon),
        }
    }
}

/// FieldEntry - current value + who supplied it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: FieldValue,
    pub provenance: Provenance,
}

// ============================================================================
// CANDIDATE RECORD
// ============================================================================

/// CandidateRecord - one normalized observation of one park from one source.
/// Built by the normalizer, read by the resolver and reconciler, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub source: SourceTag,
    pub source_ref: Option<String>,

    /// Name as published (whitespace cleaned, casing kept)
    pub display_name: Option<String>,

    /// Lowercased, punctuation-free name used for matching ("" if absent)
    pub normalized_name: String,

    /// Coordinates at stored precision
    pub point: Option<GeoPoint>,

    pub state: Option<Jurisdiction>,

    /// Field values this observation proposes
    pub values: BTreeMap<Field, FieldValue>,

    pub notes: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn provenance(&self) -> Provenance {
        Provenance::new(self.source, self.observed_at)
    }

    /// Total order independent of input order; resolver indices and
    /// tie-breaks are taken over this order.
    pub fn canonical_cmp(&self, other: &CandidateRecord) -> Ordering {
        let point_key = |p: &Option<GeoPoint>| p.map(|p| (p.lat, p.lon));
        self.source
            .cmp(&other.source)
            .then_with(|| self.source_ref.cmp(&other.source_ref))
            .then_with(|| self.normalized_name.cmp(&other.normalized_name))
            .then_with(|| match (point_key(&self.point), point_key(&other.point)) {
                (Some(a), Some(b)) => a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)),
                (a, b) => a.is_some().cmp(&b.is_some()),
            })
            .then_with(|| self.observed_at.cmp(&other.observed_at))
            .then_with(|| self.display_name.cmp(&other.display_name))
            .then_with(|| values_key(&self.values).cmp(&values_key(&other.values)))
            .then_with(|| self.notes.cmp(&other.notes))
    }
}

/// Proposed values as comparable text, field by field
fn values_key(values: &BTreeMap<Field, FieldValue>) -> Vec<(Field, String)> {
    values
        .iter()
        .map(|(field, value)| (*field, serde_json::to_string(value).unwrap_or_default()))
        .collect()
}

// ============================================================================
// CLASSIFICATION VALUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Holiday,
    Camp,
    BuiltCommunity,
    Mixed,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Holiday => "holiday",
            Category::Camp => "camp",
            Category::BuiltCommunity => "built_community",
            Category::Mixed => "mixed",
            Category::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Category> {
        match s.trim() {
            "holiday" => Some(Category::Holiday),
            "camp" => Some(Category::Camp),
            "built_community" => Some(Category::BuiltCommunity),
            "mixed" => Some(Category::Mixed),
            "unknown" | "" => Some(Category::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpeningStatus {
    Open,
    Closed,
    Unknown,
}

impl OpeningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpeningStatus::Open => "open",
            OpeningStatus::Closed => "closed",
            OpeningStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<OpeningStatus> {
        match s.trim() {
            "open" => Some(OpeningStatus::Open),
            "closed" => Some(OpeningStatus::Closed),
            "unknown" | "" => Some(OpeningStatus::Unknown),
            _ => None,
        }
    }
}

/// Trading status as a place-details directory reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    Operational,
    ClosedTemporarily,
    ClosedPermanently,
}

impl BusinessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Operational => "operational",
            BusinessStatus::ClosedTemporarily => "closed_temporarily",
            BusinessStatus::ClosedPermanently => "closed_permanently",
        }
    }

    /// Accepts both "closed_permanently" and "CLOSED_PERMANENTLY"
    pub fn from_str(s: &str) -> Option<BusinessStatus> {
        match s.trim().to_lowercase().as_str() {
            "operational" => Some(BusinessStatus::Operational),
            "closed_temporarily" => Some(BusinessStatus::ClosedTemporarily),
            "closed_permanently" => Some(BusinessStatus::ClosedPermanently),
            _ => None,
        }
    }
}

/// Enrichment steps that keep a per-park checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentKind {
    ParcelArea,
    Address,
    Brand,
    PlaceDetails,
}

impl EnrichmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::ParcelArea => "parcel_area",
            EnrichmentKind::Address => "address",
            EnrichmentKind::Brand => "brand",
            EnrichmentKind::PlaceDetails => "place_details",
        }
    }
}

impl fmt::Display for EnrichmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PARK ENTITY
// ============================================================================

/// ParkEntity - canonical record of one physical park
#[derive(Debug, Clone, PartialEq)]
pub struct ParkEntity {
    /// Stable identity, never reassigned
    pub park_id: String,

    /// Current best value per field, each with provenance
    pub fields: BTreeMap<Field, FieldEntry>,

    /// Every source that contributed an observation
    pub contributors: BTreeSet<SourceTag>,

    /// Source-side identifiers seen for this park ("osm:way:123")
    pub source_refs: BTreeSet<String>,

    pub category: Category,
    pub opening_status: OpeningStatus,
    pub confidence: f64,
    pub needs_review: bool,

    /// Reasons recorded by the reconciler (ambiguous merges)
    pub review_reasons: Vec<String>,

    /// Free-text notes carried from sources and enrichment
    pub notes: Vec<String>,

    /// Last successful run per enrichment step
    pub checkpoints: BTreeMap<EnrichmentKind, DateTime<Utc>>,

    pub collected_at: DateTime<Utc>,
}

impl ParkEntity {
    pub fn new(park_id: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        ParkEntity {
            park_id: park_id.into(),
            fields: BTreeMap::new(),
            contributors: BTreeSet::new(),
            source_refs: BTreeSet::new(),
            category: Category::Unknown,
            opening_status: OpeningStatus::Unknown,
            confidence: 0.0,
            needs_review: true,
            review_reasons: Vec::new(),
            notes: Vec::new(),
            checkpoints: BTreeMap::new(),
            collected_at,
        }
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field).map(|e| &e.value)
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn count(&self, field: Field) -> Option<u32> {
        match self.get(field) {
            Some(FieldValue::Count(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn area(&self, field: Field) -> Option<f64> {
        match self.get(field) {
            Some(FieldValue::Area(a)) => Some(*a),
            _ => None,
        }
    }

    pub fn point(&self) -> Option<GeoPoint> {
        match self.get(Field::Coordinates) {
            Some(FieldValue::Point(p)) => Some(*p),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<Jurisdiction> {
        self.text(Field::State).and_then(Jurisdiction::from_code)
    }

    pub fn provenance(&self, field: Field) -> Option<Provenance> {
        self.fields.get(&field).map(|e| e.provenance)
    }

    /// Unconditional write. Callers outside the reconciler go through
    /// `FieldReconciler::apply`, which enforces precedence.
    pub(crate) fn put(&mut self, field: Field, value: FieldValue, provenance: Provenance) {
        self.fields.insert(field, FieldEntry { value, provenance });
    }

    pub(crate) fn clear(&mut self, field: Field) {
        self.fields.remove(&field);
    }

    pub fn is_enriched(&self, kind: EnrichmentKind) -> bool {
        self.checkpoints.contains_key(&kind)
    }

    pub fn mark_enriched(&mut self, kind: EnrichmentKind, at: DateTime<Utc>) {
        self.checkpoints.insert(kind, at);
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !note.trim().is_empty() && !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    pub fn flag_review(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.review_reasons.contains(&reason) {
            self.review_reasons.push(reason);
        }
        self.needs_review = true;
    }

    /// Source that supplied the identity (name) field
    pub fn primary_source(&self) -> Option<SourceTag> {
        self.provenance(Field::Name)
            .or_else(|| self.provenance(Field::Coordinates))
            .map(|p| p.source)
    }
}

/// Deterministic park id from identity: normalized name + coordinates at
/// blocking precision. Same inputs → same id, whatever the insertion order.
pub fn derive_park_id(normalized_name: &str, point: Option<GeoPoint>) -> String {
    let coords = match point {
        Some(p) => format!(
            "{:.3}|{:.3}",
            round_to(p.lat, KEY_DECIMALS),
            round_to(p.lon, KEY_DECIMALS)
        ),
        None => "-|-".to_string(),
    };
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", normalized_name, coords));
    let digest = format!("{:x}", hasher.finalize());
    format!("park_{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::{Clock, FixedClock};

    #[test]
    fn test_park_id_is_deterministic() {
        let p = GeoPoint::new(-33.1, 151.2);
        let a = derive_park_id("sunny caravan park", p);
        let b = derive_park_id("sunny caravan park", p);
        assert_eq!(a, b);
        assert!(a.starts_with("park_"));
        assert_eq!(a.len(), "park_".len() + 16);
    }

    #[test]
    fn test_park_id_ignores_sub_key_jitter() {
        let a = derive_park_id("sunny caravan park", GeoPoint::new(-33.1000, 151.2000));
        let b = derive_park_id("sunny caravan park", GeoPoint::new(-33.1002, 151.2001));
        assert_eq!(a, b);
        let c = derive_park_id("sunny caravan park", GeoPoint::new(-33.2, 151.2));
        assert_ne!(a, c);
    }

    #[test]
    fn test_blank_values() {
        assert!(FieldValue::Text("   ".into()).is_blank());
        assert!(FieldValue::Area(f64::NAN).is_blank());
        assert!(!FieldValue::Count(0).is_blank());
        assert!(!FieldValue::Text("x".into()).is_blank());
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_str(field.as_str()), Some(field));
        }
    }

    #[test]
    fn test_entity_notes_and_review() {
        let clock = FixedClock::at(2025, 1, 1);
        let mut park = ParkEntity::new("park_x", clock.now());
        park.needs_review = false;
        park.add_note("permanent residents");
        park.add_note("permanent residents");
        park.flag_review("coordinates disagree");
        assert_eq!(park.notes.len(), 1);
        assert!(park.needs_review);
        assert_eq!(park.review_reasons, vec!["coordinates disagree".to_string()]);
    }
}
