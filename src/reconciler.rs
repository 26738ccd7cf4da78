// ⚖️ Field Reconciler - merge a cluster into one canonical park
//
// Per field, independently:
//   higher precedence wins
//   equal precedence → most recent observation wins
//   blank never overwrites a present value
//   lower precedence never overwrites (RegressionRejected, counted)
//
// Allowed exceptions: land fields may be recomputed (and cleared) by a newer
// parcel result; an address line may gain a house number from any source.

use crate::config::{PrecedenceTable, ReconcilerConfig};
use crate::entity::{CandidateRecord, Field, FieldValue, ParkEntity};
use crate::error::RegistryError;
use crate::geo::GeoPoint;
use crate::provenance::{Provenance, SourceTag};
use crate::resolver::MergeCluster;
use log::{debug, warn};
use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

/// Fields the parcel step recomputes as a unit
const RECOMPUTED_FIELDS: [Field; 5] = [
    Field::LandParcelIds,
    Field::LandAreaSqm,
    Field::LandAreaSource,
    Field::LandAreaConfidence,
    Field::ParcelFlags,
];

// ============================================================================
// FIELD UPDATE
// ============================================================================

/// FieldUpdate - one proposed write. `value: None` asks to clear the field,
/// which is only honoured for recomputed land fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: Field,
    pub value: Option<FieldValue>,
    pub provenance: Provenance,
}

impl FieldUpdate {
    pub fn set(field: Field, value: FieldValue, provenance: Provenance) -> Self {
        FieldUpdate {
            field,
            value: Some(value),
            provenance,
        }
    }

    pub fn text(field: Field, value: impl Into<String>, provenance: Provenance) -> Self {
        FieldUpdate::set(field, FieldValue::Text(value.into()), provenance)
    }

    pub fn clear(field: Field, provenance: Provenance) -> Self {
        FieldUpdate {
            field,
            value: None,
            provenance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Applied,
    Unchanged,
    Regression,
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Fields whose value changed, in application order
    pub applied: Vec<Field>,

    pub unchanged: usize,

    /// RegressionRejected, one per refused write
    pub rejected: Vec<RegistryError>,

    /// AmbiguousMerge, one per contradiction found
    pub ambiguous: Vec<RegistryError>,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn absorb(&mut self, other: ReconcileOutcome) {
        self.applied.extend(other.applied);
        self.unchanged += other.unchanged;
        self.rejected.extend(other.rejected);
        self.ambiguous.extend(other.ambiguous);
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct FieldReconciler {
    precedence: PrecedenceTable,
    config: ReconcilerConfig,
}

impl FieldReconciler {
    pub fn new(precedence: PrecedenceTable, config: ReconcilerConfig) -> Self {
        FieldReconciler { precedence, config }
    }

    pub fn precedence(&self) -> &PrecedenceTable {
        &self.precedence
    }

    /// What applying `update` to `park` would do, without doing it
    pub fn decide(&self, park: &ParkEntity, update: &FieldUpdate) -> WriteDecision {
        let field = update.field;
        let current = park.fields.get(&field);

        let value = match &update.value {
            Some(v) if !v.is_blank() => v,
            _ => {
                // Blank: only a recomputation may clear
                return match current {
                    Some(entry)
                        if RECOMPUTED_FIELDS.contains(&field)
                            && self.outranks_or_newer(field, &update.provenance, &entry.provenance) =>
                    {
                        WriteDecision::Applied
                    }
                    _ => WriteDecision::Unchanged,
                };
            }
        };

        let entry = match current {
            None => return WriteDecision::Applied,
            Some(entry) => entry,
        };

        if field == Field::AddressLine {
            let had_number = entry.value.as_text().map(has_house_number).unwrap_or(false);
            let has_number = value.as_text().map(has_house_number).unwrap_or(false);
            if had_number && !has_number {
                return WriteDecision::Unchanged;
            }
            if !had_number && has_number {
                return WriteDecision::Applied;
            }
        }

        let new_rank = self.precedence.rank(field, update.provenance.source);
        let cur_rank = self.precedence.rank(field, entry.provenance.source);

        if new_rank > cur_rank {
            return WriteDecision::Applied;
        }
        if new_rank == cur_rank {
            return if update.provenance.observed_at > entry.provenance.observed_at {
                WriteDecision::Applied
            } else {
                WriteDecision::Unchanged
            };
        }

        if entry.value == *value {
            WriteDecision::Unchanged
        } else {
            WriteDecision::Regression
        }
    }

    /// Apply one update under the precedence rules
    pub fn apply(&self, park: &mut ParkEntity, update: FieldUpdate, outcome: &mut ReconcileOutcome) -> WriteDecision {
        let decision = self.decide(park, &update);
        match decision {
            WriteDecision::Applied => {
                let changed = park.get(update.field) != update.value.as_ref();
                match update.value {
                    Some(value) if !value.is_blank() => park.put(update.field, value, update.provenance),
                    _ => park.clear(update.field),
                }
                if changed {
                    outcome.applied.push(update.field);
                } else {
                    // same value, fresher provenance
                    outcome.unchanged += 1;
                }
            }
            WriteDecision::Unchanged => outcome.unchanged += 1,
            WriteDecision::Regression => {
                let current = park.get(update.field).map(|v| v.to_string()).unwrap_or_default();
                let attempted = update.value.as_ref().map(|v| v.to_string()).unwrap_or_default();
                debug!(
                    "{}: {} from {} would regress '{}'",
                    park.park_id, update.field, update.provenance.source, current
                );
                outcome.rejected.push(RegistryError::RegressionRejected {
                    park_id: park.park_id.clone(),
                    field: update.field.to_string(),
                    attempted,
                    current,
                });
            }
        }
        decision
    }

    pub fn apply_all<I>(&self, park: &mut ParkEntity, updates: I) -> ReconcileOutcome
    where
        I: IntoIterator<Item = FieldUpdate>,
    {
        let mut outcome = ReconcileOutcome::default();
        for update in updates {
            self.apply(park, update, &mut outcome);
        }
        outcome
    }

    /// Merge every member of a cluster into `park`
    pub fn reconcile(&self, park: &mut ParkEntity, cluster: &MergeCluster) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for member in &cluster.members {
            park.contributors.insert(member.source);
            if let Some(r) = &member.source_ref {
                park.source_refs.insert(r.clone());
            }
            if let Some(note) = &member.notes {
                park.add_note(note.clone());
            }

            let provenance = member.provenance();
            for (field, value) in &member.values {
                self.apply(park, FieldUpdate::set(*field, value.clone(), provenance), &mut outcome);
            }
        }

        for reason in &cluster.contested {
            self.flag_ambiguous(park, reason.clone(), &mut outcome);
        }
        if let Some(reason) = self.coordinate_conflict(park, &cluster.members) {
            self.flag_ambiguous(park, reason, &mut outcome);
        }

        outcome
    }

    /// Member whose name becomes the park's identity: best name precedence,
    /// first in canonical order on ties
    pub fn identity_anchor<'a>(&self, members: &'a [CandidateRecord]) -> Option<&'a CandidateRecord> {
        let mut best: Option<&CandidateRecord> = None;
        for member in members.iter().filter(|m| m.display_name.is_some()) {
            let better = match best {
                None => true,
                Some(b) => {
                    self.precedence.rank(Field::Name, member.source)
                        > self.precedence.rank(Field::Name, b.source)
                }
            };
            if better {
                best = Some(member);
            }
        }
        best.or_else(|| members.first())
    }

    fn outranks_or_newer(&self, field: Field, update: &Provenance, current: &Provenance) -> bool {
        let new_rank = self.precedence.rank(field, update.source);
        let cur_rank = self.precedence.rank(field, current.source);
        new_rank > cur_rank || (new_rank == cur_rank && update.observed_at > current.observed_at)
    }

    /// Two high-precision sources placing the park far apart
    fn coordinate_conflict(&self, park: &ParkEntity, members: &[CandidateRecord]) -> Option<String> {
        let is_precise = |source: SourceTag| self.config.high_precision_sources.contains(&source);

        let mut points: Vec<(GeoPoint, String)> = members
            .iter()
            .filter(|m| is_precise(m.source))
            .filter_map(|m| m.point.map(|p| (p, m.source_ref.clone().unwrap_or_else(|| m.source.to_string()))))
            .collect();

        if let (Some(p), Some(prov)) = (park.point(), park.provenance(Field::Coordinates)) {
            if is_precise(prov.source) {
                points.push((p, format!("current {}", prov.source)));
            }
        }

        for (i, (a, label_a)) in points.iter().enumerate() {
            for (b, label_b) in &points[i + 1..] {
                let d = a.distance_m(b);
                if d > self.config.coordinate_conflict_m {
                    return Some(format!(
                        "high-precision coordinates disagree by {:.0} m ({} vs {})",
                        d, label_a, label_b
                    ));
                }
            }
        }
        None
    }

    fn flag_ambiguous(&self, park: &mut ParkEntity, reason: String, outcome: &mut ReconcileOutcome) {
        warn!("{}: ambiguous merge: {}", park.park_id, reason);
        park.flag_review(reason.clone());
        outcome.ambiguous.push(RegistryError::AmbiguousMerge {
            park_id: park.park_id.clone(),
            reason,
        });
    }
}

impl Default for FieldReconciler {
    fn default() -> Self {
        FieldReconciler::new(PrecedenceTable::default(), ReconcilerConfig::default())
    }
}

/// Leading street number: "12 Beach Rd", "3/45 Ocean Dr", "Lot 7 Pacific Hwy".
/// A trailing number ("Route 66", "Pacific Highway 1") is part of the street.
const HOUSE_NUMBER_PATTERN: &str = r"^\s*(lot\s+|unit\s+|shop\s+)?\d+[a-z]?([/-]\d+[a-z]?)?,?\s+\S";

pub(crate) fn has_house_number(address: &str) -> bool {
    static HOUSE_NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    HOUSE_NUMBER
        .get_or_init(|| RegexBuilder::new(HOUSE_NUMBER_PATTERN).case_insensitive(true).build().ok())
        .as_ref()
        .map(|re| re.is_match(address))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use crate::resolver::EntityResolver;
    use crate::sources::RawRecord;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    fn prov(source: SourceTag, day: u32) -> Provenance {
        Provenance::new(source, at(day))
    }

    fn park() -> ParkEntity {
        ParkEntity::new("park_test", at(1))
    }

    #[test]
    fn test_higher_precedence_wins_and_sticks() {
        let r = FieldReconciler::default();
        let mut p = park();

        r.apply_all(
            &mut p,
            vec![FieldUpdate::text(Field::OperatorBrand, "Sunny Parks", prov(SourceTag::MapFeature, 1))],
        );
        let outcome = r.apply_all(
            &mut p,
            vec![FieldUpdate::text(Field::OperatorBrand, "BIG4", prov(SourceTag::BrandDirectory, 1))],
        );
        assert_eq!(outcome.applied, vec![Field::OperatorBrand]);

        // later but lower precedence → rejected and counted
        let outcome = r.apply_all(
            &mut p,
            vec![FieldUpdate::text(Field::OperatorBrand, "Other", prov(SourceTag::MapFeature, 9))],
        );
        assert_eq!(p.text(Field::OperatorBrand), Some("BIG4"));
        assert_eq!(outcome.rejected_count(), 1);
        assert!(matches!(outcome.rejected[0], RegistryError::RegressionRejected { .. }));
        println!("✅ No-regression rule holds");
    }

    #[test]
    fn test_equal_precedence_newer_wins() {
        let r = FieldReconciler::default();
        let mut p = park();
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::Phone, "02 1111", prov(SourceTag::MapFeature, 2))]);
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::Phone, "02 0000", prov(SourceTag::MapFeature, 1))]);
        assert_eq!(p.text(Field::Phone), Some("02 1111"));
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::Phone, "02 2222", prov(SourceTag::MapFeature, 3))]);
        assert_eq!(p.text(Field::Phone), Some("02 2222"));
        assert_eq!(p.provenance(Field::Phone), Some(prov(SourceTag::MapFeature, 3)));
    }

    #[test]
    fn test_blank_never_overwrites() {
        let r = FieldReconciler::default();
        let mut p = park();
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::Website, "https://sunny.example", prov(SourceTag::MapFeature, 1))]);
        let outcome = r.apply_all(
            &mut p,
            vec![
                FieldUpdate::text(Field::Website, "  ", prov(SourceTag::MapFeature, 5)),
                FieldUpdate::clear(Field::Website, prov(SourceTag::MapFeature, 5)),
            ],
        );
        assert_eq!(p.text(Field::Website), Some("https://sunny.example"));
        assert_eq!(outcome.unchanged, 2);
    }

    #[test]
    fn test_land_fields_recompute_and_clear() {
        let r = FieldReconciler::default();
        let mut p = park();
        r.apply_all(&mut p, vec![FieldUpdate::set(Field::LandAreaSqm, FieldValue::Area(2700.0), prov(SourceTag::ParcelService, 1))]);
        r.apply_all(&mut p, vec![FieldUpdate::clear(Field::LandAreaSqm, prov(SourceTag::ParcelService, 2))]);
        assert_eq!(p.area(Field::LandAreaSqm), None);
    }

    #[test]
    fn test_address_refinement() {
        let r = FieldReconciler::default();
        let mut p = park();
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::AddressLine, "Beach Rd", prov(SourceTag::MapFeature, 1))]);

        // geocoder ranks below map features, but adds the house number
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::AddressLine, "12 Beach Rd", prov(SourceTag::Geocoder, 2))]);
        assert_eq!(p.text(Field::AddressLine), Some("12 Beach Rd"));

        // and the bare street never comes back
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::AddressLine, "Beach Rd", prov(SourceTag::MapFeature, 3))]);
        assert_eq!(p.text(Field::AddressLine), Some("12 Beach Rd"));
    }

    #[test]
    fn test_house_number_must_lead() {
        for line in ["12 Beach Rd", "3/45 Ocean Drive", "7A Lake St", "Lot 5 Pacific Hwy", "10-12 Marine Pde"] {
            assert!(has_house_number(line), "{}", line);
        }
        for line in ["Pacific Highway 1", "Route 66", "Beach Rd", "12", ""] {
            assert!(!has_house_number(line), "{}", line);
        }

        // a numbered route name is not a refinement of a street-only line
        let r = FieldReconciler::default();
        let mut p = park();
        r.apply_all(&mut p, vec![FieldUpdate::text(Field::AddressLine, "Beach Rd", prov(SourceTag::MapFeature, 1))]);
        let outcome = r.apply_all(&mut p, vec![FieldUpdate::text(Field::AddressLine, "Pacific Highway 1", prov(SourceTag::Geocoder, 2))]);
        assert_eq!(p.text(Field::AddressLine), Some("Beach Rd"));
        assert_eq!(outcome.rejected_count(), 1);
    }

    #[test]
    fn test_twin_observations_reconcile_same_in_either_order() {
        // same source, ref, name, point and time; only the phone differs
        let twin = |phone: &str| {
            let mut raw = RawRecord::new(SourceTag::MapFeature, at(1))
                .with_ref("osm:way:7")
                .with_name("Shady Gums Caravan Park")
                .with_coords(-32.18, 152.51);
            raw.phone = Some(phone.to_string());
            normalize(&raw).unwrap()
        };
        let (a, b) = (twin("02 6554 0001"), twin("02 6554 0002"));
        assert_ne!(a.canonical_cmp(&b), std::cmp::Ordering::Equal);

        let r = FieldReconciler::default();
        let phone_after = |candidates: Vec<CandidateRecord>| {
            let resolution = EntityResolver::default().resolve(&candidates);
            assert_eq!(resolution.clusters.len(), 1);
            let mut p = ParkEntity::new("park_twin", at(1));
            r.reconcile(&mut p, &resolution.clusters[0]);
            p.text(Field::Phone).map(str::to_string)
        };
        assert_eq!(phone_after(vec![a.clone(), b.clone()]), phone_after(vec![b, a]));
    }

    #[test]
    fn test_reconcile_sunny_caravan_park_cluster() {
        let osm = RawRecord::new(SourceTag::MapFeature, at(1))
            .with_ref("osm:1")
            .with_name("Sunny Caravan Park")
            .with_coords(-33.100, 151.200);
        let brand = RawRecord::new(SourceTag::BrandDirectory, at(1))
            .with_ref("big4:1")
            .with_name("BIG4 Sunny Caravan Park")
            .with_coords(-33.1002, 151.2001)
            .with_operator("BIG4", "BIG4 Holiday Parks of Australia");

        let candidates = vec![normalize(&osm).unwrap(), normalize(&brand).unwrap()];
        let resolution = EntityResolver::default().resolve(&candidates);
        assert_eq!(resolution.clusters.len(), 1);

        let r = FieldReconciler::default();
        let mut p = park();
        let outcome = r.reconcile(&mut p, &resolution.clusters[0]);

        assert_eq!(p.text(Field::Name), Some("Sunny Caravan Park"));
        assert_eq!(p.text(Field::OperatorBrand), Some("BIG4"));
        assert_eq!(p.provenance(Field::OperatorBrand).unwrap().source, SourceTag::BrandDirectory);
        assert_eq!(p.point(), GeoPoint::new(-33.100, 151.200));
        assert_eq!(p.contributors.len(), 2);
        assert!(outcome.ambiguous.is_empty());

        // second pass changes nothing
        let again = r.reconcile(&mut p, &resolution.clusters[0]);
        assert!(!again.changed());
    }

    #[test]
    fn test_disagreeing_precise_coordinates_flag_review() {
        let a = normalize(
            &RawRecord::new(SourceTag::MapFeature, at(1))
                .with_ref("osm:node:1")
                .with_name("Sunny Caravan Park")
                .with_coords(-33.100, 151.200),
        )
        .unwrap();
        let b = normalize(
            &RawRecord::new(SourceTag::MapFeature, at(1))
                .with_ref("osm:way:2")
                .with_name("Sunny Caravan Park")
                .with_coords(-33.107, 151.200),
        )
        .unwrap();
        let cluster = MergeCluster {
            members: vec![a, b],
            park_id: None,
            contested: Vec::new(),
        };

        let r = FieldReconciler::default();
        let mut p = park();
        p.needs_review = false;
        let outcome = r.reconcile(&mut p, &cluster);

        assert_eq!(outcome.ambiguous.len(), 1);
        assert!(p.needs_review);
        assert!(p.review_reasons[0].contains("disagree"));
    }

    #[test]
    fn test_identity_anchor_prefers_name_precedence() {
        let brand = normalize(
            &RawRecord::new(SourceTag::BrandDirectory, at(1))
                .with_name("BIG4 Sunny")
                .with_coords(-33.1, 151.2),
        )
        .unwrap();
        let osm = normalize(
            &RawRecord::new(SourceTag::MapFeature, at(1))
                .with_name("Sunny Caravan Park")
                .with_coords(-33.1, 151.2),
        )
        .unwrap();
        let members = vec![brand, osm];
        let r = FieldReconciler::default();
        let anchor = r.identity_anchor(&members).unwrap();
        assert_eq!(anchor.source, SourceTag::MapFeature);
    }
}
