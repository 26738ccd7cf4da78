// 📇 Place details step - phone, website and trading status from a
// place-details directory
//
// The directory is searched by park name near the park point. Its best
// listing is trusted only when name and distance agree well enough. Phone
// and website fill blanks only; the business status is always offered, and
// a permanently closed listing makes the classifier mark the park closed.

use crate::batch::{Enrichment, EnrichmentStep};
use crate::entity::{BusinessStatus, EnrichmentKind, Field, ParkEntity};
use crate::error::Result;
use crate::names::{name_similarity, normalize_name};
use crate::provenance::{Provenance, SourceTag};
use crate::reconciler::FieldUpdate;
use crate::registry::Registry;
use crate::sources::{PlaceDetails, PlaceMatch};
use chrono::{DateTime, Utc};
use log::{debug, warn};

/// Listings below this score are ignored
const MIN_MATCH_SCORE: f64 = 0.5;

/// Searches are biased to this radius; a listing at or beyond it earns no
/// distance credit
const SEARCH_RADIUS_M: f64 = 5000.0;

const NAME_WEIGHT: f64 = 0.6;
const DISTANCE_WEIGHT: f64 = 0.3;

/// Distance credit for a listing without coordinates
const UNKNOWN_DISTANCE_SCORE: f64 = 0.5;

pub struct PlaceDetailsStep<'a> {
    places: &'a dyn PlaceDetails,
    min_score: f64,
}

impl<'a> PlaceDetailsStep<'a> {
    pub fn new(places: &'a dyn PlaceDetails) -> Self {
        PlaceDetailsStep {
            places,
            min_score: MIN_MATCH_SCORE,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    /// How well a listing matches the park, 0.0 ..= 0.9
    pub fn match_score(park: &ParkEntity, listing: &PlaceMatch) -> f64 {
        let name = park.text(Field::Name).map(normalize_name).unwrap_or_default();
        let similarity = name_similarity(&name, &normalize_name(&listing.name));

        let closeness = match (park.point(), listing.point) {
            (Some(a), Some(b)) => (1.0 - a.distance_m(&b) / SEARCH_RADIUS_M).max(0.0),
            _ => UNKNOWN_DISTANCE_SCORE,
        };

        NAME_WEIGHT * similarity + DISTANCE_WEIGHT * closeness
    }
}

impl EnrichmentStep for PlaceDetailsStep<'_> {
    fn kind(&self) -> EnrichmentKind {
        EnrichmentKind::PlaceDetails
    }

    fn applies_to(&self, park: &ParkEntity) -> bool {
        park.text(Field::Name).is_some() && park.point().is_some()
    }

    fn enrich(&self, park: &ParkEntity, _registry: &Registry, at: DateTime<Utc>) -> Result<Enrichment> {
        let (Some(name), Some(point)) = (park.text(Field::Name), park.point()) else {
            return Ok(Enrichment::new());
        };

        let Some(listing) = self.places.find(name, point)? else {
            return Ok(Enrichment::new().with_note("place details: no listing"));
        };

        let score = Self::match_score(park, &listing);
        if score < self.min_score {
            debug!("{}: listing '{}' scored {:.2}, ignored", park.park_id, listing.name, score);
            return Ok(Enrichment::new().with_note(format!(
                "place details: '{}' rejected (match {:.2})",
                listing.name, score
            )));
        }

        let prov = Provenance::new(SourceTag::PlaceDetails, at);
        let mut enrichment = Enrichment::new();

        let offered = [(Field::Phone, &listing.phone), (Field::Website, &listing.website)];
        for (field, value) in offered {
            let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            if park.text(field).is_none() {
                enrichment.updates.push(FieldUpdate::text(field, value, prov));
            }
        }

        if let Some(raw) = listing.business_status.as_deref() {
            match BusinessStatus::from_str(raw) {
                Some(status) => enrichment
                    .updates
                    .push(FieldUpdate::text(Field::BusinessStatus, status.as_str(), prov)),
                None => warn!("{}: unknown business status '{}'", park.park_id, raw),
            }
        }

        Ok(enrichment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchCoordinator, BatchWindow};
    use crate::classifier::RuleEngine;
    use crate::entity::{FieldValue, OpeningStatus};
    use crate::error::RegistryError;
    use crate::geo::GeoPoint;
    use crate::provenance::FixedClock;
    use crate::reconciler::FieldReconciler;
    use crate::registry::{CsvRegistryStore, RegistryStore};

    const HERE: (f64, f64) = (-32.18, 152.51);

    struct Listing(Option<PlaceMatch>);

    impl PlaceDetails for Listing {
        fn find(&self, _name: &str, _near: GeoPoint) -> Result<Option<PlaceMatch>> {
            Ok(self.0.clone())
        }
    }

    struct Offline;

    impl PlaceDetails for Offline {
        fn find(&self, _name: &str, _near: GeoPoint) -> Result<Option<PlaceMatch>> {
            Err(RegistryError::unavailable("place_details", "quota exceeded"))
        }
    }

    fn listing(name: &str, lat: f64, lon: f64, status: &str) -> PlaceMatch {
        PlaceMatch {
            place_ref: "place:1".to_string(),
            name: name.to_string(),
            point: GeoPoint::new(lat, lon),
            phone: Some("02 6554 1234".to_string()),
            website: Some("https://shadygums.com.au".to_string()),
            business_status: Some(status.to_string()),
        }
    }

    fn park(fields: &[(Field, &str)]) -> ParkEntity {
        let at = Utc::now();
        let prov = Provenance::new(SourceTag::MapFeature, at);
        let mut park = ParkEntity::new("park_a", at);
        park.contributors.insert(SourceTag::MapFeature);
        park.put(Field::Name, FieldValue::Text("Shady Gums Caravan Park".into()), prov);
        if let Some(p) = GeoPoint::new(HERE.0, HERE.1) {
            park.put(Field::Coordinates, FieldValue::Point(p), prov);
        }
        for (field, value) in fields {
            park.put(*field, FieldValue::Text(value.to_string()), prov);
        }
        park
    }

    fn value_of(e: &Enrichment, field: Field) -> Option<&FieldValue> {
        e.updates.iter().find(|u| u.field == field).and_then(|u| u.value.as_ref())
    }

    #[test]
    fn test_fills_missing_contacts_and_status() {
        let places = Listing(Some(listing("Shady Gums Caravan Park", -32.1805, 152.5102, "OPERATIONAL")));
        let step = PlaceDetailsStep::new(&places);

        let e = step
            .enrich(&park(&[(Field::Phone, "02 6554 0000")]), &Registry::new(), Utc::now())
            .unwrap();
        assert_eq!(value_of(&e, Field::Phone), None);
        assert_eq!(value_of(&e, Field::Website), Some(&FieldValue::Text("https://shadygums.com.au".into())));
        assert_eq!(value_of(&e, Field::BusinessStatus), Some(&FieldValue::Text("operational".into())));
    }

    #[test]
    fn test_far_listing_with_other_name_rejected() {
        let places = Listing(Some(listing("Sunset Motor Inn", -32.40, 152.51, "OPERATIONAL")));
        let e = PlaceDetailsStep::new(&places)
            .enrich(&park(&[]), &Registry::new(), Utc::now())
            .unwrap();
        assert!(e.updates.is_empty());
        assert!(e.notes[0].contains("rejected"));
    }

    #[test]
    fn test_no_listing_is_a_note() {
        let places = Listing(None);
        let e = PlaceDetailsStep::new(&places)
            .enrich(&park(&[]), &Registry::new(), Utc::now())
            .unwrap();
        assert!(e.updates.is_empty());
        assert_eq!(e.notes, vec!["place details: no listing".to_string()]);
    }

    #[test]
    fn test_directory_outage_is_transient() {
        let err = PlaceDetailsStep::new(&Offline)
            .enrich(&park(&[]), &Registry::new(), Utc::now())
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_permanently_closed_listing_closes_park() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvRegistryStore::new(dir.path().join("registry.csv"));
        let mut registry = Registry::new();
        registry.upsert(park(&[(Field::Tourism, "caravan_site")]));
        store.save(&registry).unwrap();

        let places = Listing(Some(listing("Shady Gums Caravan Park", HERE.0, HERE.1, "CLOSED_PERMANENTLY")));
        let step = PlaceDetailsStep::new(&places);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 3, 1));
        let report = BatchCoordinator::new(&store, &reconciler, &classifier, &clock)
            .run(&step, BatchWindow::all(), false)
            .unwrap();
        assert_eq!(report.committed, 1);

        let park = store.load().unwrap().get("park_a").cloned().unwrap();
        assert_eq!(park.text(Field::BusinessStatus), Some("closed_permanently"));
        assert_eq!(park.opening_status, OpeningStatus::Closed);
        assert!(park.is_enriched(EnrichmentKind::PlaceDetails));
        println!("✅ closed listing survives the registry round trip");
    }
}
