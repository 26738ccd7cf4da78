// 📮 Address step - reverse geocode parks with missing address fields
//
// Fills blanks only. An address line without a house number may be refined
// by one that has it; everything else already present is left alone unless
// refresh_all is set. Answers (including "not found") are cached in the
// ledger by micro-degree coordinates so re-runs never re-query.

use crate::batch::{Enrichment, EnrichmentStep};
use crate::entity::{EnrichmentKind, Field, ParkEntity};
use crate::error::Result;
use crate::geo::{GeoPoint, Jurisdiction};
use crate::ledger::Ledger;
use crate::provenance::{Provenance, SourceTag};
use crate::reconciler::{has_house_number, FieldUpdate};
use crate::registry::Registry;
use crate::sources::{AddressLookup, Geocoder};
use chrono::{DateTime, Utc};
use log::debug;

const ADDRESS_FIELDS: [Field; 4] = [Field::AddressLine, Field::Suburb, Field::Postcode, Field::Lga];

pub struct AddressStep<'a> {
    geocoder: &'a dyn Geocoder,
    cache: Option<&'a Ledger>,
    refresh_all: bool,
}

impl<'a> AddressStep<'a> {
    pub fn new(geocoder: &'a dyn Geocoder) -> Self {
        AddressStep {
            geocoder,
            cache: None,
            refresh_all: false,
        }
    }

    pub fn with_cache(mut self, ledger: &'a Ledger) -> Self {
        self.cache = Some(ledger);
        self
    }

    /// Offer every geocoded field, not just the missing ones
    pub fn with_refresh_all(mut self, refresh_all: bool) -> Self {
        self.refresh_all = refresh_all;
        self
    }

    fn lookup(&self, point: GeoPoint, at: DateTime<Utc>) -> Result<Option<AddressLookup>> {
        if let Some(ledger) = self.cache {
            if let Some(cached) = ledger.cached_address(point)? {
                debug!("geocode cache hit at {:?}", point.micro_degrees());
                return Ok(cached);
            }
        }

        let answer = self.geocoder.reverse(point)?;
        if let Some(ledger) = self.cache {
            ledger.cache_address(point, answer.as_ref(), at)?;
        }
        Ok(answer)
    }

    fn wants(&self, park: &ParkEntity, field: Field, value: &str) -> bool {
        match park.text(field) {
            None => true,
            Some(_) if self.refresh_all => true,
            Some(current) => field == Field::AddressLine && !has_house_number(current) && has_house_number(value),
        }
    }
}

impl EnrichmentStep for AddressStep<'_> {
    fn kind(&self) -> EnrichmentKind {
        EnrichmentKind::Address
    }

    fn applies_to(&self, park: &ParkEntity) -> bool {
        park.point().is_some() && (self.refresh_all || ADDRESS_FIELDS.iter().any(|f| park.text(*f).is_none()))
    }

    fn enrich(&self, park: &ParkEntity, _registry: &Registry, at: DateTime<Utc>) -> Result<Enrichment> {
        let Some(point) = park.point() else {
            return Ok(Enrichment::new());
        };

        let Some(found) = self.lookup(point, at)?.filter(|a| !a.is_empty()) else {
            return Ok(Enrichment::new().with_note("geocoder: no address at point"));
        };

        let prov = Provenance::new(SourceTag::Geocoder, at);
        let mut enrichment = Enrichment::new();
        let offered = [
            (Field::AddressLine, &found.address_line),
            (Field::Suburb, &found.suburb),
            (Field::Postcode, &found.postcode),
            (Field::Lga, &found.lga),
        ];
        for (field, value) in offered {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                if self.wants(park, field, value) {
                    enrichment.updates.push(FieldUpdate::text(field, value, prov));
                }
            }
        }

        if park.state().is_none() {
            if let Some(state) = found.postcode.as_deref().and_then(Jurisdiction::from_postcode) {
                enrichment.updates.push(FieldUpdate::text(Field::State, state.code(), prov));
            }
        }

        Ok(enrichment)
    }
}
