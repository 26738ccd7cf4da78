// 🗺️ Parcel area step - cadastral parcels around the park point → land area
//
// One parcel service per jurisdiction. A park whose state has no service is
// not applicable. Zero parcels is still a result: the park is checkpointed
// with area unknown so it is not queried again on every run.

use crate::aggregator::ParcelAggregator;
use crate::batch::{Enrichment, EnrichmentStep};
use crate::config::AggregatorConfig;
use crate::entity::{EnrichmentKind, Field, FieldValue, ParkEntity};
use crate::error::Result;
use crate::geo::Jurisdiction;
use crate::provenance::{Provenance, SourceTag};
use crate::reconciler::FieldUpdate;
use crate::registry::Registry;
use crate::sources::ParcelQuery;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;

pub struct ParcelAreaStep<'a> {
    services: BTreeMap<Jurisdiction, &'a dyn ParcelQuery>,
    aggregator: ParcelAggregator,
    buffer_m: f64,
}

impl<'a> ParcelAreaStep<'a> {
    pub fn new(config: AggregatorConfig) -> Self {
        let buffer_m = config.parcel_buffer_m;
        ParcelAreaStep {
            services: BTreeMap::new(),
            aggregator: ParcelAggregator::new(config),
            buffer_m,
        }
    }

    /// Register the cadastral service for one jurisdiction
    pub fn with_service(mut self, region: Jurisdiction, service: &'a dyn ParcelQuery) -> Self {
        self.services.insert(region, service);
        self
    }

    fn service_for(&self, park: &ParkEntity) -> Option<&'a dyn ParcelQuery> {
        park.state().and_then(|s| self.services.get(&s).copied())
    }
}

impl EnrichmentStep for ParcelAreaStep<'_> {
    fn kind(&self) -> EnrichmentKind {
        EnrichmentKind::ParcelArea
    }

    fn applies_to(&self, park: &ParkEntity) -> bool {
        park.point().is_some() && self.service_for(park).is_some()
    }

    fn enrich(&self, park: &ParkEntity, registry: &Registry, at: DateTime<Utc>) -> Result<Enrichment> {
        let (Some(point), Some(service)) = (park.point(), self.service_for(park)) else {
            return Ok(Enrichment::new());
        };

        let parcels = service.parcels_near(point, self.buffer_m)?;
        let estimate = self.aggregator.aggregate(&parcels, service.source_label(), |id| {
            registry.parcel_owner(id, &park.park_id).map(str::to_string)
        });
        debug!(
            "{}: {} parcels from {}, kept {:?}, area {:?}",
            park.park_id,
            parcels.len(),
            service.source_label(),
            estimate.parcel_ids,
            estimate.area_sqm
        );

        let prov = Provenance::new(SourceTag::ParcelService, at);
        let mut enrichment = Enrichment::new();

        enrichment.updates.push(if estimate.parcel_ids.is_empty() {
            FieldUpdate::clear(Field::LandParcelIds, prov)
        } else {
            FieldUpdate::text(Field::LandParcelIds, estimate.parcel_ids.join(";"), prov)
        });
        enrichment.updates.push(match estimate.area_sqm {
            Some(area) => FieldUpdate::set(Field::LandAreaSqm, FieldValue::Area(area), prov),
            None => FieldUpdate::clear(Field::LandAreaSqm, prov),
        });
        enrichment
            .updates
            .push(FieldUpdate::text(Field::LandAreaSource, estimate.source.clone(), prov));
        enrichment.updates.push(match estimate.confidence {
            Some(c) => FieldUpdate::text(Field::LandAreaConfidence, c.as_str(), prov),
            None => FieldUpdate::clear(Field::LandAreaConfidence, prov),
        });
        enrichment.updates.push(if estimate.flags.is_empty() {
            FieldUpdate::clear(Field::ParcelFlags, prov)
        } else {
            FieldUpdate::text(Field::ParcelFlags, estimate.flags_text(), prov)
        });

        if parcels.is_empty() {
            enrichment = enrichment.with_note(format!(
                "{}: no parcels within {:.0} m",
                service.source_label(),
                self.buffer_m
            ));
        }

        Ok(enrichment)
    }
}
