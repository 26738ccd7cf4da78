// 🧹 Source Record Normalizer - raw observation → CandidateRecord
//
// Pure function. Every source shape ends up as the same typed candidate so the
// resolver and reconciler never look at source-specific attributes.

use crate::entity::{CandidateRecord, Field, FieldValue};
use crate::error::{RegistryError, Result};
use crate::geo::{GeoPoint, Jurisdiction};
use crate::names::{clean_display, normalize_name};
use crate::sources::RawRecord;
use log::debug;
use std::collections::BTreeMap;

/// Normalize one raw record. Rejects records with neither a usable name nor
/// a valid coordinate pair.
pub fn normalize(raw: &RawRecord) -> Result<CandidateRecord> {
    let display_name = raw
        .name
        .as_deref()
        .map(clean_display)
        .filter(|n| !normalize_name(n).is_empty());
    let normalized_name = display_name.as_deref().map(normalize_name).unwrap_or_default();

    let point = match (raw.lat, raw.lon) {
        (Some(lat), Some(lon)) => {
            let p = GeoPoint::new(lat, lon).map(|p| p.normalized());
            if p.is_none() {
                debug!("{} record {:?}: dropping invalid coordinates {},{}", raw.source, raw.source_ref, lat, lon);
            }
            p
        }
        _ => None,
    };

    if display_name.is_none() && point.is_none() {
        return Err(RegistryError::MalformedSource {
            source_tag: raw.source.to_string(),
            reason: format!(
                "record {} has neither a name nor a coordinate pair",
                raw.source_ref.as_deref().unwrap_or("<no ref>")
            ),
        });
    }

    let mut values = BTreeMap::new();

    if let Some(name) = &display_name {
        values.insert(Field::Name, FieldValue::Text(name.clone()));
    }
    if let Some(p) = point {
        values.insert(Field::Coordinates, FieldValue::Point(p));
    }

    // Address tags (OSM addr:* scheme)
    let addr = |key: &str| text(raw.address_tags.get(key).map(String::as_str));
    let address_line = match (addr("addr:housenumber"), addr("addr:street")) {
        (Some(number), Some(street)) => Some(format!("{} {}", number, street)),
        (None, Some(street)) => Some(street),
        _ => None,
    };
    let postcode = addr("addr:postcode");
    put_text(&mut values, Field::AddressLine, address_line);
    put_text(&mut values, Field::Suburb, addr("addr:city").or_else(|| addr("addr:suburb")));
    put_text(&mut values, Field::Postcode, postcode.clone());
    put_text(&mut values, Field::Lga, addr("lga"));

    let state = text(raw.state.as_deref())
        .and_then(|s| Jurisdiction::from_code(&s))
        .or_else(|| postcode.as_deref().and_then(Jurisdiction::from_postcode));
    if let Some(state) = state {
        values.insert(Field::State, FieldValue::Text(state.code().to_string()));
    }

    put_text(&mut values, Field::Website, text(raw.website.as_deref()));
    put_text(&mut values, Field::Phone, text(raw.phone.as_deref()));
    put_text(&mut values, Field::Email, text(raw.email.as_deref()).map(|e| e.to_lowercase()));
    put_text(&mut values, Field::Tourism, text(raw.tags.get("tourism").map(String::as_str)));

    // Directory columns first, map brand/operator tags as fallback
    let tag = |key: &str| text(raw.tags.get(key).map(String::as_str));
    put_text(
        &mut values,
        Field::OperatorBrand,
        text(raw.operator_brand.as_deref()).or_else(|| tag("brand")),
    );
    put_text(
        &mut values,
        Field::OperatorCompany,
        text(raw.operator_company.as_deref()).or_else(|| tag("operator")),
    );
    put_text(&mut values, Field::OperatorSourceUrl, text(raw.source_url.as_deref()));

    put_count(&mut values, Field::SitesTotal, raw.sites_total.as_deref());
    put_count(&mut values, Field::SitesPowered, raw.sites_powered.as_deref());
    put_count(&mut values, Field::SitesPermanent, raw.sites_permanent.as_deref());

    Ok(CandidateRecord {
        source: raw.source,
        source_ref: text(raw.source_ref.as_deref()),
        display_name,
        normalized_name,
        point,
        state,
        values,
        notes: text(raw.notes.as_deref()),
        observed_at: raw.observed_at,
    })
}

/// Normalize a batch, splitting accepted candidates from rejections
pub fn normalize_all(raws: &[RawRecord]) -> (Vec<CandidateRecord>, Vec<RegistryError>) {
    let mut accepted = Vec::with_capacity(raws.len());
    let mut rejected = Vec::new();
    for raw in raws {
        match normalize(raw) {
            Ok(candidate) => accepted.push(candidate),
            Err(e) => rejected.push(e),
        }
    }
    (accepted, rejected)
}

fn text(value: Option<&str>) -> Option<String> {
    value
        .map(clean_display)
        .filter(|v| !v.is_empty())
}

fn put_text(values: &mut BTreeMap<Field, FieldValue>, field: Field, value: Option<String>) {
    if let Some(v) = value {
        values.insert(field, FieldValue::Text(v));
    }
}

/// "120", "120 sites", " 45 " → count; anything else is ignored
fn put_count(values: &mut BTreeMap<Field, FieldValue>, field: Field, raw: Option<&str>) {
    let Some(raw) = raw else { return };
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u32>() {
        Ok(n) => {
            values.insert(field, FieldValue::Count(n));
        }
        Err(_) => {
            if !raw.trim().is_empty() {
                debug!("ignoring unparseable {} value '{}'", field, raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::SourceTag;
    use chrono::Utc;

    fn osm(name: &str, lat: f64, lon: f64) -> RawRecord {
        RawRecord::new(SourceTag::MapFeature, Utc::now())
            .with_ref("osm:way:1")
            .with_name(name)
            .with_coords(lat, lon)
    }

    #[test]
    fn test_normalizes_name_and_keeps_display() {
        let c = normalize(&osm("  Sunny   CARAVAN Park ", -33.1, 151.2)).unwrap();
        assert_eq!(c.display_name.as_deref(), Some("Sunny CARAVAN Park"));
        assert_eq!(c.normalized_name, "sunny caravan park");
        assert_eq!(
            c.values.get(&Field::Name),
            Some(&FieldValue::Text("Sunny CARAVAN Park".into()))
        );
    }

    #[test]
    fn test_rounds_coordinates() {
        let c = normalize(&osm("Sunny", -33.123456789, 151.2)).unwrap();
        assert_eq!(c.point.unwrap().lat, -33.123457);
    }

    #[test]
    fn test_rejects_record_without_identity() {
        let raw = RawRecord::new(SourceTag::BrandDirectory, Utc::now()).with_name("  !! ");
        assert!(matches!(
            normalize(&raw),
            Err(RegistryError::MalformedSource { .. })
        ));
    }

    #[test]
    fn test_accepts_coordinates_without_name() {
        let raw = RawRecord::new(SourceTag::MapFeature, Utc::now()).with_coords(-28.6, 153.6);
        let c = normalize(&raw).unwrap();
        assert!(c.display_name.is_none());
        assert_eq!(c.normalized_name, "");
        assert!(c.point.is_some());
    }

    #[test]
    fn test_invalid_coordinates_dropped_when_name_present() {
        let c = normalize(&osm("Sunny Caravan Park", 95.0, 151.2)).unwrap();
        assert!(c.point.is_none());
        assert!(!c.values.contains_key(&Field::Coordinates));
    }

    #[test]
    fn test_address_tags_and_state_from_postcode() {
        let raw = osm("Sunny Caravan Park", -28.6, 153.6)
            .with_address_tag("addr:housenumber", "12")
            .with_address_tag("addr:street", "Beach Rd")
            .with_address_tag("addr:city", "Byron Bay")
            .with_address_tag("addr:postcode", "2481");
        let c = normalize(&raw).unwrap();

        assert_eq!(c.values.get(&Field::AddressLine), Some(&FieldValue::Text("12 Beach Rd".into())));
        assert_eq!(c.values.get(&Field::Suburb), Some(&FieldValue::Text("Byron Bay".into())));
        assert_eq!(c.state, Some(Jurisdiction::Nsw));
        assert_eq!(c.values.get(&Field::State), Some(&FieldValue::Text("NSW".into())));
    }

    #[test]
    fn test_site_counts_and_brand_tags() {
        let mut raw = osm("Sunny Caravan Park", -28.6, 153.6)
            .with_tag("brand", "BIG4")
            .with_tag("tourism", "caravan_site");
        raw.sites_total = Some("120 sites".into());
        raw.sites_powered = Some("n/a".into());

        let c = normalize(&raw).unwrap();

        assert_eq!(c.values.get(&Field::SitesTotal), Some(&FieldValue::Count(120)));
        assert!(!c.values.contains_key(&Field::SitesPowered));
        assert_eq!(c.values.get(&Field::OperatorBrand), Some(&FieldValue::Text("BIG4".into())));
        assert_eq!(c.values.get(&Field::Tourism), Some(&FieldValue::Text("caravan_site".into())));
    }

    #[test]
    fn test_normalize_all_splits_rejections() {
        let raws = vec![
            osm("Sunny Caravan Park", -33.1, 151.2),
            RawRecord::new(SourceTag::MapFeature, Utc::now()),
        ];
        let (ok, bad) = normalize_all(&raws);
        assert_eq!(ok.len(), 1);
        assert_eq!(bad.len(), 1);
    }
}
