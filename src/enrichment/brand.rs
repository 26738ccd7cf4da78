// 🏷️ Brand inference step - operator brand from website, tags, then name
//
// Offline: no collaborator, just the known brand hosts and name patterns.
// Written as BrandInference, which ranks below a brand directory listing,
// so a park listed by an operator keeps the directory's answer.

use crate::batch::{Enrichment, EnrichmentStep};
use crate::entity::{EnrichmentKind, Field, ParkEntity};
use crate::error::Result;
use crate::provenance::{Provenance, SourceTag};
use crate::reconciler::FieldUpdate;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use log::warn;
use regex::{Regex, RegexBuilder};

/// Website host → (brand, company)
const BRAND_HOSTS: [(&str, &str, &str); 8] = [
    ("big4.com.au", "BIG4", "BIG4 Holiday Parks"),
    ("nrmaparksandresorts.com.au", "NRMA", "NRMA Parks and Resorts"),
    ("discoveryholidayparks.com.au", "Discovery", "Discovery Parks"),
    ("gdayparks.com.au", "G'Day", "G'Day Parks"),
    ("ingeniaholidays.com.au", "Ingenia Holidays", "Ingenia Communities"),
    ("reflectionsnsw.com.au", "Reflections", "Reflections Holiday Parks"),
    ("tasmanholidayparks.com", "Tasman", "Tasman Holiday Parks"),
    ("holidayhaven.com.au", "Holiday Haven", "Shoalhaven City Council"),
];

/// Name/tag pattern → (brand, company), first match wins
const BRAND_PATTERNS: [(&str, &str, &str); 8] = [
    (r"\b(big\s*4|big4)\b", "BIG4", "BIG4 Holiday Parks"),
    (r"\bnrma\b", "NRMA", "NRMA Parks and Resorts"),
    (r"\bdiscovery\b", "Discovery", "Discovery Parks"),
    (r"g['’`-]?day", "G'Day", "G'Day Parks"),
    (r"\bingenia\b", "Ingenia Holidays", "Ingenia Communities"),
    (r"\breflections?\b", "Reflections", "Reflections Holiday Parks"),
    (r"\btasman\b", "Tasman", "Tasman Holiday Parks"),
    (r"holiday\s*haven", "Holiday Haven", "Shoalhaven City Council"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedOn {
    Website,
    Tag,
    Name,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrandMatch {
    pub brand: &'static str,
    pub company: &'static str,
    pub matched_on: MatchedOn,
}

/// Lower-cased host of a URL, without a leading "www."
pub fn host_of(url: &str) -> Option<String> {
    let url = url.trim().to_lowercase();
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url.as_str());
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .rsplit('@')
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("");
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}

pub struct BrandInferenceStep {
    patterns: Vec<(Regex, &'static str, &'static str)>,
}

impl BrandInferenceStep {
    pub fn new() -> Self {
        let mut patterns = Vec::new();
        for (pattern, brand, company) in BRAND_PATTERNS {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => patterns.push((re, brand, company)),
                Err(e) => warn!("brand pattern {} skipped: {}", pattern, e),
            }
        }
        BrandInferenceStep { patterns }
    }

    fn from_host(&self, website: &str) -> Option<(&'static str, &'static str)> {
        let host = host_of(website)?;
        BRAND_HOSTS
            .iter()
            .find(|(known, _, _)| host == *known || host.ends_with(&format!(".{}", known)) || host.contains(known))
            .map(|(_, brand, company)| (*brand, *company))
    }

    fn from_text(&self, text: &str) -> Option<(&'static str, &'static str)> {
        self.patterns
            .iter()
            .find(|(re, _, _)| re.is_match(text))
            .map(|(_, brand, company)| (*brand, *company))
    }

    /// Website host first, then existing brand/operator text, then the name
    pub fn infer(&self, park: &ParkEntity) -> Option<BrandMatch> {
        let found = |(brand, company): (&'static str, &'static str), matched_on: MatchedOn| BrandMatch {
            brand,
            company,
            matched_on,
        };

        if let Some(m) = park.text(Field::Website).and_then(|w| self.from_host(w)) {
            return Some(found(m, MatchedOn::Website));
        }
        for field in [Field::OperatorBrand, Field::OperatorCompany] {
            if let Some(m) = park.text(field).and_then(|t| self.from_text(t)) {
                return Some(found(m, MatchedOn::Tag));
            }
        }
        park.text(Field::Name)
            .and_then(|n| self.from_text(n))
            .map(|m| found(m, MatchedOn::Name))
    }
}

impl Default for BrandInferenceStep {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrichmentStep for BrandInferenceStep {
    fn kind(&self) -> EnrichmentKind {
        EnrichmentKind::Brand
    }

    fn applies_to(&self, park: &ParkEntity) -> bool {
        let listed = park
            .provenance(Field::OperatorBrand)
            .map(|p| p.source == SourceTag::BrandDirectory)
            .unwrap_or(false);
        !listed && (park.text(Field::Name).is_some() || park.text(Field::Website).is_some())
    }

    fn enrich(&self, park: &ParkEntity, _registry: &Registry, at: DateTime<Utc>) -> Result<Enrichment> {
        let Some(m) = self.infer(park) else {
            return Ok(Enrichment::new());
        };

        let prov = Provenance::new(SourceTag::BrandInference, at);
        let mut enrichment = Enrichment::new()
            .with_update(FieldUpdate::text(Field::OperatorBrand, m.brand, prov))
            .with_update(FieldUpdate::text(Field::OperatorCompany, m.company, prov));
        if let Some(website) = park.text(Field::Website) {
            enrichment = enrichment.with_update(FieldUpdate::text(Field::OperatorSourceUrl, website, prov));
        }
        Ok(enrichment)
    }
}
