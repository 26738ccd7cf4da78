// 📐 Parcel Area Aggregator - many parcels → one land area per park
//
// Parcels come from an intersection query around the park point. A parcel
// that dwarfs the others (or exceeds the absolute cap) is flagged, not
// summed; a parcel another park already claims is flagged as shared.

use crate::config::AggregatorConfig;
use crate::sources::ParcelReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// land_area_source when nothing could be summed
pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaConfidence {
    High,
    Medium,
    Low,
}

impl AreaConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            AreaConfidence::High => "high",
            AreaConfidence::Medium => "medium",
            AreaConfidence::Low => "low",
        }
    }
}

impl fmt::Display for AreaConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a parcel was left out of the sum
#[derive(Debug, Clone, PartialEq)]
pub enum ParcelFlag {
    Outlier { parcel_id: String, area_sqm: f64, median_sqm: f64 },
    OverCap { parcel_id: String, area_sqm: f64 },
    Shared { parcel_id: String, owner: String },
    NoArea { parcel_id: String },
}

impl fmt::Display for ParcelFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParcelFlag::Outlier { parcel_id, area_sqm, median_sqm } => {
                write!(f, "outlier:{} ({:.0} sqm vs median {:.0})", parcel_id, area_sqm, median_sqm)
            }
            ParcelFlag::OverCap { parcel_id, area_sqm } => write!(f, "over_cap:{} ({:.0} sqm)", parcel_id, area_sqm),
            ParcelFlag::Shared { parcel_id, owner } => write!(f, "shared:{} (claimed by {})", parcel_id, owner),
            ParcelFlag::NoArea { parcel_id } => write!(f, "no_area:{}", parcel_id),
        }
    }
}

/// AreaEstimate - what the aggregator concluded for one park
#[derive(Debug, Clone, PartialEq)]
pub struct AreaEstimate {
    /// Parcels that were summed, in input order
    pub parcel_ids: Vec<String>,
    pub area_sqm: Option<f64>,
    pub source: String,
    pub confidence: Option<AreaConfidence>,
    pub flags: Vec<ParcelFlag>,
}

impl AreaEstimate {
    pub fn is_known(&self) -> bool {
        self.area_sqm.is_some()
    }

    pub fn flags_text(&self) -> String {
        self.flags
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct ParcelAggregator {
    config: AggregatorConfig,
}

impl ParcelAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        ParcelAggregator { config }
    }

    /// Aggregate parcels for one park.
    ///
    /// `owner_of` answers "which other park already claims this parcel".
    pub fn aggregate<F>(&self, parcels: &[ParcelReference], source_label: &str, owner_of: F) -> AreaEstimate
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut flags = Vec::new();

        // 1. Dedupe by id (services return a parcel once per intersecting part)
        let mut seen = BTreeSet::new();
        let mut usable: Vec<&ParcelReference> = Vec::new();
        for parcel in parcels {
            if !seen.insert(parcel.parcel_id.as_str()) {
                continue;
            }
            if !(parcel.area_sqm.is_finite() && parcel.area_sqm > 0.0) {
                flags.push(ParcelFlag::NoArea {
                    parcel_id: parcel.parcel_id.clone(),
                });
                continue;
            }
            if let Some(owner) = owner_of(&parcel.parcel_id) {
                flags.push(ParcelFlag::Shared {
                    parcel_id: parcel.parcel_id.clone(),
                    owner,
                });
                continue;
            }
            usable.push(parcel);
        }

        // 2. Outliers against the median of the *other* parcels
        let mut kept: Vec<&ParcelReference> = Vec::new();
        for (i, parcel) in usable.iter().enumerate() {
            if let Some(cap) = self.config.max_parcel_area_sqm {
                if parcel.area_sqm > cap {
                    flags.push(ParcelFlag::OverCap {
                        parcel_id: parcel.parcel_id.clone(),
                        area_sqm: parcel.area_sqm,
                    });
                    continue;
                }
            }
            let others: Vec<f64> = usable
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, p)| p.area_sqm)
                .collect();
            if let Some(median) = median(&others) {
                if parcel.area_sqm >= self.config.outlier_ratio * median {
                    flags.push(ParcelFlag::Outlier {
                        parcel_id: parcel.parcel_id.clone(),
                        area_sqm: parcel.area_sqm,
                        median_sqm: median,
                    });
                    continue;
                }
            }
            kept.push(parcel);
        }

        if kept.is_empty() {
            return AreaEstimate {
                parcel_ids: Vec::new(),
                area_sqm: None,
                source: UNKNOWN_SOURCE.to_string(),
                confidence: None,
                flags,
            };
        }

        let total: f64 = kept.iter().map(|p| p.area_sqm).sum();
        let total = (total * 100.0).round() / 100.0;
        let confidence = if flags.is_empty() && kept.len() <= 3 {
            AreaConfidence::High
        } else if kept.len() <= 6 {
            AreaConfidence::Medium
        } else {
            AreaConfidence::Low
        };

        AreaEstimate {
            parcel_ids: kept.iter().map(|p| p.parcel_id.clone()).collect(),
            area_sqm: Some(total),
            source: source_label.to_string(),
            confidence: Some(confidence),
            flags,
        }
    }
}

impl Default for ParcelAggregator {
    fn default() -> Self {
        ParcelAggregator::new(AggregatorConfig::default())
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
