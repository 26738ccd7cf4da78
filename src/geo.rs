// 🌏 Geo helpers - distances, coordinate precision, blocking grid

use serde::{Deserialize, Serialize};
use std::fmt;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Decimal places kept on stored coordinates (~0.1 m)
pub const COORD_DECIMALS: u32 = 6;

/// Decimal places of the blocking key. 0.001° of latitude is ~111 m, so a
/// grid cell is roughly a 100 m square at Australian latitudes.
pub const KEY_DECIMALS: u32 = 3;

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

// ============================================================================
// GEO POINT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Validated constructor; rejects NaN and out-of-range values
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(GeoPoint { lat, lon })
    }

    /// Same point at stored precision
    pub fn normalized(&self) -> Self {
        GeoPoint {
            lat: round_to(self.lat, COORD_DECIMALS),
            lon: round_to(self.lon, COORD_DECIMALS),
        }
    }

    /// Great-circle distance in meters
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    pub fn cell(&self) -> GridCell {
        let factor = 10f64.powi(KEY_DECIMALS as i32);
        GridCell {
            lat: (self.lat * factor).round() as i64,
            lon: (self.lon * factor).round() as i64,
        }
    }

    /// Coordinates in micro-degrees, used as a cache key
    pub fn micro_degrees(&self) -> (i64, i64) {
        (
            (self.lat * 1e6).round() as i64,
            (self.lon * 1e6).round() as i64,
        )
    }
}

// ============================================================================
// GRID CELL (blocking key)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridCell {
    pub lat: i64,
    pub lon: i64,
}

impl GridCell {
    /// This cell plus its 8 neighbours
    pub fn neighbourhood(&self) -> [GridCell; 9] {
        let mut cells = [*self; 9];
        let mut i = 0;
        for dlat in -1..=1 {
            for dlon in -1..=1 {
                cells[i] = GridCell {
                    lat: self.lat + dlat,
                    lon: self.lon + dlon,
                };
                i += 1;
            }
        }
        cells
    }
}

impl fmt::Display for GridCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lat, self.lon)
    }
}

// ============================================================================
// JURISDICTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Jurisdiction {
    #[serde(rename = "NSW")]
    Nsw,
    #[serde(rename = "QLD")]
    Qld,
    #[serde(rename = "VIC")]
    Vic,
}

impl Jurisdiction {
    pub fn code(&self) -> &'static str {
        match self {
            Jurisdiction::Nsw => "NSW",
            Jurisdiction::Qld => "QLD",
            Jurisdiction::Vic => "VIC",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Jurisdiction::Nsw => "New South Wales",
            Jurisdiction::Qld => "Queensland",
            Jurisdiction::Vic => "Victoria",
        }
    }

    pub fn from_code(code: &str) -> Option<Jurisdiction> {
        match code.trim().to_uppercase().as_str() {
            "NSW" | "NEW SOUTH WALES" => Some(Jurisdiction::Nsw),
            "QLD" | "QUEENSLAND" => Some(Jurisdiction::Qld),
            "VIC" | "VICTORIA" => Some(Jurisdiction::Vic),
            _ => None,
        }
    }

    /// Infer from an Australian postcode. ACT ranges inside the 2xxx block
    /// are not NSW.
    pub fn from_postcode(postcode: &str) -> Option<Jurisdiction> {
        let code: u32 = postcode.trim().parse().ok()?;
        match code {
            2600..=2618 | 2900..=2920 => None,
            2000..=2999 => Some(Jurisdiction::Nsw),
            3000..=3999 | 8000..=8999 => Some(Jurisdiction::Vic),
            4000..=4999 | 9000..=9999 => Some(Jurisdiction::Qld),
            _ => None,
        }
    }
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_small_offset() {
        let a = GeoPoint::new(-33.100, 151.200).unwrap();
        let b = GeoPoint::new(-33.1002, 151.2001).unwrap();
        let d = a.distance_m(&b);
        assert!(d > 20.0 && d < 30.0, "expected ~24 m, got {}", d);
    }

    #[test]
    fn test_distance_beyond_two_km() {
        let a = GeoPoint::new(-33.100, 151.200).unwrap();
        let b = GeoPoint::new(-33.130, 151.200).unwrap();
        assert!(a.distance_m(&b) > 3_000.0);
    }

    #[test]
    fn test_invalid_points_rejected() {
        assert!(GeoPoint::new(f64::NAN, 151.0).is_none());
        assert!(GeoPoint::new(-91.0, 151.0).is_none());
        assert!(GeoPoint::new(-33.0, 181.0).is_none());
    }

    #[test]
    fn test_cells_share_key_when_close() {
        let a = GeoPoint::new(-33.100, 151.200).unwrap();
        let b = GeoPoint::new(-33.1002, 151.2001).unwrap();
        assert_eq!(a.cell(), b.cell());
        assert_eq!(a.cell().neighbourhood().len(), 9);
        assert!(a.cell().neighbourhood().contains(&GridCell { lat: -33101, lon: 151201 }));
    }

    #[test]
    fn test_normalized_precision() {
        let p = GeoPoint::new(-33.123456789, 151.987654321).unwrap().normalized();
        assert_eq!(p.lat, -33.123457);
        assert_eq!(p.lon, 151.987654);
    }

    #[test]
    fn test_jurisdiction_from_postcode() {
        assert_eq!(Jurisdiction::from_postcode("2480"), Some(Jurisdiction::Nsw));
        assert_eq!(Jurisdiction::from_postcode("2601"), None);
        assert_eq!(Jurisdiction::from_postcode("3550"), Some(Jurisdiction::Vic));
        assert_eq!(Jurisdiction::from_postcode("4217"), Some(Jurisdiction::Qld));
        assert_eq!(Jurisdiction::from_postcode("abc"), None);
        assert_eq!(Jurisdiction::from_code("queensland"), Some(Jurisdiction::Qld));
    }
}
