//! UTM zone handling and EPSG codes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{SentinelError, SentinelResult};

/// SRID of geographic WGS84 coordinates.
pub const WGS84_SRID: u32 = 4326;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hemisphere {
    North,
    South,
}

/// A UTM zone on the WGS84 datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtmZone {
    pub zone: u8,
    pub hemisphere: Hemisphere,
}

impl UtmZone {
    pub fn new(zone: u8, hemisphere: Hemisphere) -> SentinelResult<Self> {
        if !(1..=60).contains(&zone) {
            return Err(SentinelError::malformed(format!("invalid UTM zone {}", zone)));
        }
        Ok(Self { zone, hemisphere })
    }

    /// Derive the hemisphere from an MGRS latitude band letter.
    ///
    /// Bands `C`..=`M` lie in the southern hemisphere, `N`..=`X` in the northern.
    pub fn from_latitude_band(zone: u8, band: &str) -> SentinelResult<Self> {
        let letter = band
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .ok_or_else(|| SentinelError::malformed("empty latitude band"))?;
        let hemisphere = match letter {
            'C'..='M' => Hemisphere::South,
            'N'..='X' => Hemisphere::North,
            _ => {
                return Err(SentinelError::malformed(format!(
                    "invalid latitude band '{}'",
                    band
                )))
            }
        };
        Self::new(zone, hemisphere)
    }

    /// EPSG code: 32600 + zone in the north, 32700 + zone in the south.
    pub fn srid(&self) -> u32 {
        match self.hemisphere {
            Hemisphere::North => 32600 + self.zone as u32,
            Hemisphere::South => 32700 + self.zone as u32,
        }
    }

    pub fn from_srid(srid: u32) -> SentinelResult<Self> {
        match srid {
            32601..=32660 => Self::new((srid - 32600) as u8, Hemisphere::North),
            32701..=32760 => Self::new((srid - 32700) as u8, Hemisphere::South),
            _ => Err(SentinelError::malformed(format!(
                "EPSG:{} is not a WGS84 UTM zone",
                srid
            ))),
        }
    }

    /// Parse a CRS name as found in GeoJSON `crs.properties.name`, e.g.
    /// `EPSG:32632` or `urn:ogc:def:crs:EPSG:8.8.1:32632`.
    pub fn from_crs_name(name: &str) -> SentinelResult<Self> {
        let code = name
            .rsplit(':')
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| SentinelError::malformed(format!("unrecognised CRS name '{}'", name)))?;
        Self::from_srid(code)
    }

    /// Longitude of the zone's central meridian in degrees.
    pub fn central_meridian(&self) -> f64 {
        self.zone as f64 * 6.0 - 183.0
    }

    pub fn is_north(&self) -> bool {
        self.hemisphere == Hemisphere::North
    }
}

impl fmt::Display for UtmZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.srid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srid_by_hemisphere() {
        let north = UtmZone::from_latitude_band(32, "T").unwrap();
        assert_eq!(north.srid(), 32632);

        let south = UtmZone::from_latitude_band(19, "H").unwrap();
        assert_eq!(south.srid(), 32719);
        assert_eq!(south.hemisphere, Hemisphere::South);
    }

    #[test]
    fn test_parse_crs_names() {
        let zone = UtmZone::from_crs_name("urn:ogc:def:crs:EPSG:8.8.1:32633").unwrap();
        assert_eq!(zone.zone, 33);
        assert!(zone.is_north());

        let zone = UtmZone::from_crs_name("EPSG:32756").unwrap();
        assert_eq!(zone.zone, 56);
        assert!(!zone.is_north());

        assert!(UtmZone::from_crs_name("EPSG:4326").is_err());
    }

    #[test]
    fn test_invalid_zone() {
        assert!(UtmZone::new(0, Hemisphere::North).is_err());
        assert!(UtmZone::new(61, Hemisphere::North).is_err());
        assert!(UtmZone::from_latitude_band(10, "Z").is_err());
    }

    #[test]
    fn test_central_meridian() {
        assert_eq!(UtmZone::new(31, Hemisphere::North).unwrap().central_meridian(), 3.0);
        assert_eq!(UtmZone::new(1, Hemisphere::South).unwrap().central_meridian(), -177.0);
    }
}
