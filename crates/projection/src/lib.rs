//! Coordinate reference system transformations.
//!
//! Implements the projections the pipeline needs from scratch: UTM for the
//! native scene grids and spherical Web-Mercator for the output tile grid.

pub mod lut;
pub mod mercator;
pub mod utm;

pub use lut::TileCoordLut;
pub use mercator::{lonlat_to_mercator, mercator_to_lonlat};
pub use utm::Utm;

use sentinel_common::crs::WGS84_SRID;
use sentinel_common::tile::WEB_MERCATOR_SRID;
use sentinel_common::{Geometry, SentinelError, SentinelResult, UtmZone};

/// Reproject a geometry between WGS84, Web-Mercator and the UTM zones.
pub fn transform_geometry(geometry: &Geometry, from_srid: u32, to_srid: u32) -> SentinelResult<Geometry> {
    if from_srid == to_srid {
        return Ok(geometry.clone());
    }
    let to_lonlat = to_lonlat_fn(from_srid)?;
    let from_lonlat = from_lonlat_fn(to_srid)?;
    Ok(geometry.map_coords(|x, y| {
        let (lon, lat) = to_lonlat(x, y);
        from_lonlat(lon, lat)
    }))
}

type CoordFn = Box<dyn Fn(f64, f64) -> (f64, f64)>;

fn to_lonlat_fn(srid: u32) -> SentinelResult<CoordFn> {
    match srid {
        WGS84_SRID => Ok(Box::new(|x, y| (x, y))),
        WEB_MERCATOR_SRID => Ok(Box::new(mercator_to_lonlat)),
        _ => {
            let utm = Utm::new(UtmZone::from_srid(srid)?);
            Ok(Box::new(move |x, y| utm.inverse(x, y)))
        }
    }
}

fn from_lonlat_fn(srid: u32) -> SentinelResult<CoordFn> {
    match srid {
        WGS84_SRID => Ok(Box::new(|x, y| (x, y))),
        WEB_MERCATOR_SRID => Ok(Box::new(lonlat_to_mercator)),
        _ => match UtmZone::from_srid(srid) {
            Ok(zone) => {
                let utm = Utm::new(zone);
                Ok(Box::new(move |lon, lat| utm.forward(lon, lat)))
            }
            Err(_) => Err(SentinelError::malformed(format!("unsupported SRID {}", srid))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::{BoundingBox, Polygon};

    #[test]
    fn test_transform_utm_to_mercator() {
        let square = Geometry::Polygon(Polygon::from_bbox(&BoundingBox::new(
            399960.0, 4990200.0, 509760.0, 5100000.0,
        )));
        let merc = transform_geometry(&square, 32632, WEB_MERCATOR_SRID).unwrap();
        let bbox = merc.bbox().unwrap();
        // Grid square 32TMR lies around 7.7..9.1 E, 45..46 N.
        let (lon, lat) = mercator_to_lonlat(bbox.center().0, bbox.center().1);
        assert!(lon > 7.0 && lon < 9.5, "lon {}", lon);
        assert!(lat > 44.5 && lat < 46.5, "lat {}", lat);
    }

    #[test]
    fn test_identity_transform() {
        let square = Geometry::Polygon(Polygon::from_bbox(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(transform_geometry(&square, 4326, 4326).unwrap(), square);
        assert!(transform_geometry(&square, 4326, 2154).is_err());
    }
}
