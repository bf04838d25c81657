//! Per-scene `tileInfo.json` descriptors of the public Sentinel-2 buckets.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use projection::transform_geometry;
use sentinel_common::crs::WGS84_SRID;
use sentinel_common::geometry::geojson_crs_name;
use sentinel_common::{Geometry, UtmZone};
use storage::NewScene;

use crate::error::{IngestionError, Result};
use crate::sun::sun_position;

/// File name of the per-scene descriptor.
pub const TILE_INFO_FILE: &str = "tileInfo.json";

/// File whose presence in the corrected bucket marks an available L2A product.
pub const PRODUCT_INFO_FILE: &str = "productInfo.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Datastrip {
    pub id: String,
}

/// The fields of `tileInfo.json` the registry uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileInfo {
    #[serde(default)]
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub utm_zone: u8,
    pub latitude_band: String,
    pub grid_square: String,
    pub datastrip: Datastrip,
    pub product_name: String,
    pub tile_geometry: Value,
    #[serde(default)]
    pub tile_data_geometry: Option<Value>,
    pub cloudy_pixel_percentage: f64,
    /// Missing in older descriptors, taken as zero
    #[serde(default)]
    pub data_coverage_percentage: f64,
}

impl TileInfo {
    pub fn parse(prefix: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| IngestionError::descriptor(prefix, e))
    }

    pub fn utm(&self) -> Result<UtmZone> {
        Ok(UtmZone::from_latitude_band(self.utm_zone, &self.latitude_band)?)
    }

    /// Build the scene record. Geometries are reprojected from the CRS named
    /// in the GeoJSON (the scene's UTM zone when absent) to EPSG:4326, and the
    /// sun angles are evaluated at the footprint centroid.
    pub fn into_new_scene(self, prefix: &str) -> Result<NewScene> {
        let zone = self.utm()?;

        let footprint = to_wgs84(&self.tile_geometry, zone)
            .map_err(|e| IngestionError::descriptor(prefix, format!("tileGeometry: {}", e)))?;

        let data_geometry = match &self.tile_data_geometry {
            Some(value) => match to_wgs84(value, zone) {
                Ok(geometry) => Some(geometry.into_multi()),
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "Ignoring invalid tileDataGeometry");
                    None
                }
            },
            None => None,
        };

        let (lon, lat) = footprint
            .centroid()
            .ok_or_else(|| IngestionError::descriptor(prefix, "empty tileGeometry"))?;
        let sun = sun_position(&self.timestamp, lat, lon);

        Ok(NewScene {
            prefix: prefix.to_string(),
            utm_zone: self.utm_zone,
            latitude_band: self.latitude_band,
            grid_square: self.grid_square,
            collected_at: self.timestamp,
            cloudiness_percentage: self.cloudy_pixel_percentage,
            data_coverage_percentage: self.data_coverage_percentage,
            footprint,
            data_geometry,
            sun_azimuth: sun.azimuth,
            sun_altitude: sun.altitude,
            datastrip_id: self.datastrip.id,
            product_name: self.product_name,
        })
    }
}

fn to_wgs84(value: &Value, zone: UtmZone) -> sentinel_common::SentinelResult<Geometry> {
    let srid = match geojson_crs_name(value) {
        Some(name) => UtmZone::from_crs_name(name)?.srid(),
        None => zone.srid(),
    };
    let geometry = Geometry::from_geojson(value)?;
    transform_geometry(&geometry, srid, WGS84_SRID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn sample_tile_info() -> String {
        r#"{
            "path": "tiles/32/T/MR/2019/7/14/0",
            "timestamp": "2019-07-14T10:30:25.461Z",
            "utmZone": 32,
            "latitudeBand": "T",
            "gridSquare": "MR",
            "datastrip": {"id": "S2B_OPER_MSI_L1C_DS_SGS__20190714T131219_S20190714T103028_N02.08"},
            "tileGeometry": {
                "type": "Polygon",
                "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG:8.8.1:32632"}},
                "coordinates": [[[399960.0, 5000040.0], [509760.0, 5000040.0], [509760.0, 4890240.0],
                                 [399960.0, 4890240.0], [399960.0, 5000040.0]]]
            },
            "tileDataGeometry": {
                "type": "Polygon",
                "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG:8.8.1:32632"}},
                "coordinates": [[[450000.0, 5000040.0], [509760.0, 5000040.0], [509760.0, 4890240.0],
                                 [450000.0, 4890240.0], [450000.0, 5000040.0]]]
            },
            "cloudyPixelPercentage": 12.5,
            "productName": "S2B_MSIL1C_20190714T103029_N0208_R108_T32TMR_20190714T131219"
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_descriptor() {
        let info = TileInfo::parse("p/", sample_tile_info().as_bytes()).unwrap();
        assert_eq!(info.utm_zone, 32);
        assert_eq!(info.timestamp.year(), 2019);
        assert_eq!(info.timestamp.hour(), 10);
        assert_eq!(info.data_coverage_percentage, 0.0);
        assert!(info.datastrip.id.starts_with("S2B_OPER"));
    }

    #[test]
    fn test_into_new_scene() {
        let info = TileInfo::parse("p/", sample_tile_info().as_bytes()).unwrap();
        let scene = info.into_new_scene("tiles/32/T/MR/2019/7/14/0/").unwrap();

        assert_eq!(scene.mgrs(), "32TMR");
        assert_eq!(scene.cloudiness_percentage, 12.5);

        let bbox = scene.footprint.bbox().unwrap();
        assert!(bbox.min_x > 7.5 && bbox.max_x < 9.5, "{:?}", bbox);
        assert!(bbox.min_y > 44.0 && bbox.max_y < 45.5, "{:?}", bbox);

        let data = scene.data_geometry.unwrap();
        assert!(matches!(data, Geometry::MultiPolygon(_)));
        assert!(data.bbox().unwrap().min_x > bbox.min_x);

        assert!(scene.sun_altitude > 50.0 && scene.sun_altitude < 70.0);
        assert!(scene.sun_azimuth > 120.0 && scene.sun_azimuth < 180.0);
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let err = TileInfo::parse("tiles/1/C/CV/2019/1/1/0/", br#"{"utmZone": 1}"#).unwrap_err();
        assert!(matches!(err, IngestionError::Descriptor { .. }));
    }

    #[test]
    fn test_southern_scene_uses_southern_zone() {
        let json = sample_tile_info()
            .replace("\"latitudeBand\": \"T\"", "\"latitudeBand\": \"H\"")
            .replace("EPSG:8.8.1:32632", "EPSG:8.8.1:32732")
            .replace("5000040.0", "6300000.0")
            .replace("4890240.0", "6190200.0");
        let info = TileInfo::parse("p/", json.as_bytes()).unwrap();
        assert_eq!(info.utm().unwrap().srid(), 32732);
        let scene = info.into_new_scene("p/").unwrap();
        let bbox = scene.footprint.bbox().unwrap();
        assert!(bbox.max_y < 0.0, "{:?}", bbox);
    }
}
