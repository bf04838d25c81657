//! Common test fixtures for scenes, composites and scene descriptors.
//!
//! This module provides pre-defined test data that represents common
//! scenarios in scene registration and compositing.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::json;

use sentinel_common::tile::latlon_to_tile;
use sentinel_common::{BoundingBox, Geometry, Polygon, TileCoord, ZOOM_COARSE};
use storage::{NewComposite, NewScene};

/// Geographic points used across tests.
pub mod places {
    /// Milan, inside grid square 32TNR
    pub const MILAN: (f64, f64) = (9.19, 45.46);

    /// Cape Town, southern hemisphere zone 34
    pub const CAPE_TOWN: (f64, f64) = (18.42, -33.92);
}

/// The coarse composite tile containing Milan.
pub fn milan_coarse_tile() -> TileCoord {
    let (lon, lat) = places::MILAN;
    latlon_to_tile(lat, lon, ZOOM_COARSE)
}

/// Geographic bbox polygon.
pub fn bbox_geometry(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Geometry {
    Geometry::Polygon(Polygon::from_bbox(&BoundingBox::new(
        min_lon, min_lat, max_lon, max_lat,
    )))
}

/// Footprint that fully covers a tile, with a small margin.
pub fn covering_geometry(coord: &TileCoord) -> Geometry {
    let b = coord.latlon_bounds();
    bbox_geometry(b.min_x - 0.01, b.min_y - 0.01, b.max_x + 0.01, b.max_y + 0.01)
}

pub fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid test timestamp {}-{}-{} {}h", y, m, d, h))
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_else(|| panic!("invalid test date {}-{}-{}", y, m, d))
}

/// A scene record over `footprint` captured at `collected_at`.
pub fn new_scene(prefix: &str, collected_at: DateTime<Utc>, footprint: Geometry) -> NewScene {
    NewScene {
        prefix: prefix.to_string(),
        utm_zone: 32,
        latitude_band: "T".to_string(),
        grid_square: "NR".to_string(),
        collected_at,
        cloudiness_percentage: 10.0,
        data_coverage_percentage: 100.0,
        footprint,
        data_geometry: None,
        sun_azimuth: 150.0,
        sun_altitude: 60.0,
        datastrip_id: "S2A_OPER_MSI_L1C_DS_TEST".to_string(),
        product_name: "S2A_MSIL1C_TEST".to_string(),
    }
}

/// A composite over the whole of July 2019 with a 100% cloud threshold.
pub fn july_composite(name: &str) -> NewComposite {
    NewComposite {
        name: name.to_string(),
        min_date: date(2019, 7, 1),
        max_date: date(2019, 7, 31),
        max_cloudiness: 100.0,
        scene_ids: None,
    }
}

/// A `tileInfo.json` body for a grid square given by its UTM bbox
/// (min_e, min_n, max_e, max_n).
pub fn tile_info_json(
    zone: u8,
    latitude_band: &str,
    grid_square: &str,
    timestamp: &str,
    utm_bbox: (f64, f64, f64, f64),
) -> String {
    let (min_e, min_n, max_e, max_n) = utm_bbox;
    let south = matches!(latitude_band.chars().next(), Some('C'..='M'));
    let srid = if south { 32700 } else { 32600 } + zone as u32;
    let crs = json!({"type": "name", "properties": {"name": format!("urn:ogc:def:crs:EPSG:8.8.1:{}", srid)}});
    let ring = json!([[
        [min_e, max_n],
        [max_e, max_n],
        [max_e, min_n],
        [min_e, min_n],
        [min_e, max_n]
    ]]);

    json!({
        "path": format!("tiles/{}/{}/{}/2019/7/14/0", zone, latitude_band, grid_square),
        "timestamp": timestamp,
        "utmZone": zone,
        "latitudeBand": latitude_band,
        "gridSquare": grid_square,
        "datastrip": {"id": format!("S2B_OPER_MSI_L1C_DS_{}{}{}", zone, latitude_band, grid_square)},
        "tileGeometry": {"type": "Polygon", "crs": crs, "coordinates": ring},
        "tileDataGeometry": {"type": "Polygon", "crs": crs, "coordinates": ring},
        "cloudyPixelPercentage": 4.2,
        "dataCoveragePercentage": 100.0,
        "productName": format!("S2B_MSIL1C_20190714T103029_N0208_R108_T{}{}{}", zone, latitude_band, grid_square),
    })
    .to_string()
}

/// UTM bbox of grid square 32TNR (around Milan).
pub const GRID_32TNR: (f64, f64, f64, f64) = (499980.0, 4990200.0, 609780.0, 5100000.0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milan_tile_is_coarse() {
        let tile = milan_coarse_tile();
        assert_eq!(tile.z, ZOOM_COARSE);
        let b = tile.latlon_bounds();
        assert!(b.contains_point(places::MILAN.0, places::MILAN.1));
    }

    #[test]
    fn test_tile_info_json_is_valid() {
        let body = tile_info_json(34, "H", "BH", "2019-07-14T09:00:00.000Z", (200000.0, 6190200.0, 309800.0, 6300000.0));
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["utmZone"], 34);
        assert_eq!(
            value["tileGeometry"]["crs"]["properties"]["name"],
            "urn:ogc:def:crs:EPSG:8.8.1:32734"
        );
    }

    #[test]
    fn test_covering_geometry_contains_tile() {
        let tile = milan_coarse_tile();
        let geometry = covering_geometry(&tile);
        let b = tile.latlon_bounds();
        let (cx, cy) = b.center();
        assert!(geometry.contains_point(cx, cy));
        assert!(geometry.contains_point(b.min_x, b.max_y));
    }
}
