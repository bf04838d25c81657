//! Spherical Web-Mercator (EPSG:3857).

use std::f64::consts::PI;

/// Radius of the Web-Mercator sphere (meters)
pub const EARTH_RADIUS: f64 = 6378137.0;

/// Latitude beyond which Web-Mercator is undefined in practice.
pub const MAX_LATITUDE: f64 = 85.051128779806604;

/// Project geographic (lon, lat) degrees to Web-Mercator meters.
pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Unproject Web-Mercator meters to geographic (lon, lat) degrees.
pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}
