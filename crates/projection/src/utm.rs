//! Universal Transverse Mercator on the WGS84 ellipsoid.
//!
//! Uses the Krüger series truncated at third order in the third flattening,
//! which is accurate to well below a millimeter within a zone.

use std::f64::consts::PI;

use sentinel_common::{Hemisphere, UtmZone};

/// WGS84 semi-major axis (meters)
const WGS84_A: f64 = 6378137.0;
/// WGS84 flattening
const WGS84_F: f64 = 1.0 / 298.257223563;
/// Scale factor on the central meridian
const K0: f64 = 0.9996;
/// False easting (meters)
const FALSE_EASTING: f64 = 500000.0;
/// False northing in the southern hemisphere (meters)
const FALSE_NORTHING_SOUTH: f64 = 10000000.0;

/// Transverse Mercator parameters for one UTM zone.
#[derive(Debug, Clone)]
pub struct Utm {
    pub zone: UtmZone,
    /// Central meridian in radians
    lon0: f64,
    false_northing: f64,
    /// Rectifying radius times k0
    k0a: f64,
    n: f64,
    alpha: [f64; 3],
    beta: [f64; 3],
    delta: [f64; 3],
}

impl Utm {
    pub fn new(zone: UtmZone) -> Self {
        let n = WGS84_F / (2.0 - WGS84_F);
        let n2 = n * n;
        let n3 = n2 * n;

        let a = WGS84_A / (1.0 + n) * (1.0 + n2 / 4.0 + n2 * n2 / 64.0);

        let alpha = [
            n / 2.0 - 2.0 / 3.0 * n2 + 5.0 / 16.0 * n3,
            13.0 / 48.0 * n2 - 3.0 / 5.0 * n3,
            61.0 / 240.0 * n3,
        ];
        let beta = [
            n / 2.0 - 2.0 / 3.0 * n2 + 37.0 / 96.0 * n3,
            1.0 / 48.0 * n2 + 1.0 / 15.0 * n3,
            17.0 / 480.0 * n3,
        ];
        let delta = [
            2.0 * n - 2.0 / 3.0 * n2 - 2.0 * n3,
            7.0 / 3.0 * n2 - 8.0 / 5.0 * n3,
            56.0 / 15.0 * n3,
        ];

        let false_northing = match zone.hemisphere {
            Hemisphere::North => 0.0,
            Hemisphere::South => FALSE_NORTHING_SOUTH,
        };

        Self {
            zone,
            lon0: zone.central_meridian() * PI / 180.0,
            false_northing,
            k0a: K0 * a,
            n,
            alpha,
            beta,
            delta,
        }
    }

    /// Project geographic coordinates (degrees) to (easting, northing) in meters.
    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let phi = lat.to_radians();
        let dlon = lon.to_radians() - self.lon0;

        let c = 2.0 * self.n.sqrt() / (1.0 + self.n);
        let t = (phi.sin().atanh() - c * (c * phi.sin()).atanh()).sinh();

        let xi_p = t.atan2(dlon.cos());
        let eta_p = (dlon.sin() / (1.0 + t * t).sqrt()).atanh();

        let mut xi = xi_p;
        let mut eta = eta_p;
        for (j, alpha) in self.alpha.iter().enumerate() {
            let k = 2.0 * (j + 1) as f64;
            xi += alpha * (k * xi_p).sin() * (k * eta_p).cosh();
            eta += alpha * (k * xi_p).cos() * (k * eta_p).sinh();
        }

        (
            FALSE_EASTING + self.k0a * eta,
            self.false_northing + self.k0a * xi,
        )
    }

    /// Unproject (easting, northing) in meters to geographic (lon, lat) in degrees.
    pub fn inverse(&self, easting: f64, northing: f64) -> (f64, f64) {
        let xi = (northing - self.false_northing) / self.k0a;
        let eta = (easting - FALSE_EASTING) / self.k0a;

        let mut xi_p = xi;
        let mut eta_p = eta;
        for (j, beta) in self.beta.iter().enumerate() {
            let k = 2.0 * (j + 1) as f64;
            xi_p -= beta * (k * xi).sin() * (k * eta).cosh();
            eta_p -= beta * (k * xi).cos() * (k * eta).sinh();
        }

        let chi = (xi_p.sin() / eta_p.cosh()).asin();
        let mut phi = chi;
        for (j, delta) in self.delta.iter().enumerate() {
            let k = 2.0 * (j + 1) as f64;
            phi += delta * (k * chi).sin();
        }

        let lon = self.lon0 + eta_p.sinh().atan2(xi_p.cos());
        (lon.to_degrees(), phi.to_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::assert_approx_eq;

    fn zone(zone: u8, hemisphere: Hemisphere) -> Utm {
        Utm::new(UtmZone::new(zone, hemisphere).unwrap())
    }

    #[test]
    fn test_central_meridian_on_equator() {
        let utm = zone(31, Hemisphere::North);
        let (e, n) = utm.forward(3.0, 0.0);
        assert_approx_eq!(e, 500000.0, 1e-6);
        assert_approx_eq!(n, 0.0, 1e-6);
    }

    #[test]
    fn test_meridian_arc_length() {
        // Northing on the central meridian is k0 times the meridian arc.
        // The WGS84 arc from the equator to 45 degrees is 4984944.378 m.
        let utm = zone(32, Hemisphere::North);
        let (e, n) = utm.forward(9.0, 45.0);
        assert_approx_eq!(e, 500000.0, 1e-6);
        assert_approx_eq!(n, 0.9996 * 4984944.378, 1.0);
    }

    #[test]
    fn test_round_trip_north() {
        let utm = zone(32, Hemisphere::North);
        for &(lon, lat) in &[(7.5, 45.2), (10.9, 47.8), (9.0, 60.0), (6.1, 1.0)] {
            let (e, n) = utm.forward(lon, lat);
            let (lon2, lat2) = utm.inverse(e, n);
            assert_approx_eq!(lon2, lon, 1e-7);
            assert_approx_eq!(lat2, lat, 1e-7);
        }
    }

    #[test]
    fn test_round_trip_south() {
        let utm = zone(19, Hemisphere::South);
        let (e, n) = utm.forward(-70.5, -33.4);
        assert!(n > 6_000_000.0 && n < 10_000_000.0);
        let (lon, lat) = utm.inverse(e, n);
        assert_approx_eq!(lon, -70.5, 1e-7);
        assert_approx_eq!(lat, -33.4, 1e-7);
    }

    #[test]
    fn test_easting_grows_eastward() {
        let utm = zone(33, Hemisphere::North);
        let (west, _) = utm.forward(13.0, 50.0);
        let (east, _) = utm.forward(17.0, 50.0);
        assert!(west < 500000.0 && east > 500000.0);
    }
}
