//! Apparent position of the sun.
//!
//! Follows the NOAA solar calculator equations (after Meeus), including the
//! standard atmospheric refraction correction. Accurate to a few hundredths
//! of a degree between 1900 and 2100, which is plenty for per-scene angles.

use chrono::{DateTime, Timelike, Utc};

/// Sun angles in degrees as seen from a point on the ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    /// Elevation above the horizon
    pub altitude: f64,
    /// Clockwise from north
    pub azimuth: f64,
}

const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;
const J2000: f64 = 2451545.0;

fn julian_day(time: &DateTime<Utc>) -> f64 {
    let seconds = time.timestamp() as f64 + time.timestamp_subsec_nanos() as f64 * 1e-9;
    UNIX_EPOCH_JULIAN_DAY + seconds / 86400.0
}

/// Sun altitude and azimuth at `time` for an observer at (`lat`, `lon`).
pub fn sun_position(time: &DateTime<Utc>, lat: f64, lon: f64) -> SunPosition {
    let t = (julian_day(time) - J2000) / 36525.0;

    let mean_longitude = (280.46646 + t * (36000.76983 + t * 0.0003032)).rem_euclid(360.0);
    let mean_anomaly = 357.52911 + t * (35999.05029 - 0.0001537 * t);
    let eccentricity = 0.016708634 - t * (0.000042037 + 0.0000001267 * t);

    let m = mean_anomaly.to_radians();
    let center = m.sin() * (1.914602 - t * (0.004817 + 0.000014 * t))
        + (2.0 * m).sin() * (0.019993 - 0.000101 * t)
        + (3.0 * m).sin() * 0.000289;

    let true_longitude = mean_longitude + center;
    let omega = (125.04 - 1934.136 * t).to_radians();
    let apparent_longitude = (true_longitude - 0.00569 - 0.00478 * omega.sin()).to_radians();

    let mean_obliquity =
        23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.00059 - t * 0.001813))) / 60.0) / 60.0;
    let obliquity = (mean_obliquity + 0.00256 * omega.cos()).to_radians();

    let declination = (obliquity.sin() * apparent_longitude.sin()).asin();

    // Equation of time in minutes.
    let y = (obliquity / 2.0).tan().powi(2);
    let l0 = mean_longitude.to_radians();
    let equation_of_time = 4.0
        * (y * (2.0 * l0).sin() - 2.0 * eccentricity * m.sin()
            + 4.0 * eccentricity * y * m.sin() * (2.0 * l0).cos()
            - 0.5 * y * y * (4.0 * l0).sin()
            - 1.25 * eccentricity * eccentricity * (2.0 * m).sin())
        .to_degrees();

    let minutes = time.hour() as f64 * 60.0
        + time.minute() as f64
        + (time.second() as f64 + time.nanosecond() as f64 * 1e-9) / 60.0;
    let true_solar_time = (minutes + equation_of_time + 4.0 * lon).rem_euclid(1440.0);
    let mut hour_angle = true_solar_time / 4.0 - 180.0;
    if hour_angle < -180.0 {
        hour_angle += 360.0;
    }

    let phi = lat.to_radians();
    let ha = hour_angle.to_radians();
    let cos_zenith = (phi.sin() * declination.sin() + phi.cos() * declination.cos() * ha.cos())
        .clamp(-1.0, 1.0);
    let zenith = cos_zenith.acos();

    let geometric_altitude = 90.0 - zenith.to_degrees();
    let altitude = geometric_altitude + refraction(geometric_altitude);

    let denominator = phi.cos() * zenith.sin();
    let azimuth = if denominator.abs() < 1e-12 {
        // Observer at a pole or sun at zenith.
        if lat > 0.0 {
            180.0
        } else {
            0.0
        }
    } else {
        let cos_az = ((phi.sin() * cos_zenith - declination.sin()) / denominator).clamp(-1.0, 1.0);
        let az = cos_az.acos().to_degrees();
        if hour_angle > 0.0 {
            (az + 180.0).rem_euclid(360.0)
        } else {
            (540.0 - az).rem_euclid(360.0)
        }
    };

    SunPosition { altitude, azimuth }
}

/// Atmospheric refraction in degrees for a geometric elevation.
fn refraction(elevation: f64) -> f64 {
    if elevation > 85.0 {
        return 0.0;
    }
    let te = elevation.to_radians().tan();
    let arcseconds = if elevation > 5.0 {
        58.1 / te - 0.07 / te.powi(3) + 0.000086 / te.powi(5)
    } else if elevation > -0.575 {
        1735.0 + elevation * (-518.2 + elevation * (103.4 + elevation * (-12.79 + elevation * 0.711)))
    } else {
        -20.774 / te
    };
    arcseconds / 3600.0
}
