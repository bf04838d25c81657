//! Minimal polygon geometry with GeoJSON interchange.
//!
//! Covers what scene footprints and regions of interest need: bounds,
//! centroid, point containment, pairwise intersection and coordinate mapping.

use serde_json::{json, Value};

use crate::{BoundingBox, SentinelError, SentinelResult};

/// A polygon made of an exterior ring followed by optional holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub rings: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    pub fn new(exterior: Vec<(f64, f64)>) -> Self {
        Self {
            rings: vec![exterior],
        }
    }

    pub fn exterior(&self) -> &[(f64, f64)] {
        self.rings.first().map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn from_bbox(bbox: &BoundingBox) -> Self {
        Self::new(vec![
            (bbox.min_x, bbox.min_y),
            (bbox.max_x, bbox.min_y),
            (bbox.max_x, bbox.max_y),
            (bbox.min_x, bbox.max_y),
            (bbox.min_x, bbox.min_y),
        ])
    }

    fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.exterior().iter().copied())
    }

    /// Signed shoelace sums of a ring: (twice the area, x-moment, y-moment).
    fn ring_moments(ring: &[(f64, f64)]) -> (f64, f64, f64) {
        let mut a = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for w in ring.windows(2) {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            let cross = x0 * y1 - x1 * y0;
            a += cross;
            cx += (x0 + x1) * cross;
            cy += (y0 + y1) * cross;
        }
        (a, cx, cy)
    }

    pub fn area(&self) -> f64 {
        let mut iter = self.rings.iter();
        let outer = iter
            .next()
            .map(|r| Self::ring_moments(r).0.abs() / 2.0)
            .unwrap_or(0.0);
        let holes: f64 = iter.map(|r| Self::ring_moments(r).0.abs() / 2.0).sum();
        outer - holes
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        // Even-odd rule over all rings handles holes.
        let mut inside = false;
        for ring in &self.rings {
            for w in ring.windows(2) {
                let (x0, y0) = w[0];
                let (x1, y1) = w[1];
                if (y0 > y) != (y1 > y) && x < (x1 - x0) * (y - y0) / (y1 - y0) + x0 {
                    inside = !inside;
                }
            }
        }
        inside
    }

    fn edges(&self) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
        self.rings
            .iter()
            .flat_map(|ring| ring.windows(2).map(|w| (w[0], w[1])))
    }

    pub fn intersects(&self, other: &Polygon) -> bool {
        match (self.bbox(), other.bbox()) {
            (Some(a), Some(b)) if a.intersects(&b) || a == b => {}
            _ => return false,
        }
        if self
            .exterior()
            .iter()
            .any(|&(x, y)| other.contains_point(x, y))
            || other
                .exterior()
                .iter()
                .any(|&(x, y)| self.contains_point(x, y))
        {
            return true;
        }
        self.edges()
            .any(|a| other.edges().any(|b| segments_cross(a, b)))
    }

    fn map_coords<F>(&self, f: &F) -> SentinelResult<Polygon>
    where
        F: Fn(f64, f64) -> SentinelResult<(f64, f64)>,
    {
        let rings = self
            .rings
            .iter()
            .map(|ring| ring.iter().map(|&(x, y)| f(x, y)).collect::<SentinelResult<Vec<_>>>())
            .collect::<SentinelResult<Vec<_>>>()?;
        Ok(Polygon { rings })
    }

    fn to_coordinates(&self) -> Value {
        Value::Array(
            self.rings
                .iter()
                .map(|ring| Value::Array(ring.iter().map(|&(x, y)| json!([x, y])).collect()))
                .collect(),
        )
    }

    fn from_coordinates(value: &Value) -> SentinelResult<Polygon> {
        let rings = value
            .as_array()
            .ok_or_else(|| SentinelError::malformed("polygon coordinates must be an array"))?
            .iter()
            .map(parse_ring)
            .collect::<SentinelResult<Vec<_>>>()?;
        if rings.is_empty() {
            return Err(SentinelError::malformed("polygon has no rings"));
        }
        Ok(Polygon { rings })
    }
}

fn parse_ring(value: &Value) -> SentinelResult<Vec<(f64, f64)>> {
    let points = value
        .as_array()
        .ok_or_else(|| SentinelError::malformed("ring must be an array"))?;
    let mut ring = Vec::with_capacity(points.len() + 1);
    for point in points {
        let pair = point.as_array().filter(|p| p.len() >= 2);
        let (x, y) = match pair {
            Some(p) => (p[0].as_f64(), p[1].as_f64()),
            None => (None, None),
        };
        match (x, y) {
            (Some(x), Some(y)) => ring.push((x, y)),
            _ => return Err(SentinelError::malformed(format!("invalid position {}", point))),
        }
    }
    if ring.len() < 3 {
        return Err(SentinelError::malformed("ring needs at least three positions"));
    }
    if ring.first() != ring.last() {
        ring.push(ring[0]);
    }
    Ok(ring)
}

fn orientation(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> f64 {
    (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
}

fn segments_cross(a: ((f64, f64), (f64, f64)), b: ((f64, f64), (f64, f64))) -> bool {
    let d1 = orientation(b.0, b.1, a.0);
    let d2 = orientation(b.0, b.1, a.1);
    let d3 = orientation(a.0, a.1, b.0);
    let d4 = orientation(a.0, a.1, b.1);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// A polygonal geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    pub fn polygons(&self) -> &[Polygon] {
        match self {
            Geometry::Polygon(p) => std::slice::from_ref(p),
            Geometry::MultiPolygon(ps) => ps,
        }
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        self.polygons()
            .iter()
            .filter_map(|p| p.bbox())
            .reduce(|a, b| a.union(&b))
    }

    pub fn area(&self) -> f64 {
        self.polygons().iter().map(|p| p.area()).sum()
    }

    /// Area-weighted centroid; falls back to the bbox center for degenerate shapes.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let mut a = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for polygon in self.polygons() {
            for (i, ring) in polygon.rings.iter().enumerate() {
                let (ra, rx, ry) = Polygon::ring_moments(ring);
                // Shells count positive and holes negative whatever their winding.
                let sign = if i == 0 { ra.signum() } else { -ra.signum() };
                a += ra * sign;
                cx += rx * sign;
                cy += ry * sign;
            }
        }
        if a.abs() < f64::EPSILON {
            return self.bbox().map(|b| b.center());
        }
        Some((cx / (3.0 * a), cy / (3.0 * a)))
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.polygons().iter().any(|p| p.contains_point(x, y))
    }

    pub fn intersects(&self, other: &Geometry) -> bool {
        self.polygons()
            .iter()
            .any(|a| other.polygons().iter().any(|b| a.intersects(b)))
    }

    pub fn intersects_bbox(&self, bbox: &BoundingBox) -> bool {
        self.intersects(&Geometry::Polygon(Polygon::from_bbox(bbox)))
    }

    /// Transform every coordinate, e.g. to reproject the geometry.
    pub fn try_map_coords<F>(&self, f: F) -> SentinelResult<Geometry>
    where
        F: Fn(f64, f64) -> SentinelResult<(f64, f64)>,
    {
        Ok(match self {
            Geometry::Polygon(p) => Geometry::Polygon(p.map_coords(&f)?),
            Geometry::MultiPolygon(ps) => Geometry::MultiPolygon(
                ps.iter()
                    .map(|p| p.map_coords(&f))
                    .collect::<SentinelResult<Vec<_>>>()?,
            ),
        })
    }

    pub fn map_coords<F>(&self, f: F) -> Geometry
    where
        F: Fn(f64, f64) -> (f64, f64),
    {
        let map = |p: &Polygon| Polygon {
            rings: p
                .rings
                .iter()
                .map(|ring| ring.iter().map(|&(x, y)| f(x, y)).collect())
                .collect(),
        };
        match self {
            Geometry::Polygon(p) => Geometry::Polygon(map(p)),
            Geometry::MultiPolygon(ps) => Geometry::MultiPolygon(ps.iter().map(map).collect()),
        }
    }

    /// Parse a GeoJSON Polygon or MultiPolygon geometry object.
    pub fn from_geojson(value: &Value) -> SentinelResult<Geometry> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| SentinelError::malformed("geometry has no type"))?;
        let coordinates = value
            .get("coordinates")
            .ok_or_else(|| SentinelError::malformed("geometry has no coordinates"))?;
        match kind {
            "Polygon" => Ok(Geometry::Polygon(Polygon::from_coordinates(coordinates)?)),
            "MultiPolygon" => {
                let polygons = coordinates
                    .as_array()
                    .ok_or_else(|| SentinelError::malformed("multipolygon must be an array"))?
                    .iter()
                    .map(Polygon::from_coordinates)
                    .collect::<SentinelResult<Vec<_>>>()?;
                Ok(Geometry::MultiPolygon(polygons))
            }
            other => Err(SentinelError::malformed(format!(
                "unsupported geometry type '{}'",
                other
            ))),
        }
    }

    pub fn from_geojson_str(s: &str) -> SentinelResult<Geometry> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_geojson(&value)
    }

    pub fn to_geojson(&self) -> Value {
        match self {
            Geometry::Polygon(p) => json!({"type": "Polygon", "coordinates": p.to_coordinates()}),
            Geometry::MultiPolygon(ps) => json!({
                "type": "MultiPolygon",
                "coordinates": Value::Array(ps.iter().map(|p| p.to_coordinates()).collect()),
            }),
        }
    }

    /// Wrap a polygon into a multipolygon, leave multipolygons untouched.
    pub fn into_multi(self) -> Geometry {
        match self {
            Geometry::Polygon(p) => Geometry::MultiPolygon(vec![p]),
            multi => multi,
        }
    }
}

/// CRS name carried by a GeoJSON object's `crs.properties.name`, if any.
pub fn geojson_crs_name(value: &Value) -> Option<&str> {
    value
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Geometry {
        Geometry::Polygon(Polygon::from_bbox(&BoundingBox::new(
            x0,
            y0,
            x0 + size,
            y0 + size,
        )))
    }

    #[test]
    fn test_geojson_parse() {
        let value = json!({
            "type": "Polygon",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG:8.8.1:32632"}},
            "coordinates": [[[300000.0, 5000000.0], [409800.0, 5000000.0],
                             [409800.0, 5109800.0], [300000.0, 5109800.0],
                             [300000.0, 5000000.0]]]
        });
        let geom = Geometry::from_geojson(&value).unwrap();
        let bbox = geom.bbox().unwrap();
        assert_eq!(bbox, BoundingBox::new(300000.0, 5000000.0, 409800.0, 5109800.0));
        assert_eq!(
            geojson_crs_name(&value),
            Some("urn:ogc:def:crs:EPSG:8.8.1:32632")
        );

        let back = Geometry::from_geojson(&geom.to_geojson()).unwrap();
        assert_eq!(back, geom);
    }

    #[test]
    fn test_geojson_rejects_points() {
        let value = json!({"type": "Point", "coordinates": [1.0, 2.0]});
        assert!(Geometry::from_geojson(&value).is_err());
    }

    #[test]
    fn test_area_and_centroid() {
        let geom = square(0.0, 0.0, 2.0);
        assert!((geom.area() - 4.0).abs() < 1e-12);
        let (cx, cy) = geom.centroid().unwrap();
        assert!((cx - 1.0).abs() < 1e-12);
        assert!((cy - 1.0).abs() < 1e-12);

        let multi = Geometry::MultiPolygon(vec![
            Polygon::from_bbox(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)),
            Polygon::from_bbox(&BoundingBox::new(2.0, 0.0, 3.0, 1.0)),
        ]);
        let (cx, cy) = multi.centroid().unwrap();
        assert!((cx - 1.5).abs() < 1e-12);
        assert!((cy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_intersects() {
        let a = square(0.0, 0.0, 10.0);
        assert!(a.intersects(&square(5.0, 5.0, 10.0)));
        assert!(a.intersects(&square(2.0, 2.0, 1.0)));
        assert!(square(2.0, 2.0, 1.0).intersects(&a));
        assert!(!a.intersects(&square(20.0, 20.0, 1.0)));

        // Cross shape: no vertex of either inside the other.
        let wide = Geometry::Polygon(Polygon::from_bbox(&BoundingBox::new(-5.0, 4.0, 15.0, 6.0)));
        let tall = Geometry::Polygon(Polygon::from_bbox(&BoundingBox::new(4.0, -5.0, 6.0, 15.0)));
        assert!(wide.intersects(&tall));
    }

    #[test]
    fn test_contains_point_with_hole() {
        let polygon = Polygon {
            rings: vec![
                Polygon::from_bbox(&BoundingBox::new(0.0, 0.0, 10.0, 10.0)).rings[0].clone(),
                Polygon::from_bbox(&BoundingBox::new(4.0, 4.0, 6.0, 6.0)).rings[0].clone(),
            ],
        };
        assert!(polygon.contains_point(1.0, 1.0));
        assert!(!polygon.contains_point(5.0, 5.0));
        assert!((polygon.area() - 96.0).abs() < 1e-12);
    }

    #[test]
    fn test_map_coords() {
        let geom = square(0.0, 0.0, 1.0).map_coords(|x, y| (x * 2.0, y + 1.0));
        assert_eq!(geom.bbox().unwrap(), BoundingBox::new(0.0, 1.0, 2.0, 2.0));
    }
}
