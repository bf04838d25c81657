//! Cut a UTM scene raster into Web-Mercator tiles.

use rayon::prelude::*;

use projection::{lonlat_to_mercator, TileCoordLut, Utm};
use sentinel_common::tile::{tile_index_range, INDEX_TOLERANCE, TILE_PIXELS, TILE_SIZE};
use sentinel_common::{BoundingBox, DataType, SentinelResult, TileCoord, UtmZone, SENTINEL_NODATA};
use storage::{GeoRaster, RasterTile};

/// Points sampled along each raster edge when computing its Mercator extent.
const EDGE_SAMPLES: usize = 16;

/// Reprojects one scene raster onto the tile grid.
pub struct Tiler<'a> {
    raster: &'a GeoRaster,
    utm: Utm,
    datatype: DataType,
}

impl<'a> Tiler<'a> {
    /// `srid` is used when the raster carries no CRS of its own.
    pub fn new(raster: &'a GeoRaster, srid: u32, datatype: DataType) -> SentinelResult<Self> {
        let zone = UtmZone::from_srid(raster.srid.unwrap_or(srid))?;
        Ok(Self {
            raster,
            utm: Utm::new(zone),
            datatype,
        })
    }

    /// Web-Mercator extent of the raster.
    pub fn mercator_bounds(&self) -> Option<BoundingBox> {
        let (min_x, min_y, max_x, max_y) = self.raster.extent();
        let mut points = Vec::with_capacity(4 * (EDGE_SAMPLES + 1));
        for i in 0..=EDGE_SAMPLES {
            let t = i as f64 / EDGE_SAMPLES as f64;
            let x = min_x + (max_x - min_x) * t;
            let y = min_y + (max_y - min_y) * t;
            points.push((x, min_y));
            points.push((x, max_y));
            points.push((min_x, y));
            points.push((max_x, y));
        }
        BoundingBox::from_points(points.into_iter().map(|(e, n)| {
            let (lon, lat) = self.utm.inverse(e, n);
            lonlat_to_mercator(lon, lat)
        }))
    }

    /// Tiles at `zoom` touched by the raster.
    pub fn covering_tiles(&self, zoom: u32) -> Vec<TileCoord> {
        match self.mercator_bounds() {
            Some(bounds) => tile_index_range(&bounds, zoom, INDEX_TOLERANCE).iter().collect(),
            None => Vec::new(),
        }
    }

    /// Nearest-neighbour resample of the raster into one tile. Pixels outside
    /// the raster or equal to its nodata value become nodata.
    pub fn render(&self, coord: &TileCoord) -> RasterTile {
        let lut = TileCoordLut::for_utm(coord, &self.utm);
        let source_nodata = self.raster.nodata.unwrap_or(SENTINEL_NODATA);
        let transform = &self.raster.transform;

        let mut data = Vec::with_capacity(TILE_PIXELS);
        for row in 0..TILE_SIZE {
            for col in 0..TILE_SIZE {
                let (e, n) = lut.get(col, row);
                let (px, py) = transform.to_pixel(e, n);
                let value = self
                    .raster
                    .pixel(px.floor() as i64, py.floor() as i64)
                    .filter(|&v| v != source_nodata)
                    .unwrap_or(SENTINEL_NODATA);
                data.push(value);
            }
        }

        RasterTile {
            data,
            nodata: SENTINEL_NODATA,
            datatype: self.datatype,
        }
    }

    /// Render a batch of tiles in parallel, dropping tiles that hold no data.
    pub fn render_batch(&self, coords: &[TileCoord]) -> Vec<(TileCoord, RasterTile)> {
        coords
            .par_iter()
            .map(|coord| (*coord, self.render(coord)))
            .filter(|(_, tile)| !tile.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::tile::latlon_to_tile;
    use storage::GeoTransform;

    /// A 10 km square at 100 m resolution around Milan in zone 32N.
    fn milan_raster() -> GeoRaster {
        let width = 100;
        let height = 100;
        let data = (0..width * height).map(|i| 1 + (i % 500) as u16).collect();
        GeoRaster {
            width,
            height,
            data,
            transform: GeoTransform {
                origin_x: 510000.0,
                origin_y: 5040000.0,
                scale_x: 100.0,
                scale_y: 100.0,
            },
            srid: Some(32632),
            nodata: Some(0),
            datatype: DataType::U16,
        }
    }

    #[test]
    fn test_covering_tiles_contains_center() {
        let raster = milan_raster();
        let tiler = Tiler::new(&raster, 32632, DataType::U16).unwrap();

        let center = Utm::new(UtmZone::from_srid(32632).unwrap()).inverse(515000.0, 5035000.0);
        let tile = latlon_to_tile(center.1, center.0, 11);
        let tiles = tiler.covering_tiles(11);
        assert!(tiles.contains(&tile), "{:?} not in {:?}", tile, tiles);
        assert!(tiles.len() <= 4);
    }

    #[test]
    fn test_render_samples_source_pixels() {
        let raster = milan_raster();
        let tiler = Tiler::new(&raster, 32632, DataType::U16).unwrap();
        let utm = Utm::new(UtmZone::from_srid(32632).unwrap());

        // A z14 tile fully inside the raster.
        let (lon, lat) = utm.inverse(515000.0, 5035000.0);
        let coord = latlon_to_tile(lat, lon, 14);
        let tile = tiler.render(&coord);
        assert!(!tile.is_empty());

        let lut = TileCoordLut::for_utm(&coord, &utm);
        let (e, n) = lut.get(100, 100);
        let (px, py) = raster.transform.to_pixel(e, n);
        let expected = raster.pixel(px.floor() as i64, py.floor() as i64).unwrap();
        assert_eq!(tile.data[100 * TILE_SIZE + 100], expected);
    }

    #[test]
    fn test_render_outside_raster_is_empty() {
        let raster = milan_raster();
        let tiler = Tiler::new(&raster, 32632, DataType::U16).unwrap();
        let far = latlon_to_tile(40.0, 9.0, 14);
        assert!(tiler.render(&far).is_empty());
        assert!(tiler.render_batch(&[far]).is_empty());
    }

    #[test]
    fn test_source_nodata_maps_to_nodata() {
        let mut raster = milan_raster();
        raster.data.iter_mut().for_each(|v| *v = 77);
        raster.nodata = Some(77);
        let tiler = Tiler::new(&raster, 32632, DataType::U16).unwrap();
        let utm = Utm::new(UtmZone::from_srid(32632).unwrap());
        let (lon, lat) = utm.inverse(515000.0, 5035000.0);
        assert!(tiler.render(&latlon_to_tile(lat, lon, 14)).is_empty());
    }
}
