//! Single-band rasters and their GeoTIFF encoding.
//!
//! Tiles are stored as deflate-compressed GeoTIFFs whose origin and pixel
//! scale are derived from the tile coordinate. The same codec reads the
//! canonical UTM GeoTIFFs produced during ingestion.

use std::io::Cursor;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, compression::Deflate, DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

use sentinel_common::tile::{tile_scale, TILE_PIXELS, TILE_SIZE, WEB_MERCATOR_SRID};
use sentinel_common::{DataType, SentinelError, SentinelResult, TileCoord, SENTINEL_NODATA};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_MODEL_TYPE_KEY: u32 = 1024;
const GT_RASTER_TYPE_KEY: u32 = 1025;
const GEOGRAPHIC_TYPE_KEY: u32 = 2048;
const PROJECTED_CS_TYPE_KEY: u32 = 3072;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn tiff_error(e: tiff::TiffError) -> SentinelError {
    SentinelError::RasterError(e.to_string())
}

/// Affine placement of a north-up raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner
    pub origin_y: f64,
    /// Pixel width in CRS units
    pub scale_x: f64,
    /// Pixel height in CRS units (positive, rows go south)
    pub scale_y: f64,
}

impl GeoTransform {
    /// Fractional (column, row) of a CRS coordinate.
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.scale_x,
            (self.origin_y - y) / self.scale_y,
        )
    }
}

/// A north-up single-band raster of arbitrary size.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u16>,
    pub transform: GeoTransform,
    pub srid: Option<u32>,
    pub nodata: Option<u16>,
    pub datatype: DataType,
}

impl GeoRaster {
    /// Pixel value at (col, row), `None` outside the raster.
    pub fn pixel(&self, col: i64, row: i64) -> Option<u16> {
        if col < 0 || row < 0 || col as usize >= self.width || row as usize >= self.height {
            return None;
        }
        Some(self.data[row as usize * self.width + col as usize])
    }

    /// Extent as (min_x, min_y, max_x, max_y).
    pub fn extent(&self) -> (f64, f64, f64, f64) {
        let t = &self.transform;
        (
            t.origin_x,
            t.origin_y - t.scale_y * self.height as f64,
            t.origin_x + t.scale_x * self.width as f64,
            t.origin_y,
        )
    }

    /// Encode as a deflate-compressed GeoTIFF.
    pub fn encode(&self) -> SentinelResult<Vec<u8>> {
        if self.data.len() != self.width * self.height {
            return Err(SentinelError::RasterError(format!(
                "raster has {} pixels, expected {}x{}",
                self.data.len(),
                self.width,
                self.height
            )));
        }

        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer).map_err(tiff_error)?;
            let (w, h) = (self.width as u32, self.height as u32);
            match self.datatype {
                DataType::U16 => {
                    let mut image = encoder
                        .new_image_with_compression::<colortype::Gray16, _>(w, h, Deflate::default())
                        .map_err(tiff_error)?;
                    self.write_geotags(image.encoder())?;
                    image.write_data(&self.data).map_err(tiff_error)?;
                }
                DataType::U8 => {
                    let narrow: Vec<u8> = self.data.iter().map(|&v| v.min(255) as u8).collect();
                    let mut image = encoder
                        .new_image_with_compression::<colortype::Gray8, _>(w, h, Deflate::default())
                        .map_err(tiff_error)?;
                    self.write_geotags(image.encoder())?;
                    image.write_data(&narrow).map_err(tiff_error)?;
                }
            }
        }
        Ok(buffer.into_inner())
    }

    fn write_geotags<W, K>(&self, dir: &mut DirectoryEncoder<'_, W, K>) -> SentinelResult<()>
    where
        W: std::io::Write + std::io::Seek,
        K: TiffKind,
    {
        let t = &self.transform;
        dir.write_tag(tag(MODEL_PIXEL_SCALE), &[t.scale_x, t.scale_y, 0.0][..])
            .map_err(tiff_error)?;
        dir.write_tag(
            tag(MODEL_TIEPOINT),
            &[0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0][..],
        )
        .map_err(tiff_error)?;

        if let Some(srid) = self.srid {
            let (model_type, cs_key) = if srid == 4326 {
                (2u16, GEOGRAPHIC_TYPE_KEY as u16)
            } else {
                (1u16, PROJECTED_CS_TYPE_KEY as u16)
            };
            let keys: [u16; 16] = [
                1, 1, 0, 3,
                GT_MODEL_TYPE_KEY as u16, 0, 1, model_type,
                GT_RASTER_TYPE_KEY as u16, 0, 1, 1,
                cs_key, 0, 1, srid as u16,
            ];
            dir.write_tag(tag(GEO_KEY_DIRECTORY), &keys[..])
                .map_err(tiff_error)?;
        }

        if let Some(nodata) = self.nodata {
            let text = nodata.to_string();
            dir.write_tag(tag(GDAL_NODATA), text.as_str())
                .map_err(tiff_error)?;
        }
        Ok(())
    }

    /// Decode a single-band GeoTIFF (8 or 16 bit unsigned).
    pub fn decode(bytes: &[u8]) -> SentinelResult<GeoRaster> {
        let mut decoder = Decoder::new(Cursor::new(bytes))
            .map_err(tiff_error)?
            .with_limits(Limits::unlimited());

        let (width, height) = decoder.dimensions().map_err(tiff_error)?;

        let scale = decoder
            .find_tag(tag(MODEL_PIXEL_SCALE))
            .map_err(tiff_error)?
            .map(|v| v.into_f64_vec())
            .transpose()
            .map_err(tiff_error)?;
        let tiepoint = decoder
            .find_tag(tag(MODEL_TIEPOINT))
            .map_err(tiff_error)?
            .map(|v| v.into_f64_vec())
            .transpose()
            .map_err(tiff_error)?;
        let geokeys = decoder
            .find_tag(tag(GEO_KEY_DIRECTORY))
            .map_err(tiff_error)?
            .map(|v| v.into_u32_vec())
            .transpose()
            .map_err(tiff_error)?;
        let nodata = decoder
            .find_tag(tag(GDAL_NODATA))
            .map_err(tiff_error)?
            .map(|v| v.into_string())
            .transpose()
            .map_err(tiff_error)?
            .and_then(|s| s.trim_end_matches('\0').trim().parse::<f64>().ok())
            .map(|v| v as u16);

        let transform = match (scale, tiepoint) {
            (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => GeoTransform {
                origin_x: t[3] - t[0] * s[0],
                origin_y: t[4] + t[1] * s[1],
                scale_x: s[0],
                scale_y: s[1],
            },
            _ => {
                return Err(SentinelError::RasterError(
                    "GeoTIFF lacks pixel scale or tiepoint".to_string(),
                ))
            }
        };

        let srid = geokeys.and_then(|keys| {
            keys.chunks(4)
                .skip(1)
                .find(|k| {
                    k.len() == 4 && (k[0] == PROJECTED_CS_TYPE_KEY || k[0] == GEOGRAPHIC_TYPE_KEY)
                })
                .map(|k| k[3])
        });

        let (data, datatype) = match decoder.read_image().map_err(tiff_error)? {
            DecodingResult::U16(data) => (data, DataType::U16),
            DecodingResult::U8(data) => (data.into_iter().map(u16::from).collect(), DataType::U8),
            _ => {
                return Err(SentinelError::RasterError(
                    "unsupported GeoTIFF sample format".to_string(),
                ))
            }
        };

        if data.len() != width as usize * height as usize {
            return Err(SentinelError::RasterError(format!(
                "expected a single band of {}x{} pixels, got {} samples",
                width,
                height,
                data.len()
            )));
        }

        Ok(GeoRaster {
            width: width as usize,
            height: height as usize,
            data,
            transform,
            srid,
            nodata,
            datatype,
        })
    }
}

/// One 256x256 tile of one layer.
///
/// Pixels are held as `u16` for every datatype; the datatype decides how the
/// tile is encoded and how it aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    pub data: Vec<u16>,
    pub nodata: u16,
    pub datatype: DataType,
}

impl RasterTile {
    pub fn new(data: Vec<u16>, nodata: u16, datatype: DataType) -> SentinelResult<Self> {
        if data.len() != TILE_PIXELS {
            return Err(SentinelError::RasterError(format!(
                "tile has {} pixels, expected {}",
                data.len(),
                TILE_PIXELS
            )));
        }
        Ok(Self {
            data,
            nodata,
            datatype,
        })
    }

    /// A tile with every pixel set to `value`.
    pub fn filled(value: u16, nodata: u16, datatype: DataType) -> Self {
        Self {
            data: vec![value; TILE_PIXELS],
            nodata,
            datatype,
        }
    }

    /// A tile with every pixel set to nodata.
    pub fn empty(datatype: DataType) -> Self {
        Self::filled(SENTINEL_NODATA, SENTINEL_NODATA, datatype)
    }

    /// True when every pixel is nodata.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == self.nodata)
    }

    /// Fill this tile's nodata pixels from an existing tile.
    pub fn merge_from(&mut self, existing: &RasterTile) {
        for (new, old) in self.data.iter_mut().zip(existing.data.iter()) {
            if *new == self.nodata && *old != existing.nodata {
                *new = *old;
            }
        }
    }

    /// Expand the sub-window at (`offset_x`, `offset_y`) of side
    /// `TILE_SIZE / factor` to a full tile by repeating each pixel
    /// `factor` times along both axes.
    pub fn upsample_window(&self, factor: usize, offset_x: usize, offset_y: usize) -> RasterTile {
        RasterTile {
            data: disaggregate(&self.data, factor, offset_x, offset_y),
            nodata: self.nodata,
            datatype: self.datatype,
        }
    }

    /// Georeference the tile at a Web-Mercator tile coordinate.
    pub fn to_georaster(&self, coord: &TileCoord) -> GeoRaster {
        let bounds = coord.bounds();
        let scale = tile_scale(coord.z);
        GeoRaster {
            width: TILE_SIZE,
            height: TILE_SIZE,
            data: self.data.clone(),
            transform: GeoTransform {
                origin_x: bounds.min_x,
                origin_y: bounds.max_y,
                scale_x: scale,
                scale_y: scale,
            },
            srid: Some(WEB_MERCATOR_SRID),
            nodata: Some(self.nodata),
            datatype: self.datatype,
        }
    }

    pub fn encode(&self, coord: &TileCoord) -> SentinelResult<Vec<u8>> {
        self.to_georaster(coord).encode()
    }

    pub fn decode(bytes: &[u8]) -> SentinelResult<RasterTile> {
        let raster = GeoRaster::decode(bytes)?;
        if raster.width != TILE_SIZE || raster.height != TILE_SIZE {
            return Err(SentinelError::RasterError(format!(
                "tile is {}x{}, expected {}x{}",
                raster.width, raster.height, TILE_SIZE, TILE_SIZE
            )));
        }
        Ok(RasterTile {
            data: raster.data,
            nodata: raster.nodata.unwrap_or(SENTINEL_NODATA),
            datatype: raster.datatype,
        })
    }
}

/// Take the `TILE_SIZE / factor` square window at (`offset_x`, `offset_y`) and
/// repeat every pixel `factor` times along both axes.
pub fn disaggregate(data: &[u16], factor: usize, offset_x: usize, offset_y: usize) -> Vec<u16> {
    let size = TILE_SIZE / factor;
    let mut out = Vec::with_capacity(TILE_PIXELS);
    for row in 0..TILE_SIZE {
        let src_row = offset_y + row / factor;
        let src = &data[src_row * TILE_SIZE + offset_x..src_row * TILE_SIZE + offset_x + size];
        for &value in src {
            for _ in 0..factor {
                out.push(value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<u16> {
        (0..TILE_PIXELS).map(|i| (i % 4000) as u16).collect()
    }

    #[test]
    fn test_tile_geotiff_round_trip_u16() {
        let coord = TileCoord::new(14, 8500, 5700);
        let tile = RasterTile::new(ramp(), 0, DataType::U16).unwrap();
        let bytes = tile.encode(&coord).unwrap();
        let decoded = RasterTile::decode(&bytes).unwrap();
        assert_eq!(decoded, tile);

        let raster = GeoRaster::decode(&bytes).unwrap();
        assert_eq!(raster.srid, Some(WEB_MERCATOR_SRID));
        let bounds = coord.bounds();
        assert!((raster.transform.origin_x - bounds.min_x).abs() < 1e-6);
        assert!((raster.transform.origin_y - bounds.max_y).abs() < 1e-6);
        assert!((raster.transform.scale_x - tile_scale(14)).abs() < 1e-9);
    }

    #[test]
    fn test_scene_class_tile_is_byte_sized() {
        let coord = TileCoord::new(13, 10, 10);
        let data: Vec<u16> = (0..TILE_PIXELS).map(|i| (i % 12) as u16).collect();
        let tile = RasterTile::new(data, 0, DataType::U8).unwrap();
        let decoded = RasterTile::decode(&tile.encode(&coord).unwrap()).unwrap();
        assert_eq!(decoded.datatype, DataType::U8);
        assert_eq!(decoded.data, tile.data);
    }

    #[test]
    fn test_utm_raster_round_trip() {
        let raster = GeoRaster {
            width: 30,
            height: 20,
            data: (0..600).collect(),
            transform: GeoTransform {
                origin_x: 399960.0,
                origin_y: 5100000.0,
                scale_x: 60.0,
                scale_y: 60.0,
            },
            srid: Some(32632),
            nodata: Some(0),
            datatype: DataType::U16,
        };
        let decoded = GeoRaster::decode(&raster.encode().unwrap()).unwrap();
        assert_eq!(decoded.srid, Some(32632));
        assert_eq!(decoded.nodata, Some(0));
        assert_eq!(decoded.pixel(29, 19), Some(599));
        assert_eq!(decoded.pixel(30, 0), None);
        assert_eq!(decoded.extent(), (399960.0, 5098800.0, 401760.0, 5100000.0));
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(RasterTile::new(vec![0; 10], 0, DataType::U16).is_err());
    }

    #[test]
    fn test_disaggregate_window() {
        let data: Vec<u16> = (0..TILE_PIXELS).map(|i| (i % 50000) as u16).collect();
        let out = disaggregate(&data, 2, 128, 128);
        assert_eq!(out.len(), TILE_PIXELS);
        // Output (0, 0) is input (row 128, col 128).
        assert_eq!(out[0], data[TILE_SIZE * 128 + 128]);
        assert_eq!(out[1], out[0]);
        assert_eq!(out[TILE_SIZE], out[0]);
        assert_eq!(out[2], data[TILE_SIZE * 128 + 129]);
        assert_eq!(out[TILE_PIXELS - 1], data[TILE_PIXELS - 1]);
    }

    #[test]
    fn test_merge_fills_only_nodata() {
        let mut incoming = RasterTile::filled(0, 0, DataType::U16);
        incoming.data[0] = 7;
        let mut existing = RasterTile::filled(3, 0, DataType::U16);
        existing.data[1] = 0;

        incoming.merge_from(&existing);
        assert_eq!(incoming.data[0], 7);
        assert_eq!(incoming.data[1], 0);
        assert_eq!(incoming.data[2], 3);

        let once = incoming.clone();
        incoming.merge_from(&existing);
        assert_eq!(incoming, once);
    }
}
