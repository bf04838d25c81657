//! Scene ingestion: fetch a scene's bands and scene-class mask, correct them
//! to L2A when needed and store them as tiles at each band's native zoom.

use chrono::NaiveDate;
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use projection::transform_geometry;
use sentinel_common::crs::WGS84_SRID;
use sentinel_common::{Band, LayerKind, SentinelError, TileCoord, UtmZone};
use storage::{
    Catalog, GeoRaster, LogTable, ObjectStorage, ProcessingLevel, Scene, SceneStatus, TileStore,
    WriteOutcome,
};

use crate::correction::{
    find_granule_file, RasterToolchain, L1C_PRODUCT_MARKER, L2A_PRODUCT_MARKER,
};
use crate::error::{IngestionError, Result};
use crate::tiler::Tiler;
use crate::tileinfo::PRODUCT_INFO_FILE;

/// Tiles rendered per blocking batch.
const DEFAULT_TILE_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Parent of the per-scene scratch directories; the system temp dir when unset
    pub work_dir: Option<PathBuf>,
    /// Scenes captured before this day have no product in the L2A bucket
    pub l2a_availability_date: NaiveDate,
    pub tile_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            l2a_availability_date: NaiveDate::from_ymd_opt(2018, 12, 18).unwrap_or_default(),
            tile_batch: DEFAULT_TILE_BATCH,
        }
    }
}

/// What an ingestion call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The scene was already processing, finished or broken.
    Skipped(SceneStatus),
    Ingested {
        level: ProcessingLevel,
        tiles_written: usize,
    },
}

/// Where the layer rasters of a scene came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    L2aBucket,
    Sen2Cor,
}

pub struct SceneIngestor {
    catalog: Catalog,
    tiles: Arc<dyn TileStore>,
    l1c: Arc<ObjectStorage>,
    l2a: Arc<ObjectStorage>,
    toolchain: Arc<dyn RasterToolchain>,
    config: IngestConfig,
}

impl SceneIngestor {
    pub fn new(
        catalog: Catalog,
        tiles: Arc<dyn TileStore>,
        l1c: Arc<ObjectStorage>,
        l2a: Arc<ObjectStorage>,
        toolchain: Arc<dyn RasterToolchain>,
        config: IngestConfig,
    ) -> Self {
        Self {
            catalog,
            tiles,
            l1c,
            l2a,
            toolchain,
            config,
        }
    }

    /// Ingest one scene.
    ///
    /// On failure the scene is marked *failed* (counting the attempt) and the
    /// error is returned; the scratch directory is removed either way.
    #[instrument(skip(self))]
    pub async fn ingest(&self, scene_id: i64) -> Result<IngestOutcome> {
        if !self.catalog.begin_scene_processing(scene_id).await? {
            let scene = self.catalog.get_scene(scene_id).await?;
            self.scene_log(
                scene_id,
                &format!("Status is {}, aborted additional ingestion.", scene.status.as_str()),
            )
            .await?;
            info!(status = scene.status.as_str(), "Scene not ingestible, skipping");
            return Ok(IngestOutcome::Skipped(scene.status));
        }

        let scene = self.catalog.get_scene(scene_id).await?;
        let result = match self.scratch_dir(scene_id).await {
            Ok(scratch) => self.run(&scene, scratch.path()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(tiles_written) => {
                self.catalog
                    .finish_scene(scene_id, ProcessingLevel::L2A)
                    .await?;
                counter!("sentinel_scenes_ingested_total").increment(1);
                info!(tiles_written, "Finished scene ingestion");
                Ok(IngestOutcome::Ingested {
                    level: ProcessingLevel::L2A,
                    tiles_written,
                })
            }
            Err(e) => {
                warn!(error = %e, "Scene ingestion failed");
                let retries = self.catalog.fail_scene(scene_id, &e.to_string()).await?;
                counter!("sentinel_scene_ingest_failures_total").increment(1);
                info!(retries, "Marked scene failed");
                Err(e)
            }
        }
    }

    async fn scratch_dir(&self, scene_id: i64) -> Result<tempfile::TempDir> {
        let prefix = format!("scene-{}-", scene_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.config.work_dir {
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn run(&self, scene: &Scene, dir: &Path) -> Result<usize> {
        let zone = UtmZone::from_latitude_band(scene.utm_zone, &scene.latitude_band)?;
        let srid = zone.srid();

        let rasters = match self.source_for(scene).await? {
            Source::L2aBucket => self.download_l2a(scene, dir, srid).await?,
            Source::Sen2Cor => self.run_sen2cor(scene, dir, srid).await?,
        };

        let layers = self.catalog.scene_layers(scene.id).await?;
        let mut total = 0;
        for (kind, path) in rasters {
            let written = self.tile_layer(kind, layers.get(kind), &path, srid).await?;
            self.scene_log(
                scene.id,
                &format!("Finished processing band {} ({} tiles)", kind, written),
            )
            .await?;
            total += written;
        }
        Ok(total)
    }

    async fn source_for(&self, scene: &Scene) -> Result<Source> {
        if scene.collected_at.date_naive() < self.config.l2a_availability_date {
            return Ok(Source::Sen2Cor);
        }
        let info_key = format!("{}{}", scene.prefix, PRODUCT_INFO_FILE);
        if self.l2a.exists(&info_key).await? {
            Ok(Source::L2aBucket)
        } else {
            Ok(Source::Sen2Cor)
        }
    }

    /// Download every layer from the L2A bucket, B10 from the L1C bucket.
    ///
    /// Granules in the L2A bucket lack a usable georeference, so each one is
    /// rewritten with the footprint's UTM extent and the zone SRID.
    async fn download_l2a(
        &self,
        scene: &Scene,
        dir: &Path,
        srid: u32,
    ) -> Result<Vec<(LayerKind, PathBuf)>> {
        self.scene_log(scene.id, "Found existing L2A product, downloading data.")
            .await?;

        let extent = transform_geometry(&scene.footprint, WGS84_SRID, srid)?
            .bbox()
            .ok_or_else(|| {
                IngestionError::descriptor(&scene.prefix, "footprint has no extent")
            })?;

        let mut rasters = Vec::with_capacity(LayerKind::ALL.len());
        for kind in LayerKind::ALL {
            let (bucket, key) = match kind {
                LayerKind::Band(Band::B10) => {
                    (&self.l1c, format!("{}{}.jp2", scene.prefix, kind.name()))
                }
                _ => (
                    &self.l2a,
                    format!(
                        "{}R{}m/{}.jp2",
                        scene.prefix,
                        kind.resolution().meters(),
                        kind.name()
                    ),
                ),
            };

            let raw = dir.join(format!("{}.jp2", kind.name()));
            bucket.download_to(&key, &raw).await?;

            let tif = dir.join(format!("{}.tif", kind.name()));
            self.toolchain
                .to_geotiff(&raw, &tif, srid, Some(&extent))
                .await?;
            tokio::fs::remove_file(&raw).await?;
            rasters.push((kind, tif));
        }

        self.scene_log(scene.id, "Finished L2A product download.")
            .await?;
        Ok(rasters)
    }

    /// Download the L1C product and run atmospheric correction on it.
    async fn run_sen2cor(
        &self,
        scene: &Scene,
        dir: &Path,
        srid: u32,
    ) -> Result<Vec<(LayerKind, PathBuf)>> {
        self.scene_log(scene.id, "Starting download of product data.")
            .await?;
        let product = self.toolchain.download_product(scene, dir).await?;

        self.scene_log(scene.id, "Starting Sen2Cor algorithm.").await?;
        self.toolchain.atmospheric_correction(&product).await?;

        let mut rasters = Vec::with_capacity(LayerKind::ALL.len());
        for kind in LayerKind::ALL {
            // Correction drops the cirrus band, it stays at L1C.
            let source = match kind {
                LayerKind::Band(Band::B10) => {
                    find_granule_file(dir, L1C_PRODUCT_MARKER, kind.name(), None)
                }
                _ => find_granule_file(
                    dir,
                    L2A_PRODUCT_MARKER,
                    kind.name(),
                    Some(kind.resolution().meters()),
                ),
            }
            .ok_or_else(|| IngestionError::MissingOutput(format!("{} granule", kind)))?;

            let tif = dir.join(format!("{}.tif", kind.name()));
            self.toolchain.to_geotiff(&source, &tif, srid, None).await?;
            rasters.push((kind, tif));
        }

        self.scene_log(scene.id, "Finished applying Sen2Cor algorithm.")
            .await?;
        Ok(rasters)
    }

    /// Cut one layer raster into tiles at the layer's max zoom and merge
    /// them into the layer. Returns the number of tiles stored.
    async fn tile_layer(&self, kind: LayerKind, layer_id: i64, path: &Path, srid: u32) -> Result<usize> {
        let bytes = tokio::fs::read(path).await?;
        let raster = tokio::task::spawn_blocking(move || GeoRaster::decode(&bytes))
            .await
            .map_err(|e| IngestionError::Join(e.to_string()))??;
        let raster = Arc::new(raster);

        let zoom = kind.max_zoom();
        let datatype = kind.datatype();
        let coords = {
            let raster = raster.clone();
            tokio::task::spawn_blocking(move || {
                Tiler::new(&raster, srid, datatype).map(|t| t.covering_tiles(zoom))
            })
            .await
            .map_err(|e| IngestionError::Join(e.to_string()))??
        };

        let mut written: Vec<TileCoord> = Vec::new();
        for batch in coords.chunks(self.config.tile_batch.max(1)) {
            let raster = raster.clone();
            let batch = batch.to_vec();
            let rendered = tokio::task::spawn_blocking(move || {
                Tiler::new(&raster, srid, datatype).map(|t| t.render_batch(&batch))
            })
            .await
            .map_err(|e| IngestionError::Join(e.to_string()))??;

            for (coord, tile) in rendered {
                if self.tiles.write(layer_id, &coord, tile, true).await? == WriteOutcome::Written {
                    written.push(coord);
                }
            }
        }

        self.catalog.record_tiles(layer_id, &written).await?;
        counter!("sentinel_tiles_written_total").increment(written.len() as u64);
        Ok(written.len())
    }

    async fn scene_log(&self, scene_id: i64, message: &str) -> std::result::Result<(), SentinelError> {
        self.catalog
            .append_log(LogTable::Scenes, scene_id, message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sentinel_common::{BoundingBox, DataType, Geometry, Polygon, SceneClass};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storage::{GeoTransform, MemoryTileStore};
    use test_utils::{new_scene, utc};

    const ORIGIN: (f64, f64) = (510000.0, 5040000.0);

    /// A 10 km UTM square near Milan holding `value`.
    fn granule(value: u16, datatype: DataType) -> Vec<u8> {
        GeoRaster {
            width: 100,
            height: 100,
            data: vec![value; 100 * 100],
            transform: GeoTransform {
                origin_x: ORIGIN.0,
                origin_y: ORIGIN.1,
                scale_x: 100.0,
                scale_y: 100.0,
            },
            srid: Some(32632),
            nodata: Some(0),
            datatype,
        }
        .encode()
        .unwrap()
    }

    fn layer_granule(kind: LayerKind) -> Vec<u8> {
        match kind {
            LayerKind::SceneClass => granule(SceneClass::Vegetation.code(), DataType::U8),
            LayerKind::Band(band) => granule(1000 + band.index() as u16, DataType::U16),
        }
    }

    /// The granule square reprojected corner by corner, so its UTM extent is
    /// the granule's own.
    fn footprint() -> Geometry {
        let utm = projection::Utm::new(UtmZone::from_srid(32632).unwrap());
        let (x0, y1) = ORIGIN;
        let (x1, y0) = (x0 + 10000.0, y1 - 10000.0);
        let ring = [(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)]
            .iter()
            .map(|&(x, y)| utm.inverse(x, y))
            .collect();
        Geometry::Polygon(Polygon::new(ring))
    }

    /// Writes fake product trees and copies rasters instead of converting them.
    #[derive(Default)]
    struct FakeToolchain {
        downloads: AtomicUsize,
        corrections: AtomicUsize,
        placed: AtomicUsize,
        fail_correction: bool,
    }

    #[async_trait]
    impl RasterToolchain for FakeToolchain {
        async fn download_product(&self, _scene: &Scene, dir: &Path) -> Result<PathBuf> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let product = dir.join("S2B_MSIL1C_20180601T103029_N0206_R108_T32TNR.SAFE");
            let granule_dir = product.join("GRANULE/L1C_T32TNR/IMG_DATA");
            std::fs::create_dir_all(&granule_dir)?;
            std::fs::write(
                granule_dir.join("T32TNR_20180601T103029_B10.jp2"),
                layer_granule(LayerKind::Band(Band::B10)),
            )?;
            Ok(product)
        }

        async fn atmospheric_correction(&self, product: &Path) -> Result<()> {
            self.corrections.fetch_add(1, Ordering::SeqCst);
            if self.fail_correction {
                return Err(IngestionError::Subprocess {
                    command: "L2A_Process".into(),
                    status: Some(1),
                    stderr: "boom".into(),
                });
            }
            let root = product
                .parent()
                .unwrap()
                .join("S2B_MSIL2A_20180601T103029_N9999_R108_T32TNR.SAFE/GRANULE/L2A_T32TNR/IMG_DATA");
            for kind in LayerKind::ALL {
                if kind == LayerKind::Band(Band::B10) {
                    continue;
                }
                let res = kind.resolution().meters();
                let dir = root.join(format!("R{}m", res));
                std::fs::create_dir_all(&dir)?;
                std::fs::write(
                    dir.join(format!("T32TNR_20180601T103029_{}_{}m.jp2", kind.name(), res)),
                    layer_granule(kind),
                )?;
            }
            Ok(())
        }

        async fn to_geotiff(
            &self,
            src: &Path,
            dst: &Path,
            srid: u32,
            bounds: Option<&BoundingBox>,
        ) -> Result<()> {
            assert_eq!(srid, 32632);
            if let Some(b) = bounds {
                self.placed.fetch_add(1, Ordering::SeqCst);
                assert!((b.min_x - ORIGIN.0).abs() < 1.0, "{:?}", b);
                assert!((b.max_y - ORIGIN.1).abs() < 1.0, "{:?}", b);
            }
            tokio::fs::copy(src, dst).await?;
            Ok(())
        }
    }

    struct Setup {
        ingestor: SceneIngestor,
        catalog: Catalog,
        tiles: Arc<MemoryTileStore>,
        l2a: Arc<ObjectStorage>,
        l1c: Arc<ObjectStorage>,
        scene_id: i64,
        prefix: String,
    }

    async fn setup(toolchain: Arc<FakeToolchain>, collected: (i32, u32, u32)) -> Setup {
        let catalog = Catalog::open_memory().await.unwrap();
        let prefix = format!(
            "tiles/32/T/NR/{}/{}/{}/0/",
            collected.0, collected.1, collected.2
        );
        let scene = new_scene(
            &prefix,
            utc(collected.0, collected.1, collected.2, 10),
            footprint(),
        );
        let scene_id = catalog.insert_scene(&scene).await.unwrap().unwrap();

        let tiles = Arc::new(MemoryTileStore::new());
        let l1c = Arc::new(ObjectStorage::in_memory("sentinel-s2-l1c"));
        let l2a = Arc::new(ObjectStorage::in_memory("sentinel-s2-l2a"));
        let ingestor = SceneIngestor::new(
            catalog.clone(),
            tiles.clone(),
            l1c.clone(),
            l2a.clone(),
            toolchain,
            IngestConfig::default(),
        );
        Setup {
            ingestor,
            catalog,
            tiles,
            l2a,
            l1c,
            scene_id,
            prefix,
        }
    }

    async fn publish_l2a(setup: &Setup) {
        let prefix = &setup.prefix;
        setup
            .l2a
            .put(&format!("{}productInfo.json", prefix), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        for kind in LayerKind::ALL {
            let bytes = Bytes::from(layer_granule(kind));
            if kind == LayerKind::Band(Band::B10) {
                setup.l1c.put(&format!("{}B10.jp2", prefix), bytes).await.unwrap();
            } else {
                let key = format!("{}R{}m/{}.jp2", prefix, kind.resolution().meters(), kind.name());
                setup.l2a.put(&key, bytes).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_ingest_from_l2a_bucket() {
        let toolchain = Arc::new(FakeToolchain::default());
        let setup = setup(toolchain.clone(), (2019, 7, 14)).await;
        publish_l2a(&setup).await;

        let outcome = setup.ingestor.ingest(setup.scene_id).await.unwrap();
        let IngestOutcome::Ingested { level, tiles_written } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(level, ProcessingLevel::L2A);
        assert!(tiles_written > 0);
        assert_eq!(toolchain.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(toolchain.placed.load(Ordering::SeqCst), 14);

        let scene = setup.catalog.get_scene(setup.scene_id).await.unwrap();
        assert_eq!(scene.status, SceneStatus::Finished);
        assert!(scene.log.contains("Found existing L2A product"));

        // Every layer is stored at its native zoom only.
        let layers = setup.catalog.scene_layers(setup.scene_id).await.unwrap();
        for (kind, layer_id) in layers.iter() {
            let coords = setup.catalog.tile_coords(layer_id, None).await.unwrap();
            assert!(!coords.is_empty(), "no tiles for {}", kind);
            assert!(coords.iter().all(|c| c.z == kind.max_zoom()));
        }

        let b04 = layers.get(LayerKind::Band(Band::B04));
        let coord = setup.catalog.tile_coords(b04, Some(14)).await.unwrap()[0];
        let tile = setup.tiles.get(b04, &coord).await.unwrap().unwrap();
        assert!(tile.data.iter().all(|&v| v == 0 || v == 1003));
        assert!(tile.data.contains(&1003));
    }

    #[tokio::test]
    async fn test_old_scene_goes_through_sen2cor() {
        let toolchain = Arc::new(FakeToolchain::default());
        let setup = setup(toolchain.clone(), (2018, 6, 1)).await;
        // Even a published product is ignored before the availability date.
        publish_l2a(&setup).await;

        let outcome = setup.ingestor.ingest(setup.scene_id).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ingested { .. }));
        assert_eq!(toolchain.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.corrections.load(Ordering::SeqCst), 1);
        assert_eq!(toolchain.placed.load(Ordering::SeqCst), 0);

        let layers = setup.catalog.scene_layers(setup.scene_id).await.unwrap();
        let scl = layers.get(LayerKind::SceneClass);
        let coords = setup.catalog.tile_coords(scl, Some(13)).await.unwrap();
        let tile = setup.tiles.get(scl, &coords[0]).await.unwrap().unwrap();
        assert_eq!(tile.datatype, DataType::U8);
        assert!(tile.data.contains(&SceneClass::Vegetation.code()));
    }

    #[tokio::test]
    async fn test_failed_correction_marks_scene_failed() {
        let toolchain = Arc::new(FakeToolchain {
            fail_correction: true,
            ..FakeToolchain::default()
        });
        let setup = setup(toolchain, (2018, 6, 1)).await;

        let err = setup.ingestor.ingest(setup.scene_id).await.unwrap_err();
        assert!(matches!(err, IngestionError::Subprocess { .. }));

        let scene = setup.catalog.get_scene(setup.scene_id).await.unwrap();
        assert_eq!(scene.status, SceneStatus::Failed);
        assert_eq!(scene.retry_count, 1);
        assert!(setup.tiles.is_empty().await);
    }

    #[tokio::test]
    async fn test_finished_scene_is_skipped() {
        let toolchain = Arc::new(FakeToolchain::default());
        let setup = setup(toolchain.clone(), (2019, 7, 14)).await;
        setup
            .catalog
            .set_scene_status(setup.scene_id, SceneStatus::Finished)
            .await
            .unwrap();

        let outcome = setup.ingestor.ingest(setup.scene_id).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Skipped(SceneStatus::Finished));
        assert_eq!(toolchain.downloads.load(Ordering::SeqCst), 0);

        let scene = setup.catalog.get_scene(setup.scene_id).await.unwrap();
        assert!(scene.log.contains("aborted additional ingestion"));
    }

    #[tokio::test]
    async fn test_missing_l2a_granule_fails() {
        let toolchain = Arc::new(FakeToolchain::default());
        let setup = setup(toolchain, (2019, 7, 14)).await;
        setup
            .l2a
            .put(&format!("{}productInfo.json", setup.prefix), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let err = setup.ingestor.ingest(setup.scene_id).await.unwrap_err();
        assert!(matches!(err, IngestionError::Core(SentinelError::NotFound(_))));
        let scene = setup.catalog.get_scene(setup.scene_id).await.unwrap();
        assert_eq!(scene.status, SceneStatus::Failed);
    }
}
