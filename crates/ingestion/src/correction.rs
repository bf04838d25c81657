//! External raster tools: product download, atmospheric correction and
//! rewriting granules as canonical GeoTIFFs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use sentinel_common::{BoundingBox, SENTINEL_NODATA};
use storage::Scene;

use crate::error::{IngestionError, Result};

/// Marker of L1C product directories (`S2A_MSIL1C_....SAFE`).
pub const L1C_PRODUCT_MARKER: &str = "_MSIL1C";
/// Marker of L2A product directories written by the correction tool.
pub const L2A_PRODUCT_MARKER: &str = "_MSIL2A";

const STDERR_TAIL_LINES: usize = 20;

/// Subprocess seam of the ingestor.
#[async_trait]
pub trait RasterToolchain: Send + Sync {
    /// Download the L1C product of a scene into `dir`. Returns the path of
    /// the `.SAFE` product directory.
    async fn download_product(&self, scene: &Scene, dir: &Path) -> Result<PathBuf>;

    /// Run atmospheric correction on an L1C product. The L2A product is
    /// written next to it.
    async fn atmospheric_correction(&self, product: &Path) -> Result<()>;

    /// Rewrite `src` as a deflate GeoTIFF in EPSG:`srid`. When `bounds` is
    /// given the raster is placed at those UTM bounds, replacing whatever
    /// georeferencing the source carried.
    async fn to_geotiff(
        &self,
        src: &Path,
        dst: &Path,
        srid: u32,
        bounds: Option<&BoundingBox>,
    ) -> Result<()>;
}

/// Binaries used by [`SubprocessToolchain`].
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub sen2cor_binary: String,
    /// Either an executable or a `.jar` run through `java -jar`
    pub product_download_binary: String,
    pub gdal_translate_binary: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            sen2cor_binary: "L2A_Process".to_string(),
            product_download_binary: "ProductDownload".to_string(),
            gdal_translate_binary: "gdal_translate".to_string(),
        }
    }
}

/// Runs the tools as child processes.
#[derive(Debug, Clone, Default)]
pub struct SubprocessToolchain {
    config: ToolchainConfig,
}

impl SubprocessToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    fn product_download_command(&self) -> Command {
        let binary = &self.config.product_download_binary;
        if binary.ends_with(".jar") {
            let mut command = Command::new("java");
            command.arg("-jar").arg(binary);
            command
        } else {
            Command::new(binary)
        }
    }
}

/// Run a command to completion, turning a non-zero exit into an error that
/// carries the tail of stderr.
async fn run(mut command: Command, name: &str) -> Result<()> {
    debug!(command = ?command, "Running subprocess");
    let output = command.kill_on_drop(true).output().await.map_err(|e| {
        IngestionError::Subprocess {
            command: name.to_string(),
            status: None,
            stderr: e.to_string(),
        }
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Err(IngestionError::Subprocess {
        command: name.to_string(),
        status: output.status.code(),
        stderr: lines[start..].join("\n"),
    })
}

#[async_trait]
impl RasterToolchain for SubprocessToolchain {
    #[instrument(skip(self, scene), fields(scene = scene.id, mgrs = %scene.mgrs()))]
    async fn download_product(&self, scene: &Scene, dir: &Path) -> Result<PathBuf> {
        let day = scene.collected_at.date_naive().to_string();
        let mut command = self.product_download_command();
        command
            .args(["--sensor", "S2", "--aws", "--out"])
            .arg(dir)
            .args(["--store", "AWS", "--limit", "1", "--tiles"])
            .arg(scene.mgrs())
            .args(["--start", &day, "--end", &day]);
        run(command, "product download").await?;

        find_product(dir, L1C_PRODUCT_MARKER)
            .ok_or_else(|| IngestionError::MissingOutput(format!("{}/*.SAFE", dir.display())))
    }

    #[instrument(skip(self))]
    async fn atmospheric_correction(&self, product: &Path) -> Result<()> {
        info!("Starting atmospheric correction");
        let mut command = Command::new(&self.config.sen2cor_binary);
        command.arg(product);
        if let Some(parent) = product.parent() {
            command.current_dir(parent);
        }
        run(command, &self.config.sen2cor_binary).await
    }

    async fn to_geotiff(
        &self,
        src: &Path,
        dst: &Path,
        srid: u32,
        bounds: Option<&BoundingBox>,
    ) -> Result<()> {
        let mut command = Command::new(&self.config.gdal_translate_binary);
        command
            .args(["-q", "-of", "GTiff", "-co", "COMPRESS=DEFLATE"])
            .arg("-a_srs")
            .arg(format!("EPSG:{}", srid))
            .arg("-a_nodata")
            .arg(SENTINEL_NODATA.to_string());
        if let Some(b) = bounds {
            command
                .arg("-a_ullr")
                .arg(b.min_x.to_string())
                .arg(b.max_y.to_string())
                .arg(b.max_x.to_string())
                .arg(b.min_y.to_string());
        }
        command.arg(src).arg(dst);
        run(command, &self.config.gdal_translate_binary).await
    }
}

/// First `S2*{marker}*.SAFE` directory directly under `dir`.
pub fn find_product(dir: &Path, marker: &str) -> Option<PathBuf> {
    let mut products: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| is_product_dir(&e.file_name().to_string_lossy(), marker))
        .map(|e| e.into_path())
        .collect();
    products.sort();
    products.into_iter().next()
}

fn is_product_dir(name: &str, marker: &str) -> bool {
    name.starts_with("S2") && name.contains(marker) && name.ends_with(".SAFE")
}

/// Locate a granule file inside the products under `dir`.
///
/// Only files below a `GRANULE` directory of a product carrying `marker`
/// are considered. With a resolution the file name must match
/// `*{name}*{resolution}m.jp2` (the L2A layout), without one it must end in
/// `{name}.jp2` (the L1C layout).
pub fn find_granule_file(
    dir: &Path,
    marker: &str,
    name: &str,
    resolution: Option<u32>,
) -> Option<PathBuf> {
    let suffix = match resolution {
        Some(res) => format!("{}m.jp2", res),
        None => format!("{}.jp2", name),
    };

    let mut matches: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let file_name = e.file_name().to_string_lossy();
            file_name.ends_with(&suffix) && file_name.contains(name)
        })
        .filter(|e| {
            let path = e.path();
            let in_product = path.ancestors().any(|a| {
                a.file_name()
                    .map(|n| is_product_dir(&n.to_string_lossy(), marker))
                    .unwrap_or(false)
            });
            let in_granule = path
                .ancestors()
                .any(|a| a.file_name().map(|n| n == "GRANULE").unwrap_or(false));
            in_product && in_granule
        })
        .map(|e| e.into_path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"jp2").unwrap();
    }

    fn product_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let l2a = dir
            .path()
            .join("S2B_MSIL2A_20190714T103029_N9999_R108_T32TNR_20190714T150000.SAFE/GRANULE/L2A_T32TNR/IMG_DATA");
        touch(&l2a.join("R10m/T32TNR_20190714T103029_B02_10m.jp2"));
        touch(&l2a.join("R20m/T32TNR_20190714T103029_B02_20m.jp2"));
        touch(&l2a.join("R20m/T32TNR_20190714T103029_SCL_20m.jp2"));
        touch(&l2a.join("R60m/T32TNR_20190714T103029_B01_60m.jp2"));

        let l1c = dir
            .path()
            .join("S2B_MSIL1C_20190714T103029_N0208_R108_T32TNR_20190714T131219.SAFE/GRANULE/L1C_T32TNR/IMG_DATA");
        touch(&l1c.join("T32TNR_20190714T103029_B10.jp2"));
        touch(&l1c.join("T32TNR_20190714T103029_B02.jp2"));
        dir
    }

    #[test]
    fn test_find_product() {
        let dir = product_tree();
        let product = find_product(dir.path(), L1C_PRODUCT_MARKER).unwrap();
        assert!(product.to_string_lossy().ends_with("T131219.SAFE"));
        assert!(find_product(&dir.path().join("missing"), L1C_PRODUCT_MARKER).is_none());
    }

    #[test]
    fn test_find_l2a_band_by_resolution() {
        let dir = product_tree();
        let b02 = find_granule_file(dir.path(), L2A_PRODUCT_MARKER, "B02", Some(10)).unwrap();
        assert!(b02.ends_with("R10m/T32TNR_20190714T103029_B02_10m.jp2"));

        let scl = find_granule_file(dir.path(), L2A_PRODUCT_MARKER, "SCL", Some(20)).unwrap();
        assert!(scl.to_string_lossy().contains("_SCL_20m"));

        assert!(find_granule_file(dir.path(), L2A_PRODUCT_MARKER, "B09", Some(60)).is_none());
    }

    #[test]
    fn test_find_l1c_band() {
        let dir = product_tree();
        let b10 = find_granule_file(dir.path(), L1C_PRODUCT_MARKER, "B10", None).unwrap();
        assert!(b10.to_string_lossy().contains("MSIL1C"));
        assert!(b10.ends_with("T32TNR_20190714T103029_B10.jp2"));
    }

    #[tokio::test]
    async fn test_failed_subprocess_reports_status() {
        let toolchain = SubprocessToolchain::new(ToolchainConfig {
            sen2cor_binary: "false".to_string(),
            ..ToolchainConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let err = toolchain
            .atmospheric_correction(&dir.path().join("product.SAFE"))
            .await
            .unwrap_err();
        match err {
            IngestionError::Subprocess { status, .. } => assert_eq!(status, Some(1)),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
