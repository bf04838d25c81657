//! Scene registration and ingestion.
//!
//! The [`SceneRegistry`] walks the public L1C bucket and records one catalog
//! row per scene. The [`SceneIngestor`] turns a registered scene into tiled
//! band and scene-class layers at L2A processing level, either by downloading
//! an existing L2A product or by running atmospheric correction on the L1C
//! product.

pub mod correction;
pub mod error;
pub mod ingester;
pub mod registry;
pub mod sun;
pub mod tileinfo;
pub mod tiler;

pub use correction::{RasterToolchain, SubprocessToolchain, ToolchainConfig};
pub use error::{IngestionError, Result};
pub use ingester::{IngestConfig, IngestOutcome, SceneIngestor};
pub use registry::{DriveSummary, SceneRegistry, SyncOutcome};
pub use tileinfo::TileInfo;
