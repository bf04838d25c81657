//! Persisted entities: scenes, composites and the build bookkeeping around them.
//!
//! Entities refer to each other by numeric id and are looked up through the
//! [`Catalog`](crate::Catalog).

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use sentinel_common::{Geometry, LayerKind, TileCoord};

/// Format a domain log entry: `[YYYY-mm-dd HH:MM:SS] message\n`.
pub fn log_entry(message: &str) -> String {
    format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message)
}

/// Processing state of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneStatus {
    Unprocessed,
    Pending,
    Processing,
    Finished,
    Failed,
    Broken,
}

impl SceneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Broken => "broken",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            "broken" => Self::Broken,
            _ => Self::Unprocessed,
        }
    }

    /// Whether the scene no longer blocks a build.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Finished | Self::Broken)
    }
}

/// Processing level of the stored bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingLevel {
    /// Top-of-atmosphere reflectance
    L1C,
    /// Bottom-of-atmosphere reflectance, atmospherically corrected
    L2A,
}

impl ProcessingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1C => "L1C",
            Self::L2A => "L2A",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "L2A" => Self::L2A,
            _ => Self::L1C,
        }
    }
}

/// State of one unit of compositing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeTileStatus {
    Unprocessed,
    Pending,
    Processing,
    Finished,
    Failed,
}

impl CompositeTileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            _ => Self::Unprocessed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    Unprocessed,
    Pending,
    IngestingScenes,
    BuildingTiles,
    Finished,
    Failed,
    Cleared,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Pending => "pending",
            Self::IngestingScenes => "ingesting_scenes",
            Self::BuildingTiles => "building_tiles",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cleared => "cleared",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "ingesting_scenes" => Self::IngestingScenes,
            "building_tiles" => Self::BuildingTiles,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            "cleared" => Self::Cleared,
            _ => Self::Unprocessed,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::IngestingScenes | Self::BuildingTiles)
    }
}

/// State of a registry sync for one UTM zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParseStatus {
    Pending,
    Processing,
    Finished,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Layer ids of the 13 bands and the scene-class, indexed by [`LayerKind::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSet {
    pub ids: [i64; 14],
}

impl LayerSet {
    pub fn get(&self, kind: LayerKind) -> i64 {
        self.ids[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerKind, i64)> + '_ {
        LayerKind::ALL.iter().map(move |kind| (*kind, self.get(*kind)))
    }
}

/// A scene as registered from its `tileInfo.json` descriptor.
#[derive(Debug, Clone)]
pub struct NewScene {
    /// Object-store key prefix, e.g. `tiles/32/T/MR/2019/7/14/0/`
    pub prefix: String,
    pub utm_zone: u8,
    pub latitude_band: String,
    pub grid_square: String,
    pub collected_at: DateTime<Utc>,
    pub cloudiness_percentage: f64,
    pub data_coverage_percentage: f64,
    /// Granule footprint in EPSG:4326
    pub footprint: Geometry,
    /// Area with valid pixels in EPSG:4326
    pub data_geometry: Option<Geometry>,
    pub sun_azimuth: f64,
    pub sun_altitude: f64,
    pub datastrip_id: String,
    pub product_name: String,
}

impl NewScene {
    pub fn mgrs(&self) -> String {
        format!("{}{}{}", self.utm_zone, self.latitude_band, self.grid_square)
    }
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub id: i64,
    pub prefix: String,
    pub utm_zone: u8,
    pub latitude_band: String,
    pub grid_square: String,
    pub collected_at: DateTime<Utc>,
    pub cloudiness_percentage: f64,
    pub data_coverage_percentage: f64,
    pub footprint: Geometry,
    pub data_geometry: Option<Geometry>,
    pub sun_azimuth: f64,
    pub sun_altitude: f64,
    pub datastrip_id: String,
    pub product_name: String,
    pub level: ProcessingLevel,
    pub status: SceneStatus,
    pub retry_count: u32,
    pub log: String,
}

impl Scene {
    /// MGRS grid-square code, e.g. `32TMR`.
    pub fn mgrs(&self) -> String {
        format!("{}{}{}", self.utm_zone, self.latitude_band, self.grid_square)
    }

    /// Geometry used for spatial selection: the data footprint when known.
    pub fn coverage(&self) -> &Geometry {
        self.data_geometry.as_ref().unwrap_or(&self.footprint)
    }
}

/// How a composite's date window lines up with the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeInterval {
    Monthly,
    Weekly,
    Custom,
}

impl CompositeInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "MONTHLY",
            Self::Weekly => "WEEKLY",
            Self::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewComposite {
    pub name: String,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub max_cloudiness: f64,
    /// Explicit scene allow-list; replaces the window and cloud filters.
    pub scene_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone)]
pub struct Composite {
    pub id: i64,
    pub name: String,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub max_cloudiness: f64,
    pub scene_ids: Option<Vec<i64>>,
    pub created_at: DateTime<Utc>,
}

impl Composite {
    pub fn interval(&self) -> CompositeInterval {
        interval_of(self.min_date, self.max_date)
    }
}

pub fn interval_of(min_date: NaiveDate, max_date: NaiveDate) -> CompositeInterval {
    let month_end = last_day_of_month(min_date);
    if min_date.day() == 1 && Some(max_date) == month_end {
        return CompositeInterval::Monthly;
    }
    if min_date.weekday() == Weekday::Mon
        && max_date.weekday() == Weekday::Sun
        && (max_date - min_date).num_days() == 6
    {
        return CompositeInterval::Weekly;
    }
    CompositeInterval::Custom
}

fn last_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.pred_opt())
}

/// One coarse tile of compositing work.
#[derive(Debug, Clone)]
pub struct CompositeTile {
    pub id: i64,
    pub composite_id: i64,
    pub coord: TileCoord,
    pub status: CompositeTileStatus,
    /// Scorer reference copied from the build at dispatch time
    pub scorer: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: String,
}

#[derive(Debug, Clone)]
pub struct CompositeBuild {
    pub id: i64,
    pub composite_id: i64,
    /// Region of interest in EPSG:4326
    pub aoi: Geometry,
    pub scorer: Option<String>,
    pub status: BuildStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: String,
}

/// Record of one registry sync.
#[derive(Debug, Clone)]
pub struct ParseLog {
    pub id: i64,
    pub utm_zone: String,
    pub status: ParseStatus,
    pub scenes_created: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: String,
}
