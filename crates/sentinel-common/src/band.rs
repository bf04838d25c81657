//! Sentinel-2 spectral bands and the per-layer raster properties derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ZOOM_10M, ZOOM_20M, ZOOM_60M};

/// Native ground sampling of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    R10,
    R20,
    R60,
}

impl Resolution {
    pub fn meters(&self) -> u32 {
        match self {
            Resolution::R10 => 10,
            Resolution::R20 => 20,
            Resolution::R60 => 60,
        }
    }

    /// Zoom level at which bands of this resolution are stored.
    pub fn zoom(&self) -> u32 {
        match self {
            Resolution::R10 => ZOOM_10M,
            Resolution::R20 => ZOOM_20M,
            Resolution::R60 => ZOOM_60M,
        }
    }

    /// Bands with this native resolution, in canonical order.
    pub fn bands(&self) -> &'static [Band] {
        match self {
            Resolution::R10 => &[Band::B02, Band::B03, Band::B04, Band::B08],
            Resolution::R20 => &[
                Band::B05,
                Band::B06,
                Band::B07,
                Band::B8A,
                Band::B11,
                Band::B12,
            ],
            Resolution::R60 => &[Band::B01, Band::B09, Band::B10],
        }
    }
}

/// One of the 13 Sentinel-2 MSI bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Band {
    B01,
    B02,
    B03,
    B04,
    B05,
    B06,
    B07,
    B08,
    B8A,
    B09,
    B10,
    B11,
    B12,
}

impl Band {
    /// All bands in canonical order.
    pub const ALL: [Band; 13] = [
        Band::B01,
        Band::B02,
        Band::B03,
        Band::B04,
        Band::B05,
        Band::B06,
        Band::B07,
        Band::B08,
        Band::B8A,
        Band::B09,
        Band::B10,
        Band::B11,
        Band::B12,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Band::B01 => "B01",
            Band::B02 => "B02",
            Band::B03 => "B03",
            Band::B04 => "B04",
            Band::B05 => "B05",
            Band::B06 => "B06",
            Band::B07 => "B07",
            Band::B08 => "B08",
            Band::B8A => "B8A",
            Band::B09 => "B09",
            Band::B10 => "B10",
            Band::B11 => "B11",
            Band::B12 => "B12",
        }
    }

    pub fn from_name(name: &str) -> Option<Band> {
        let name = name.trim_end_matches(".jp2");
        Band::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// Position of the band in [`Band::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            Band::B02 | Band::B03 | Band::B04 | Band::B08 => Resolution::R10,
            Band::B05 | Band::B06 | Band::B07 | Band::B8A | Band::B11 | Band::B12 => {
                Resolution::R20
            }
            Band::B01 | Band::B09 | Band::B10 => Resolution::R60,
        }
    }

    /// File name of the band granule in the public buckets.
    pub fn file_name(&self) -> String {
        format!("{}.jp2", self.name())
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel datatype of a stored layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    U8,
    U16,
}

impl DataType {
    /// GDAL datatype code, as persisted in the tile index.
    pub fn code(&self) -> i64 {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DataType::U8),
            2 => Some(DataType::U16),
            _ => None,
        }
    }
}

/// What a layer holds: one spectral band or the scene-class mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerKind {
    Band(Band),
    SceneClass,
}

impl LayerKind {
    /// The 13 bands followed by the scene-class, the full set of layers a
    /// scene or composite owns.
    pub const ALL: [LayerKind; 14] = [
        LayerKind::Band(Band::B01),
        LayerKind::Band(Band::B02),
        LayerKind::Band(Band::B03),
        LayerKind::Band(Band::B04),
        LayerKind::Band(Band::B05),
        LayerKind::Band(Band::B06),
        LayerKind::Band(Band::B07),
        LayerKind::Band(Band::B08),
        LayerKind::Band(Band::B8A),
        LayerKind::Band(Band::B09),
        LayerKind::Band(Band::B10),
        LayerKind::Band(Band::B11),
        LayerKind::Band(Band::B12),
        LayerKind::SceneClass,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Band(band) => band.name(),
            LayerKind::SceneClass => "SCL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name == "SCL" {
            return Some(LayerKind::SceneClass);
        }
        Band::from_name(name).map(LayerKind::Band)
    }

    /// Position in [`LayerKind::ALL`].
    pub fn index(&self) -> usize {
        match self {
            LayerKind::Band(band) => band.index(),
            LayerKind::SceneClass => 13,
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            LayerKind::Band(band) => band.resolution(),
            LayerKind::SceneClass => Resolution::R20,
        }
    }

    /// Finest zoom level at which the layer is materialized for a scene.
    pub fn max_zoom(&self) -> u32 {
        self.resolution().zoom()
    }

    pub fn datatype(&self) -> DataType {
        match self {
            LayerKind::Band(_) => DataType::U16,
            LayerKind::SceneClass => DataType::U8,
        }
    }

    /// Categorical layers aggregate by mode, numeric layers by mean.
    pub fn is_categorical(&self) -> bool {
        matches!(self, LayerKind::SceneClass)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
