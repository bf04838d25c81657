//! Sentinel-2 L2A scene classification (SCL) codes.

use serde::{Deserialize, Serialize};

/// Per-pixel categorical class assigned by atmospheric correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SceneClass {
    NoData = 0,
    SaturatedOrDefective = 1,
    DarkAreaPixels = 2,
    CloudShadows = 3,
    Vegetation = 4,
    NotVegetated = 5,
    Water = 6,
    Unclassified = 7,
    CloudMediumProbability = 8,
    CloudHighProbability = 9,
    ThinCirrus = 10,
    Snow = 11,
}

impl SceneClass {
    pub const COUNT: usize = 12;

    pub fn from_code(code: u16) -> Option<Self> {
        use SceneClass::*;
        Some(match code {
            0 => NoData,
            1 => SaturatedOrDefective,
            2 => DarkAreaPixels,
            3 => CloudShadows,
            4 => Vegetation,
            5 => NotVegetated,
            6 => Water,
            7 => Unclassified,
            8 => CloudMediumProbability,
            9 => CloudHighProbability,
            10 => ThinCirrus,
            11 => Snow,
            _ => return None,
        })
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn is_cloud(&self) -> bool {
        matches!(
            self,
            SceneClass::CloudMediumProbability
                | SceneClass::CloudHighProbability
                | SceneClass::ThinCirrus
        )
    }

    pub fn label(&self) -> &'static str {
        use SceneClass::*;
        match self {
            NoData => "NO_DATA",
            SaturatedOrDefective => "SATURATED_OR_DEFECTIVE",
            DarkAreaPixels => "DARK_AREA_PIXELS",
            CloudShadows => "CLOUD_SHADOWS",
            Vegetation => "VEGETATION",
            NotVegetated => "NOT_VEGETATED",
            Water => "WATER",
            Unclassified => "UNCLASSIFIED",
            CloudMediumProbability => "CLOUD_MEDIUM_PROBABILITY",
            CloudHighProbability => "CLOUD_HIGH_PROBABILITY",
            ThinCirrus => "THIN_CIRRUS",
            Snow => "SNOW",
        }
    }
}
