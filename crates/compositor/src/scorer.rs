//! Per-pixel cloud scoring of scene stacks.
//!
//! A score ranks the pixels of one stack against the same pixels of other
//! stacks: lower is preferred, and anything at or above [`EXCLUDE`] must never
//! be selected.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use sentinel_common::tile::TILE_PIXELS;
use sentinel_common::{Band, SceneClass};

use crate::error::{CompositorError, Result};
use crate::stack::Stack;

/// Score of pixels that must not be selected.
pub const EXCLUDE: f64 = 99.0;

/// Rule set used when a composite tile names no scorer.
pub const LATEST_RULES_VERSION: u32 = 7;

/// Cirrus values are clipped to this before being used as a tie-breaker.
const CIRRUS_CLIP: f64 = 9999.0;

/// Scores every pixel of a stack.
pub trait Scorer: Send + Sync {
    /// Reference under which the scorer is recorded on a composite tile.
    fn name(&self) -> String;

    /// One score per pixel, row-major.
    fn score(&self, stack: &Stack) -> Result<Vec<f64>>;
}

/// Scene-class ranks, indexed by class code. Within similarly desirable
/// classes the rank is flat so that NDVI decides.
const SCENE_CLASS_RANK: [f64; SceneClass::COUNT] = [
    8.0, // no data
    7.0, // saturated or defective
    5.0, // dark area
    5.0, // cloud shadow
    1.0, // vegetation
    2.0, // not vegetated
    3.0, // water
    5.0, // unclassified
    6.0, // cloud medium probability
    7.0, // cloud high probability
    6.0, // thin cirrus
    4.0, // snow
];

/// Scene-class rank plus inverted NDVI in the hundredths.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScorer;

impl RuleBasedScorer {
    pub fn rank(code: u16) -> f64 {
        SCENE_CLASS_RANK
            .get(code as usize)
            .copied()
            .unwrap_or(SCENE_CLASS_RANK[0])
    }
}

/// (B08 - B04) / (B08 + B04), with a zero denominator replaced by one.
pub fn ndvi(b04: u16, b08: u16) -> f64 {
    let red = b04 as f64;
    let nir = b08 as f64;
    let sum = nir + red;
    let sum = if sum == 0.0 { 1.0 } else { sum };
    (nir - red) / sum
}

impl Scorer for RuleBasedScorer {
    fn name(&self) -> String {
        format!("rules:v{}", LATEST_RULES_VERSION)
    }

    fn score(&self, stack: &Stack) -> Result<Vec<f64>> {
        let scl = stack.scene_class();
        let b04 = stack.band(Band::B04);
        let b08 = stack.band(Band::B08);
        let nodata = stack.nodata_mask();

        Ok((0..TILE_PIXELS)
            .map(|i| {
                if nodata[i] {
                    return EXCLUDE;
                }
                Self::rank(scl[i]) + (1.0 - ndvi(b04[i], b08[i])) / 100.0
            })
            .collect())
    }
}

/// A linear multi-class model over a subset of bands.
///
/// Each class has one coefficient row; the predicted class is the one with
/// the largest decision value and its label is used as the pixel's rank.
/// The cirrus band is added in the decimal range as a tie-breaker.
///
/// Serialized as
/// `{"bands": ["B02", ...], "classes": [1.0, 5.0], "coefficients": [[...], [...]], "intercepts": [..]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearClassifier {
    #[serde(skip)]
    name: String,
    bands: Vec<String>,
    classes: Vec<f64>,
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
    #[serde(skip)]
    band_index: Vec<Band>,
}

impl LinearClassifier {
    pub fn from_json(name: &str, json: &str) -> Result<Self> {
        let mut clf: LinearClassifier =
            serde_json::from_str(json).map_err(|e| CompositorError::Classifier {
                path: name.to_string(),
                reason: e.to_string(),
            })?;
        clf.name = name.to_string();
        clf.validate()?;
        Ok(clf)
    }

    fn validate(&mut self) -> Result<()> {
        self.band_index = self
            .bands
            .iter()
            .map(|name| {
                Band::from_name(name).ok_or_else(|| {
                    CompositorError::config(format!(
                        "classifier '{}' expects band '{}' which scenes do not carry",
                        self.name, name
                    ))
                })
            })
            .collect::<Result<_>>()?;

        if self.classes.is_empty()
            || self.coefficients.len() != self.classes.len()
            || self.intercepts.len() != self.classes.len()
        {
            return Err(CompositorError::config(format!(
                "classifier '{}' has {} classes, {} coefficient rows and {} intercepts",
                self.name,
                self.classes.len(),
                self.coefficients.len(),
                self.intercepts.len()
            )));
        }
        if let Some(row) = self.coefficients.iter().find(|r| r.len() != self.bands.len()) {
            return Err(CompositorError::config(format!(
                "classifier '{}' coefficient row has {} weights for {} bands",
                self.name,
                row.len(),
                self.bands.len()
            )));
        }
        Ok(())
    }

    /// Label of the class predicted for one band vector.
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut best = 0;
        let mut best_value = f64::NEG_INFINITY;
        for (class, (row, intercept)) in self.coefficients.iter().zip(&self.intercepts).enumerate() {
            let value = intercept + row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>();
            if value > best_value {
                best = class;
                best_value = value;
            }
        }
        self.classes[best]
    }
}

impl Scorer for LinearClassifier {
    fn name(&self) -> String {
        format!("classifier:{}", self.name)
    }

    fn score(&self, stack: &Stack) -> Result<Vec<f64>> {
        let bands: Vec<&[u16]> = self.band_index.iter().map(|b| stack.band(*b)).collect();
        let cirrus = stack.band(Band::B10);
        let nodata = stack.nodata_mask();

        let mut features = vec![0.0; bands.len()];
        let mut scores = Vec::with_capacity(TILE_PIXELS);
        for i in 0..TILE_PIXELS {
            if nodata[i] {
                scores.push(EXCLUDE);
                continue;
            }
            for (f, band) in features.iter_mut().zip(&bands) {
                *f = band[i] as f64;
            }
            let predicted = self.predict(&features);
            scores.push(predicted + (cirrus[i] as f64).clamp(0.0, CIRRUS_CLIP) / 10000.0);
        }
        Ok(scores)
    }
}

/// Resolves the scorer reference stored on a composite tile.
///
/// References: none or `rules:v7` for the rule-based scorer,
/// `classifier:{name}` for a registered classifier.
#[derive(Default, Clone)]
pub struct ScorerRegistry {
    classifiers: HashMap<String, Arc<LinearClassifier>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, classifier: LinearClassifier) {
        self.classifiers
            .insert(classifier.name.clone(), Arc::new(classifier));
    }

    /// Register every `*.json` classifier in `dir`, named after the file stem.
    /// Files that fail to load are skipped with a warning.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in WalkDir::new(dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let json = std::fs::read_to_string(path).map_err(|e| CompositorError::Classifier {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            match LinearClassifier::from_json(&name, &json) {
                Ok(classifier) => {
                    self.register(classifier);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping classifier"),
            }
        }
        info!(dir = %dir.display(), loaded, "Loaded classifiers");
        Ok(loaded)
    }

    pub fn resolve(&self, reference: Option<&str>) -> Result<Arc<dyn Scorer>> {
        let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(Arc::new(RuleBasedScorer));
        };

        if let Some(version) = reference.strip_prefix("rules:") {
            let version = version.trim_start_matches('v');
            return match version.parse::<u32>() {
                Ok(LATEST_RULES_VERSION) => Ok(Arc::new(RuleBasedScorer)),
                _ => Err(CompositorError::config(format!(
                    "rule set '{}' is not implemented",
                    reference
                ))),
            };
        }

        if let Some(name) = reference.strip_prefix("classifier:") {
            return self
                .classifiers
                .get(name)
                .cloned()
                .map(|c| c as Arc<dyn Scorer>)
                .ok_or_else(|| {
                    CompositorError::config(format!("no classifier loaded for '{}'", reference))
                });
        }

        Err(CompositorError::config(format!(
            "unknown scorer reference '{}'",
            reference
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::DataType;
    use test_utils::{constant_tile, SyntheticScene};

    fn stack(scene: SyntheticScene) -> Stack {
        Stack::from_tiles(1, scene.tiles).unwrap()
    }

    const CLOUD_CLASSIFIER: &str = r#"{
        "bands": ["B02", "B10"],
        "classes": [1.0, 5.0],
        "coefficients": [[-0.001, 0.0], [0.001, 0.0]],
        "intercepts": [1.0, -1.0]
    }"#;

    #[test]
    fn test_ndvi() {
        assert!((ndvi(1000, 2000) - 1.0 / 3.0).abs() < 1e-12);
        assert!((ndvi(1000, 4000) - 0.6).abs() < 1e-12);
        assert_eq!(ndvi(0, 0), 0.0);
    }

    #[test]
    fn test_rule_ranks() {
        assert_eq!(RuleBasedScorer::rank(SceneClass::Vegetation.code()), 1.0);
        assert_eq!(RuleBasedScorer::rank(SceneClass::CloudHighProbability.code()), 7.0);
        assert_eq!(RuleBasedScorer::rank(SceneClass::ThinCirrus.code()), 6.0);
        assert_eq!(RuleBasedScorer::rank(SceneClass::Snow.code()), 4.0);
        assert_eq!(RuleBasedScorer::rank(200), 8.0);
    }

    #[test]
    fn test_rule_score_adds_inverted_ndvi() {
        let scene = SyntheticScene::uniform(500, SceneClass::Vegetation)
            .with_band(Band::B04, constant_tile(1000, DataType::U16))
            .with_band(Band::B08, constant_tile(4000, DataType::U16));
        let scores = RuleBasedScorer.score(&stack(scene)).unwrap();
        assert!((scores[0] - (1.0 + 0.4 / 100.0)).abs() < 1e-12);
        assert!(scores.iter().all(|&s| s == scores[0]));
    }

    #[test]
    fn test_nodata_pixels_score_exclude() {
        let mut b02 = constant_tile(500, DataType::U16);
        b02.data[5] = 0;
        let scene = SyntheticScene::uniform(500, SceneClass::Vegetation).with_band(Band::B02, b02);
        let scores = RuleBasedScorer.score(&stack(scene)).unwrap();
        assert_eq!(scores[5], EXCLUDE);
        assert!(scores[6] < 2.0);
    }

    #[test]
    fn test_classifier_prediction_with_cirrus_tie_break() {
        let clf = LinearClassifier::from_json("cloud", CLOUD_CLASSIFIER).unwrap();
        // Dark pixel: class 1. Bright pixel: class 5.
        assert_eq!(clf.predict(&[500.0, 0.0]), 1.0);
        assert_eq!(clf.predict(&[5000.0, 0.0]), 5.0);

        let scene = SyntheticScene::uniform(500, SceneClass::Vegetation)
            .with_band(Band::B10, constant_tile(20000, DataType::U16));
        let scores = clf.score(&stack(scene)).unwrap();
        assert!((scores[0] - (1.0 + 0.9999)).abs() < 1e-9);
    }

    #[test]
    fn test_classifier_with_unknown_band_is_config_error() {
        let json = CLOUD_CLASSIFIER.replace("B10", "B13");
        let err = LinearClassifier::from_json("cloud", &json).unwrap_err();
        assert!(matches!(err, CompositorError::Config(_)));
    }

    #[test]
    fn test_resolve() {
        let mut registry = ScorerRegistry::new();
        registry.register(LinearClassifier::from_json("cloud", CLOUD_CLASSIFIER).unwrap());

        assert_eq!(registry.resolve(None).unwrap().name(), "rules:v7");
        assert_eq!(registry.resolve(Some("rules:v7")).unwrap().name(), "rules:v7");
        assert_eq!(
            registry.resolve(Some("classifier:cloud")).unwrap().name(),
            "classifier:cloud"
        );
        assert!(matches!(
            registry.resolve(Some("rules:v3")),
            Err(CompositorError::Config(_))
        ));
        assert!(registry.resolve(Some("classifier:missing")).is_err());
        assert!(registry.resolve(Some("magic")).is_err());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cloud.json"), CLOUD_CLASSIFIER).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = ScorerRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 1);
        assert!(registry.resolve(Some("classifier:cloud")).is_ok());
    }
}
