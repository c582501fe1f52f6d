//! Input feature source.
//!
//! Features are read once at the start of a run and never mutated. Label
//! fields are free-form strings carried through to the output tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ZonalError;
use crate::geometry::PolygonGeometry;

/// One input polygon feature. `fid` is stable and unique within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub fid: i64,
    #[serde(default)]
    pub geometry: Option<PolygonGeometry>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Feature {
    pub fn new(fid: i64, geometry: Option<PolygonGeometry>) -> Self {
        Self {
            fid,
            geometry,
            labels: BTreeMap::new(),
        }
    }
}

/// Abstract feature collaborator (a feature class, shapefile, layer, ...).
pub trait FeatureSource {
    fn count(&self) -> Result<usize, ZonalError>;
    fn features(&self) -> Result<Vec<Feature>, ZonalError>;
}

/// In-memory feature set; also the CLI's JSON input schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
}

impl FeatureSet {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }
}

impl FeatureSource for FeatureSet {
    fn count(&self) -> Result<usize, ZonalError> {
        Ok(self.features.len())
    }

    fn features(&self) -> Result<Vec<Feature>, ZonalError> {
        Ok(self.features.clone())
    }
}
