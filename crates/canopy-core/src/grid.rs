//! In-memory grid workspace: a concrete [`RasterStore`] and [`ZonalEngine`]
//! over serde-loadable raster grids.
//!
//! Grids are row-major with row 0 at the `min_y` edge and `None` cells as
//! nodata. Installed transforms are evaluated per pixel at aggregation time:
//! a density mask overwrites codes where `density <= threshold` with the
//! excluded sentinel, and a per-pixel conversion scales values by
//! `area_m2 / 10_000`. A pixel contributes when its cell centre falls inside
//! the footprint polygon; nodata zone or value cells are excluded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ZonalError;
use crate::geometry::{Bounds, Footprint};
use crate::raster::{RasterLayerRef, RasterStore, RasterTransform, EXCLUDED_CODE, M2_PER_HECTARE};
use crate::zonal::{AggregateError, ZonalEngine, ZoneSum};

// ── Grid ──────────────────────────────────────────────────────────────────────

/// A 2D raster grid in map units. Row-major, row 0 = `min_y` edge.
/// Deserialized grids are shape-checked; see [`RawGrid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid<T>")]
pub struct Grid<T> {
    pub width: usize,
    pub height: usize,
    pub bounds: Bounds,
    /// Cell values; `None` = nodata.
    pub data: Vec<Option<T>>,
}

/// Serde surface of [`Grid`]. Conversion rejects zero-sized grids and data
/// vectors that do not match `width * height`, so a malformed layer file
/// fails at parse time instead of out-of-bounds at aggregation time.
#[derive(Deserialize)]
struct RawGrid<T> {
    width: usize,
    height: usize,
    bounds: Bounds,
    data: Vec<Option<T>>,
}

impl<T> TryFrom<RawGrid<T>> for Grid<T> {
    type Error = String;

    fn try_from(raw: RawGrid<T>) -> Result<Self, Self::Error> {
        if raw.width == 0 || raw.height == 0 {
            return Err(format!(
                "grid dimensions must be nonzero, got {}x{}",
                raw.width, raw.height
            ));
        }
        if raw.data.len() != raw.width * raw.height {
            return Err(format!(
                "grid data holds {} cells, expected {} ({}x{})",
                raw.data.len(),
                raw.width * raw.height,
                raw.width,
                raw.height
            ));
        }
        Ok(Self {
            width: raw.width,
            height: raw.height,
            bounds: raw.bounds,
            data: raw.data,
        })
    }
}

impl<T: Copy> Grid<T> {
    /// Create a grid filled with the given cell value.
    pub fn filled(width: usize, height: usize, bounds: Bounds, fill: Option<T>) -> Self {
        Self {
            width,
            height,
            bounds,
            data: vec![fill; width * height],
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: Option<T>) {
        self.data[row * self.width + col] = val;
    }

    pub fn cell_width(&self) -> f64 {
        self.bounds.width() / self.width as f64
    }

    pub fn cell_height(&self) -> f64 {
        self.bounds.height() / self.height as f64
    }

    /// Map coordinates of the centre of cell (row, col).
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.bounds.min_x + (col as f64 + 0.5) * self.cell_width(),
            self.bounds.min_y + (row as f64 + 0.5) * self.cell_height(),
        )
    }

    /// Nearest-cell sample at (x, y); `None` outside bounds or on nodata.
    pub fn sample(&self, x: f64, y: f64) -> Option<T> {
        if !self.bounds.contains_point(x, y) {
            return None;
        }
        let col = (((x - self.bounds.min_x) / self.cell_width()) as usize).min(self.width - 1);
        let row = (((y - self.bounds.min_y) / self.cell_height()) as usize).min(self.height - 1);
        self.get(row, col)
    }

    /// Cell index range (row0..row1, col0..col1) covering `clip`.
    /// Ranges are clamped to the grid and may be empty.
    pub fn cell_range(&self, clip: &Bounds) -> (usize, usize, usize, usize) {
        let cw = self.cell_width();
        let ch = self.cell_height();
        let c0 = (((clip.min_x - self.bounds.min_x) / cw).floor().max(0.0)) as usize;
        let r0 = (((clip.min_y - self.bounds.min_y) / ch).floor().max(0.0)) as usize;
        let c1 = ((((clip.max_x - self.bounds.min_x) / cw).ceil()).max(0.0) as usize).min(self.width);
        let r1 = ((((clip.max_y - self.bounds.min_y) / ch).ceil()).max(0.0) as usize).min(self.height);
        (r0, r1, c0, c1)
    }
}

// ── Layers ────────────────────────────────────────────────────────────────────

/// A named workspace layer: integer classification codes or float values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridLayer {
    Classification { grid: Grid<i32> },
    Value { grid: Grid<f64> },
}

impl GridLayer {
    pub fn bounds(&self) -> Bounds {
        match self {
            GridLayer::Classification { grid } => grid.bounds,
            GridLayer::Value { grid } => grid.bounds,
        }
    }

    pub fn resolution(&self) -> f64 {
        match self {
            GridLayer::Classification { grid } => grid.cell_width(),
            GridLayer::Value { grid } => grid.cell_width(),
        }
    }
}

// ── Workspace ─────────────────────────────────────────────────────────────────

/// A set of named, georeferenced grid layers with per-layer transforms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridWorkspace {
    layers: BTreeMap<String, GridLayer>,
    transforms: BTreeMap<String, RasterTransform>,
    pub crs: String,
}

impl GridWorkspace {
    pub fn new() -> Self {
        Self {
            layers: BTreeMap::new(),
            transforms: BTreeMap::new(),
            crs: "EPSG:4326".to_string(),
        }
    }

    pub fn insert(&mut self, name: &str, layer: GridLayer) {
        self.layers.insert(name.to_string(), layer);
    }

    pub fn layer(&self, name: &str) -> Option<&GridLayer> {
        self.layers.get(name)
    }

    pub fn transform(&self, name: &str) -> Option<&RasterTransform> {
        self.transforms.get(name)
    }

    /// Untransformed value lookup, classification codes widened to f64.
    fn raw_value(&self, name: &str, x: f64, y: f64) -> Option<f64> {
        match self.layers.get(name)? {
            GridLayer::Value { grid } => grid.sample(x, y),
            GridLayer::Classification { grid } => grid.sample(x, y).map(f64::from),
        }
    }

    /// Classification code at a cell, with any installed density mask applied.
    /// Nodata density pixels pass the original code through.
    fn masked_code(&self, name: &str, base: i32, x: f64, y: f64) -> i32 {
        if let Some(RasterTransform::DensityMask {
            density_raster,
            threshold,
        }) = self.transforms.get(name)
        {
            if let Some(density) = self.raw_value(density_raster, x, y) {
                if density <= *threshold as f64 {
                    return EXCLUDED_CODE;
                }
            }
        }
        base
    }

    /// Value at (x, y), with any installed per-pixel conversion applied.
    fn value_at(&self, name: &str, x: f64, y: f64) -> Option<f64> {
        let base = self.raw_value(name, x, y)?;
        if let Some(RasterTransform::PerPixelConversion { area_raster }) =
            self.transforms.get(name)
        {
            let area = self.raw_value(area_raster, x, y)?;
            return Some(base * area / M2_PER_HECTARE);
        }
        Some(base)
    }
}

impl RasterStore for GridWorkspace {
    fn describe(&self, name: &str) -> Result<RasterLayerRef, ZonalError> {
        let layer = self
            .layers
            .get(name)
            .ok_or_else(|| ZonalError::MissingMosaic(name.to_string()))?;
        Ok(RasterLayerRef {
            name: name.to_string(),
            crs: self.crs.clone(),
            bounds: layer.bounds(),
            resolution: layer.resolution(),
        })
    }

    fn apply_transform(
        &mut self,
        name: &str,
        transform: RasterTransform,
    ) -> Result<(), ZonalError> {
        if !self.layers.contains_key(name) {
            return Err(ZonalError::MissingMosaic(name.to_string()));
        }
        let referenced = match &transform {
            RasterTransform::DensityMask { density_raster, .. } => density_raster,
            RasterTransform::PerPixelConversion { area_raster } => area_raster,
        };
        if !self.layers.contains_key(referenced) {
            return Err(ZonalError::MissingMosaic(referenced.clone()));
        }
        // Replaces any prior transform on this resource.
        self.transforms.insert(name.to_string(), transform);
        Ok(())
    }

    fn clear_transform(&mut self, name: &str) -> Result<(), ZonalError> {
        self.transforms.remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }
}

impl ZonalEngine for GridWorkspace {
    fn sum_by_zone(
        &self,
        classification: &str,
        value: &str,
        footprint: &Footprint,
    ) -> Result<Vec<ZoneSum>, AggregateError> {
        let Some(GridLayer::Classification { grid }) = self.layers.get(classification) else {
            return Err(AggregateError::Engine(format!(
                "`{classification}` is not a classification raster"
            )));
        };
        if !self.layers.contains_key(value) {
            return Err(AggregateError::Engine(format!(
                "value raster `{value}` not found in workspace"
            )));
        }

        let Some(clip) = grid.bounds.intersection(&footprint.bounds) else {
            return Err(AggregateError::EmptyFootprint);
        };
        let (r0, r1, c0, c1) = grid.cell_range(&clip);
        if r0 >= r1 || c0 >= c1 {
            return Err(AggregateError::EmptyFootprint);
        }

        let mut sums: BTreeMap<i32, f64> = BTreeMap::new();
        for row in r0..r1 {
            for col in c0..c1 {
                let (x, y) = grid.cell_center(row, col);
                if !footprint.geometry.contains(x, y) {
                    continue;
                }
                // DATA zones only: nodata classification cells are excluded.
                let Some(base) = grid.get(row, col) else {
                    continue;
                };
                let code = self.masked_code(classification, base, x, y);
                let Some(v) = self.value_at(value, x, y) else {
                    continue;
                };
                *sums.entry(code).or_insert(0.0) += v;
            }
        }

        Ok(sums
            .into_iter()
            .map(|(code, sum)| ZoneSum { code, sum })
            .collect())
    }
}
