//! Polygon geometry and per-feature validation.
//!
//! Features are validated before aggregation: a feature with missing or
//! degenerate geometry is skipped outright, and a feature whose bounding box
//! is not fully contained in *both* raster footprints is skipped as
//! out-of-bounds. Both outcomes are non-fatal; the coordinator records the
//! feature as processed and moves on.

use serde::{Deserialize, Serialize};

// ── Bounds ────────────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in raster map units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Zero or negative extent on either axis.
    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    /// Full containment of `other` (closed comparison on all edges).
    pub fn contains(&self, other: &Bounds) -> bool {
        other.min_x >= self.min_x
            && other.min_y >= self.min_y
            && other.max_x <= self.max_x
            && other.max_y <= self.max_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Overlap of two boxes; `None` when they are disjoint.
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let clip = Bounds::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        if clip.is_empty() {
            None
        } else {
            Some(clip)
        }
    }
}

// ── Polygon geometry ──────────────────────────────────────────────────────────

/// A polygon as one or more closed rings of (x, y) vertices.
/// Containment uses the even-odd rule, so interior rings act as holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonGeometry {
    pub rings: Vec<Vec<(f64, f64)>>,
}

impl PolygonGeometry {
    pub fn new(rings: Vec<Vec<(f64, f64)>>) -> Self {
        Self { rings }
    }

    /// A geometry with no ring of at least three vertices encloses nothing.
    pub fn is_empty(&self) -> bool {
        self.rings.iter().all(|r| r.len() < 3)
    }

    /// Bounding box over all ring vertices. `None` for empty geometry.
    pub fn bounds(&self) -> Option<Bounds> {
        let mut vertices = self.rings.iter().filter(|r| r.len() >= 3).flatten();
        let &(x0, y0) = vertices.next()?;
        let mut b = Bounds::new(x0, y0, x0, y0);
        for &(x, y) in vertices {
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x);
            b.max_y = b.max_y.max(y);
        }
        Some(b)
    }

    /// Even-odd ray cast across all rings.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        for ring in &self.rings {
            if ring.len() < 3 {
                continue;
            }
            let mut j = ring.len() - 1;
            for i in 0..ring.len() {
                let (xi, yi) = ring[i];
                let (xj, yj) = ring[j];
                if (yi > y) != (yj > y) {
                    let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
                    if x < x_cross {
                        inside = !inside;
                    }
                }
                j = i;
            }
        }
        inside
    }
}

// ── Footprint ─────────────────────────────────────────────────────────────────

/// A validated polygon ready for use as an aggregation mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    pub geometry: PolygonGeometry,
    pub bounds: Bounds,
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Outcome of per-feature validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid(Footprint),
    NoGeometry,
    OutOfBounds,
}

/// Validate one feature's geometry against the bounds of both rasters
/// being aggregated. Geometries are assumed to share the rasters'
/// coordinate reference; reprojection belongs to the feature source.
pub fn validate(
    geometry: Option<&PolygonGeometry>,
    classification_bounds: &Bounds,
    value_bounds: &Bounds,
) -> Validation {
    let Some(geometry) = geometry else {
        return Validation::NoGeometry;
    };
    let Some(bounds) = geometry.bounds() else {
        return Validation::NoGeometry;
    };
    if !classification_bounds.contains(&bounds) || !value_bounds.contains(&bounds) {
        return Validation::OutOfBounds;
    }
    Validation::Valid(Footprint {
        geometry: geometry.clone(),
        bounds,
    })
}
