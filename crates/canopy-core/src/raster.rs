//! Raster store interface and the masking / unit-conversion adapters.
//!
//! The actual raster math lives in the external raster engine; this module
//! only prepares and installs transform descriptors on named raster
//! resources. At most one transform is active per resource, so installing a
//! new one always clears any prior one first (re-application is idempotent).

use serde::{Deserialize, Serialize};

use crate::error::ZonalError;
use crate::geometry::Bounds;

/// Classification code assigned to pixels excluded by the density threshold.
pub const EXCLUDED_CODE: i32 = -1;

/// Square metres per hectare, for per-hectare → per-pixel conversion.
pub const M2_PER_HECTARE: f64 = 10_000.0;

// ── Layer handles ─────────────────────────────────────────────────────────────

/// Immutable handle to a raster dataset owned by the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterLayerRef {
    pub name: String,
    pub crs: String,
    pub bounds: Bounds,
    /// Nominal cell size in map units.
    pub resolution: f64,
}

// ── Transform descriptors ─────────────────────────────────────────────────────

/// Data-driven description of a per-pixel transform installed on a raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RasterTransform {
    /// Pixels where `density <= threshold` are overwritten with
    /// [`EXCLUDED_CODE`]; all other pixels pass through unchanged.
    DensityMask {
        density_raster: String,
        threshold: i64,
    },
    /// Per-hectare values become per-pixel: `value * area_m2 / 10_000`.
    PerPixelConversion { area_raster: String },
}

// ── Store interface ───────────────────────────────────────────────────────────

/// Abstract raster collaborator (a mosaic workspace, raster catalog, ...).
pub trait RasterStore {
    fn describe(&self, name: &str) -> Result<RasterLayerRef, ZonalError>;
    fn apply_transform(&mut self, name: &str, transform: RasterTransform)
        -> Result<(), ZonalError>;
    fn clear_transform(&mut self, name: &str) -> Result<(), ZonalError>;
    fn exists(&self, name: &str) -> bool;
}

// ── Adapters ──────────────────────────────────────────────────────────────────

/// Install a density-threshold mask on `classification`. The threshold is
/// validated by the caller before this adapter is invoked.
pub fn apply_density_mask<S: RasterStore + ?Sized>(
    store: &mut S,
    classification: &str,
    density: &str,
    threshold: i64,
) -> Result<(), ZonalError> {
    debug_assert!((10..=100).contains(&threshold));
    store.clear_transform(classification)?;
    store.apply_transform(
        classification,
        RasterTransform::DensityMask {
            density_raster: density.to_string(),
            threshold,
        },
    )
}

/// Install a per-hectare → per-pixel conversion on `value`, using the
/// pixel-area raster `area`.
pub fn convert_per_hectare_to_per_pixel<S: RasterStore + ?Sized>(
    store: &mut S,
    value: &str,
    area: &str,
) -> Result<(), ZonalError> {
    store.clear_transform(value)?;
    store.apply_transform(
        value,
        RasterTransform::PerPixelConversion {
            area_raster: area.to_string(),
        },
    )
}
