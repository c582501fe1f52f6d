//! Run-level error taxonomy.
//!
//! Per-feature validation outcomes (`NoGeometry`, `OutOfBounds`) and the
//! retryable `EmptyFootprint` signal are not errors at this level — they are
//! recovered inside the batch coordinator. Everything here aborts the run.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZonalError {
    /// The feature source yielded zero features.
    #[error("no features found in input layer")]
    NoFeatures,

    /// Tree cover density threshold outside the accepted range.
    #[error("tree cover density threshold must be in [10, 100], got {0}")]
    InvalidThreshold(i64),

    /// A required named mosaic is absent from the raster workspace.
    #[error("mosaic dataset `{0}` not found in workspace")]
    MissingMosaic(String),

    /// Retry passes exhausted without progress; names the stuck features.
    #[error("run stalled after {passes} passes with no progress; unprocessed features: {fids:?}")]
    StalledRun { passes: usize, fids: Vec<i64> },

    /// Raster / zonal engine collaborator failure. Not recovered locally.
    #[error("raster engine failure: {0}")]
    Engine(String),

    /// Table store collaborator failure. Not recovered locally.
    #[error("table store failure: {0}")]
    Table(String),
}
