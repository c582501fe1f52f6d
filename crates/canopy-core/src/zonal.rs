//! Per-feature zonal aggregation.
//!
//! Sums a value raster grouped by the distinct integer codes of a
//! classification raster, restricted to one polygon footprint. The raster
//! cell math itself is delegated to a [`ZonalEngine`] collaborator; the
//! footprint is passed explicitly rather than through ambient engine state.

use thiserror::Error;

use crate::geometry::Footprint;
use crate::tables::{Column, ColumnKind, Row, TableSchema, Value};

/// One (code, sum) row of a zonal aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneSum {
    pub code: i32,
    pub sum: f64,
}

/// Aggregation failure for a single feature.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    /// The computed aggregation extent contained no pixels. Retryable:
    /// the coordinator leaves the feature for a later pass.
    #[error("aggregation extent is empty")]
    EmptyFootprint,

    /// Engine-level failure; aborts the run.
    #[error("zonal engine failure: {0}")]
    Engine(String),
}

/// External zonal aggregation collaborator. Masked / nodata pixels of the
/// classification raster are excluded (`DATA` zones only).
pub trait ZonalEngine {
    fn sum_by_zone(
        &self,
        classification: &str,
        value: &str,
        footprint: &Footprint,
    ) -> Result<Vec<ZoneSum>, AggregateError>;
}

/// Result of aggregating one feature: `(FID, code, sum)` rows, one per
/// distinct code present under the footprint. Ephemeral; owned by the batch
/// coordinator until flushed into the merged table.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub fid: i64,
    pub zones: Vec<ZoneSum>,
}

impl PartialResult {
    /// Shape of a partial (and hence of the merged) result table.
    pub fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("FID", ColumnKind::Integer),
            Column::new("VALUE", ColumnKind::Integer),
            Column::new("SUM", ColumnKind::Double),
        ])
    }

    pub fn rows(&self) -> Vec<Row> {
        self.zones
            .iter()
            .map(|z| {
                vec![
                    Value::Int(self.fid),
                    Value::Int(i64::from(z.code)),
                    Value::Float(z.sum),
                ]
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// Aggregate one validated footprint and tag every row with the owning FID.
/// Rows come back sorted by code for deterministic downstream ordering.
pub fn aggregate<E: ZonalEngine + ?Sized>(
    engine: &E,
    fid: i64,
    footprint: &Footprint,
    classification: &str,
    value: &str,
) -> Result<PartialResult, AggregateError> {
    let mut zones = engine.sum_by_zone(classification, value, footprint)?;
    zones.sort_by_key(|z| z.code);
    Ok(PartialResult { fid, zones })
}
