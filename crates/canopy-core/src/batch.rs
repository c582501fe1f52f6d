//! Batch coordinator: drives validation and aggregation over all input
//! features with bounded temporary-resource usage.
//!
//! Each successfully aggregated feature is staged as a temporary partial
//! table; once `batch_size` partials have accumulated they are flushed —
//! appended to the merged table as whole per-feature groups, then deleted.
//! The flush trigger counts buffered partials, not processed features:
//! skipped features hold no temporary state and do not advance it.
//! Features whose aggregation extent comes back empty are left unprocessed
//! and retried on a later pass; the retry loop is capped by
//! `max_stall_passes` consecutive passes without progress.

use std::collections::BTreeSet;

use log::{info, warn};

use crate::error::ZonalError;
use crate::features::FeatureSource;
use crate::geometry::{validate, Validation};
use crate::raster::RasterLayerRef;
use crate::tables::{Row, TableStore, Value};
use crate::zonal::{aggregate, AggregateError, PartialResult, ZonalEngine};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Maximum number of buffered partial results before a flush.
    /// Values below 1 are treated as 1.
    pub batch_size: usize,
    /// Consecutive no-progress passes tolerated before the run fails.
    pub max_stall_passes: usize,
    /// Name of the temporary merged-result table.
    pub merge_table: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_stall_passes: 3,
            merge_table: "merge_table".to_string(),
        }
    }
}

// ── Run-scoped state ──────────────────────────────────────────────────────────

/// Tracks which FIDs of a run have been completed or explicitly skipped.
/// `processed` only grows and never exceeds `total`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingSet {
    total: BTreeSet<i64>,
    processed: BTreeSet<i64>,
}

impl ProcessingSet {
    pub fn new<I: IntoIterator<Item = i64>>(fids: I) -> Self {
        Self {
            total: fids.into_iter().collect(),
            processed: BTreeSet::new(),
        }
    }

    pub fn mark(&mut self, fid: i64) {
        debug_assert!(self.total.contains(&fid), "fid {fid} not part of this run");
        self.processed.insert(fid);
    }

    pub fn is_processed(&self, fid: i64) -> bool {
        self.processed.contains(&fid)
    }

    pub fn is_done(&self) -> bool {
        self.processed == self.total
    }

    pub fn total_len(&self) -> usize {
        self.total.len()
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    /// FIDs not yet completed, ascending.
    pub fn remaining(&self) -> Vec<i64> {
        self.total.difference(&self.processed).copied().collect()
    }
}

/// One row of the cumulative merged result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedRow {
    pub fid: i64,
    pub code: i32,
    pub sum: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub features: usize,
    pub aggregated: usize,
    pub no_geometry: usize,
    pub out_of_bounds: usize,
    pub flushes: usize,
    pub passes: usize,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub rows: Vec<MergedRow>,
    pub report: RunReport,
}

// ── Flush bookkeeping ─────────────────────────────────────────────────────────

/// Buffered partials plus the temp tables backing them. All temp entries are
/// drained at every flush and at run end, including the error path.
struct FlushState {
    buffer: Vec<PartialResult>,
    temp_tables: Vec<String>,
    merged: Vec<MergedRow>,
    merged_created: bool,
    flushes: usize,
}

impl FlushState {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            temp_tables: Vec::new(),
            merged: Vec::new(),
            merged_created: false,
            flushes: 0,
        }
    }

    /// Stage one partial result as a temporary table and buffer it.
    fn stage<T: TableStore + ?Sized>(
        &mut self,
        tables: &mut T,
        partial: PartialResult,
    ) -> Result<(), ZonalError> {
        let name = format!("feature_{}", partial.fid);
        tables.create_table(&name, &PartialResult::schema())?;
        tables.append_rows(&name, &partial.rows())?;
        self.temp_tables.push(name);
        self.buffer.push(partial);
        Ok(())
    }

    /// Merge the buffer into the merged table and delete the temp tables.
    /// Whole partials only: a feature's rows are never split across flushes.
    fn flush<T: TableStore + ?Sized>(
        &mut self,
        tables: &mut T,
        merge_table: &str,
    ) -> Result<(), ZonalError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if !self.merged_created {
            // Schema taken from the partial-result shape on the first flush.
            tables.create_table(merge_table, &PartialResult::schema())?;
            self.merged_created = true;
        }
        let mut rows: Vec<Row> = Vec::new();
        for partial in &self.buffer {
            for z in &partial.zones {
                rows.push(vec![
                    Value::Int(partial.fid),
                    Value::Int(i64::from(z.code)),
                    Value::Float(z.sum),
                ]);
                self.merged.push(MergedRow {
                    fid: partial.fid,
                    code: z.code,
                    sum: z.sum,
                });
            }
        }
        tables.append_rows(merge_table, &rows)?;
        for name in self.temp_tables.drain(..) {
            tables.delete_table(&name)?;
        }
        self.buffer.clear();
        self.flushes += 1;
        Ok(())
    }

    /// Best-effort removal of all temporary state on the error path.
    fn drain<T: TableStore + ?Sized>(&mut self, tables: &mut T, merge_table: &str) {
        for name in self.temp_tables.drain(..) {
            let _ = tables.delete_table(&name);
        }
        if self.merged_created {
            let _ = tables.delete_table(merge_table);
        }
        self.buffer.clear();
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Run the full aggregation over every feature of `source`.
///
/// Terminates when every FID is accounted for, or fails with
/// [`ZonalError::StalledRun`] once `max_stall_passes` consecutive passes make
/// no progress. On success the merged table named by `cfg.merge_table` holds
/// every flushed row; the same rows are returned in memory for formatting.
pub fn run_batches<S, E, T>(
    source: &S,
    engine: &E,
    tables: &mut T,
    classification: &RasterLayerRef,
    value: &RasterLayerRef,
    cfg: &BatchConfig,
) -> Result<BatchOutcome, ZonalError>
where
    S: FeatureSource + ?Sized,
    E: ZonalEngine + ?Sized,
    T: TableStore + ?Sized,
{
    let features = source.features()?;
    if features.is_empty() {
        return Err(ZonalError::NoFeatures);
    }

    let batch_size = cfg.batch_size.max(1);
    let mut state = ProcessingSet::new(features.iter().map(|f| f.fid));
    let mut flush_state = FlushState::new();
    let mut report = RunReport {
        features: features.len(),
        ..RunReport::default()
    };
    let mut stalled = 0usize;

    while !state.is_done() {
        report.passes += 1;
        let mut progressed = false;

        for feature in &features {
            if state.is_processed(feature.fid) {
                continue;
            }
            info!(
                "processing feature {} of {}",
                state.processed_len() + 1,
                state.total_len()
            );

            match validate(
                feature.geometry.as_ref(),
                &classification.bounds,
                &value.bounds,
            ) {
                Validation::NoGeometry => {
                    warn!("feature {} has no geometry, skipping", feature.fid);
                    state.mark(feature.fid);
                    report.no_geometry += 1;
                    progressed = true;
                }
                Validation::OutOfBounds => {
                    warn!(
                        "feature {} lies outside the raster bounds, skipping",
                        feature.fid
                    );
                    state.mark(feature.fid);
                    report.out_of_bounds += 1;
                    progressed = true;
                }
                Validation::Valid(footprint) => {
                    match aggregate(
                        engine,
                        feature.fid,
                        &footprint,
                        &classification.name,
                        &value.name,
                    ) {
                        Ok(partial) => {
                            if let Err(e) = flush_state.stage(tables, partial) {
                                flush_state.drain(tables, &cfg.merge_table);
                                return Err(e);
                            }
                            state.mark(feature.fid);
                            report.aggregated += 1;
                            progressed = true;
                            if flush_state.buffer.len() >= batch_size {
                                if let Err(e) = flush_state.flush(tables, &cfg.merge_table) {
                                    flush_state.drain(tables, &cfg.merge_table);
                                    return Err(e);
                                }
                            }
                        }
                        Err(AggregateError::EmptyFootprint) => {
                            warn!(
                                "feature {}: aggregation extent empty, retrying on a later pass",
                                feature.fid
                            );
                        }
                        Err(AggregateError::Engine(msg)) => {
                            flush_state.drain(tables, &cfg.merge_table);
                            return Err(ZonalError::Engine(msg));
                        }
                    }
                }
            }
        }

        if progressed {
            stalled = 0;
        } else {
            stalled += 1;
            if stalled >= cfg.max_stall_passes {
                let fids = state.remaining();
                flush_state.drain(tables, &cfg.merge_table);
                return Err(ZonalError::StalledRun {
                    passes: stalled,
                    fids,
                });
            }
        }
    }

    // Terminal: flush whatever remains in the buffer.
    if let Err(e) = flush_state.flush(tables, &cfg.merge_table) {
        flush_state.drain(tables, &cfg.merge_table);
        return Err(e);
    }
    // A run where every feature was skipped still produces a (empty) merged
    // table so downstream formatting has something to read.
    if !flush_state.merged_created {
        tables.create_table(&cfg.merge_table, &PartialResult::schema())?;
    }

    report.flushes = flush_state.flushes;
    Ok(BatchOutcome {
        rows: flush_state.merged,
        report,
    })
}
