//! Tree-cover-loss and biomass-loss runs.
//!
//! Wires the masking adapter, batch coordinator and result formatter
//! together over a mosaic workspace holding the standard layer names:
//! `lossyear` (years since loss), `tcd` (tree cover density %), `area`
//! (pixel area, m²) and `biomass` (biomass density, Mg/ha).

use log::info;

use crate::batch::{run_batches, BatchConfig, RunReport};
use crate::error::ZonalError;
use crate::features::{FeatureSet, FeatureSource};
use crate::format::{
    format_biomass, format_loss, pivot_biomass, pivot_loss, LabelFields, OutputTable, OutputUnit,
};
use crate::raster::{apply_density_mask, convert_per_hectare_to_per_pixel, RasterStore};
use crate::tables::TableStore;
use crate::zonal::ZonalEngine;

// ── Mosaic layer names ────────────────────────────────────────────────────────

pub const LOSSYEAR_MOSAIC: &str = "lossyear";
pub const TCD_MOSAIC: &str = "tcd";
pub const AREA_MOSAIC: &str = "area";
pub const BIOMASS_MOSAIC: &str = "biomass";

// ── Parameters and summary ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisParams {
    /// Tree cover density threshold; pixels with density `<=` this are
    /// excluded. Must lie in `[10, 100]`.
    pub tcd_threshold: i64,
    /// Pivot the output to one row per feature.
    pub pivot: bool,
    /// Skip the run entirely when the output table already exists.
    pub resume: bool,
    pub output_table: String,
    pub batch: BatchConfig,
}

impl AnalysisParams {
    pub fn new(output_table: &str) -> Self {
        Self {
            tcd_threshold: 30,
            pivot: false,
            resume: false,
            output_table: output_table.to_string(),
            batch: BatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub output_table: String,
    pub rows_written: usize,
    pub pivoted: bool,
    /// True when an existing output table was kept and no run was performed.
    pub resumed: bool,
    pub report: RunReport,
}

// ── Validation helpers ────────────────────────────────────────────────────────

fn validate_threshold(threshold: i64) -> Result<(), ZonalError> {
    if (10..=100).contains(&threshold) {
        Ok(())
    } else {
        Err(ZonalError::InvalidThreshold(threshold))
    }
}

fn require_mosaics<W: RasterStore + ?Sized>(
    workspace: &W,
    names: &[&str],
) -> Result<(), ZonalError> {
    for name in names {
        if !workspace.exists(name) {
            return Err(ZonalError::MissingMosaic(name.to_string()));
        }
    }
    Ok(())
}

fn label_fields(features: &FeatureSet) -> LabelFields {
    features
        .features
        .iter()
        .filter(|f| !f.labels.is_empty())
        .map(|f| (f.fid, f.labels.clone()))
        .collect()
}

/// Write the final table only once it is complete: on a mid-write failure
/// the partially filled table is removed again.
fn write_output<T: TableStore + ?Sized>(
    tables: &mut T,
    name: &str,
    out: &OutputTable,
) -> Result<usize, ZonalError> {
    tables.create_table(name, &out.schema)?;
    if let Err(e) = tables.append_rows(name, &out.rows) {
        let _ = tables.delete_table(name);
        return Err(e);
    }
    Ok(out.rows.len())
}

/// Write the final table and drop the merge table. The merge table is
/// removed on the failure path as well, so an aborted write leaves no
/// temporary state behind.
fn finish_run<T: TableStore + ?Sized>(
    tables: &mut T,
    params: &AnalysisParams,
    out: &OutputTable,
) -> Result<usize, ZonalError> {
    let written = write_output(tables, &params.output_table, out);
    let _ = tables.delete_table(&params.batch.merge_table);
    written
}

fn resume_summary<T: TableStore + ?Sized>(
    tables: &T,
    params: &AnalysisParams,
) -> Result<RunSummary, ZonalError> {
    info!(
        "output table `{}` already exists, skipping run",
        params.output_table
    );
    Ok(RunSummary {
        output_table: params.output_table.clone(),
        rows_written: tables.read_rows(&params.output_table)?.len(),
        pivoted: params.pivot,
        resumed: true,
        report: RunReport::default(),
    })
}

// ── Runs ──────────────────────────────────────────────────────────────────────

/// Annual tree-cover-loss area per input feature, in hectares.
pub fn tree_cover_loss<W, S, T>(
    workspace: &mut W,
    source: &S,
    tables: &mut T,
    params: &AnalysisParams,
) -> Result<RunSummary, ZonalError>
where
    W: RasterStore + ZonalEngine,
    S: FeatureSource + ?Sized,
    T: TableStore + ?Sized,
{
    validate_threshold(params.tcd_threshold)?;
    require_mosaics(workspace, &[LOSSYEAR_MOSAIC, TCD_MOSAIC, AREA_MOSAIC])?;
    if params.resume && tables.exists(&params.output_table) {
        return resume_summary(tables, params);
    }

    // Read the source once; the run iterates this snapshot.
    let features = FeatureSet::new(source.features()?);
    if features.features.is_empty() {
        return Err(ZonalError::NoFeatures);
    }
    let labels = label_fields(&features);

    info!(
        "masking {LOSSYEAR_MOSAIC} with density threshold {}",
        params.tcd_threshold
    );
    apply_density_mask(workspace, LOSSYEAR_MOSAIC, TCD_MOSAIC, params.tcd_threshold)?;

    let classification = workspace.describe(LOSSYEAR_MOSAIC)?;
    let value = workspace.describe(AREA_MOSAIC)?;
    let outcome = run_batches(
        &features,
        workspace,
        tables,
        &classification,
        &value,
        &params.batch,
    )?;

    let out = if params.pivot {
        pivot_loss(&outcome.rows, params.tcd_threshold, &labels)
    } else {
        format_loss(&outcome.rows, params.tcd_threshold, &labels)
    };
    let rows_written = finish_run(tables, params, &out)?;
    info!("wrote {rows_written} rows to `{}`", params.output_table);

    Ok(RunSummary {
        output_table: params.output_table.clone(),
        rows_written,
        pivoted: params.pivot,
        resumed: false,
        report: outcome.report,
    })
}

/// Annual biomass loss (Mg) and derived CO2-emissions estimate per feature.
pub fn biomass_loss<W, S, T>(
    workspace: &mut W,
    source: &S,
    tables: &mut T,
    params: &AnalysisParams,
    unit: OutputUnit,
) -> Result<RunSummary, ZonalError>
where
    W: RasterStore + ZonalEngine,
    S: FeatureSource + ?Sized,
    T: TableStore + ?Sized,
{
    validate_threshold(params.tcd_threshold)?;
    require_mosaics(
        workspace,
        &[LOSSYEAR_MOSAIC, TCD_MOSAIC, BIOMASS_MOSAIC, AREA_MOSAIC],
    )?;
    if params.resume && tables.exists(&params.output_table) {
        return resume_summary(tables, params);
    }

    let features = FeatureSet::new(source.features()?);
    if features.features.is_empty() {
        return Err(ZonalError::NoFeatures);
    }
    let labels = label_fields(&features);

    info!(
        "masking {LOSSYEAR_MOSAIC} with density threshold {}",
        params.tcd_threshold
    );
    apply_density_mask(workspace, LOSSYEAR_MOSAIC, TCD_MOSAIC, params.tcd_threshold)?;
    info!("converting {BIOMASS_MOSAIC} from per-hectare to per-pixel units");
    convert_per_hectare_to_per_pixel(workspace, BIOMASS_MOSAIC, AREA_MOSAIC)?;

    let classification = workspace.describe(LOSSYEAR_MOSAIC)?;
    let value = workspace.describe(BIOMASS_MOSAIC)?;
    let outcome = run_batches(
        &features,
        workspace,
        tables,
        &classification,
        &value,
        &params.batch,
    )?;

    let out = if params.pivot {
        pivot_biomass(&outcome.rows, params.tcd_threshold, unit, &labels)
    } else {
        format_biomass(&outcome.rows, params.tcd_threshold, &labels)
    };
    let rows_written = finish_run(tables, params, &out)?;
    info!("wrote {rows_written} rows to `{}`", params.output_table);

    Ok(RunSummary {
        output_table: params.output_table.clone(),
        rows_written,
        pivoted: params.pivot,
        resumed: false,
        report: outcome.report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    use crate::features::Feature;
    use crate::geometry::{Bounds, PolygonGeometry};
    use crate::grid::{Grid, GridLayer, GridWorkspace};
    use crate::tables::{MemoryTableStore, Row, TableSchema, TableStore};

    /// Table store that rejects creation of one named table.
    struct RejectingStore {
        inner: MemoryTableStore,
        reject: String,
    }

    impl RejectingStore {
        fn new(reject: &str) -> Self {
            Self {
                inner: MemoryTableStore::new(),
                reject: reject.to_string(),
            }
        }
    }

    impl TableStore for RejectingStore {
        fn create_table(&mut self, name: &str, schema: &TableSchema) -> Result<(), ZonalError> {
            if name == self.reject {
                return Err(ZonalError::Table(format!("cannot create `{name}`")));
            }
            self.inner.create_table(name, schema)
        }
        fn append_rows(&mut self, name: &str, rows: &[Row]) -> Result<(), ZonalError> {
            self.inner.append_rows(name, rows)
        }
        fn delete_table(&mut self, name: &str) -> Result<(), ZonalError> {
            self.inner.delete_table(name)
        }
        fn exists(&self, name: &str) -> bool {
            self.inner.exists(name)
        }
        fn schema(&self, name: &str) -> Result<TableSchema, ZonalError> {
            self.inner.schema(name)
        }
        fn read_rows(&self, name: &str) -> Result<Vec<Row>, ZonalError> {
            self.inner.read_rows(name)
        }
        fn table_names(&self) -> Vec<String> {
            self.inner.table_names()
        }
    }

    /// 2×2 workspace over (0,0)–(2,2): lossyear `[[0, 3], [3, 3]]`
    /// (row 0 = south), tcd 80 everywhere, 10_000 m² pixels,
    /// biomass 5 Mg/ha everywhere.
    fn workspace() -> GridWorkspace {
        let bounds = Bounds::new(0.0, 0.0, 2.0, 2.0);
        let mut lossyear = Grid::filled(2, 2, bounds, Some(3));
        lossyear.set(0, 0, Some(0));

        let mut ws = GridWorkspace::new();
        ws.insert(LOSSYEAR_MOSAIC, GridLayer::Classification { grid: lossyear });
        ws.insert(
            TCD_MOSAIC,
            GridLayer::Classification {
                grid: Grid::filled(2, 2, bounds, Some(80)),
            },
        );
        ws.insert(
            AREA_MOSAIC,
            GridLayer::Value {
                grid: Grid::filled(2, 2, bounds, Some(10_000.0)),
            },
        );
        ws.insert(
            BIOMASS_MOSAIC,
            GridLayer::Value {
                grid: Grid::filled(2, 2, bounds, Some(5.0)),
            },
        );
        ws
    }

    fn covering_feature(fid: i64) -> Feature {
        Feature::new(
            fid,
            Some(PolygonGeometry::new(vec![vec![
                (0.0, 0.0),
                (2.0, 0.0),
                (2.0, 2.0),
                (0.0, 2.0),
            ]])),
        )
    }

    #[test]
    fn threshold_bounds_are_inclusive() {
        assert!(validate_threshold(10).is_ok());
        assert!(validate_threshold(100).is_ok());
        assert_eq!(
            validate_threshold(9).unwrap_err(),
            ZonalError::InvalidThreshold(9)
        );
        assert_eq!(
            validate_threshold(101).unwrap_err(),
            ZonalError::InvalidThreshold(101)
        );
    }

    #[test]
    fn missing_mosaic_rejected_before_run() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        let source = FeatureSet::new(vec![covering_feature(1)]);
        let mut params = AnalysisParams::new("out");
        params.tcd_threshold = 9;
        // Threshold checked first.
        assert!(matches!(
            tree_cover_loss(&mut ws, &source, &mut tables, &params),
            Err(ZonalError::InvalidThreshold(9))
        ));

        let mut bare = GridWorkspace::new();
        let params = AnalysisParams::new("out");
        assert_eq!(
            tree_cover_loss(&mut bare, &source, &mut tables, &params).unwrap_err(),
            ZonalError::MissingMosaic(LOSSYEAR_MOSAIC.to_string())
        );
    }

    #[test]
    fn empty_source_is_no_features() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        let params = AnalysisParams::new("out");
        assert_eq!(
            tree_cover_loss(&mut ws, &FeatureSet::default(), &mut tables, &params).unwrap_err(),
            ZonalError::NoFeatures
        );
    }

    #[test]
    fn tree_cover_loss_end_to_end() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        let source = FeatureSet::new(vec![covering_feature(1), Feature::new(2, None)]);
        let params = AnalysisParams::new("out");

        let summary = tree_cover_loss(&mut ws, &source, &mut tables, &params).unwrap();
        assert!(!summary.resumed);
        assert_eq!(summary.report.no_geometry, 1);
        assert_eq!(summary.rows_written, 2);

        // Only the final output remains; merge and partial tables are gone.
        assert_eq!(tables.table_names(), vec!["out".to_string()]);
        let rows = tables.read_rows("out").unwrap();
        // One 10_000 m² pixel of code 0, three of code 3 → 1 ha and 3 ha.
        assert_eq!(rows[0][1].as_str().unwrap(), "no loss");
        assert_relative_eq!(rows[0][3].as_f64().unwrap(), 1.0);
        assert_eq!(rows[1][1].as_str().unwrap(), "Year 2003");
        assert_relative_eq!(rows[1][3].as_f64().unwrap(), 3.0);
    }

    #[test]
    fn tree_cover_loss_pivoted() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        let source = FeatureSet::new(vec![covering_feature(1)]);
        let mut params = AnalysisParams::new("out");
        params.pivot = true;

        let summary = tree_cover_loss(&mut ws, &source, &mut tables, &params).unwrap();
        assert!(summary.pivoted);
        assert_eq!(summary.rows_written, 1);
        let schema = tables.schema("out").unwrap();
        assert_eq!(
            schema.column_names(),
            vec!["FID", "TCD", "no loss", "Year 2003"]
        );
    }

    #[test]
    fn biomass_loss_end_to_end_with_emissions() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        let source = FeatureSet::new(vec![covering_feature(1)]);
        let params = AnalysisParams::new("out");

        let summary =
            biomass_loss(&mut ws, &source, &mut tables, &params, OutputUnit::BiomassMg).unwrap();
        assert_eq!(summary.rows_written, 2);

        let rows = tables.read_rows("out").unwrap();
        // 5 Mg/ha × 10_000 m² pixels → 5 Mg per pixel; three code-3 pixels.
        assert_eq!(rows[1][1].as_str().unwrap(), "Year 2003");
        assert_relative_eq!(rows[1][3].as_f64().unwrap(), 15.0);
        assert_relative_eq!(
            rows[1][4].as_f64().unwrap(),
            15.0 * 0.5 * 3.67 / 1_000_000.0
        );
    }

    #[test]
    fn failed_output_write_drops_merge_table() {
        let mut ws = workspace();
        let mut tables = RejectingStore::new("out");
        let source = FeatureSet::new(vec![covering_feature(1)]);
        let params = AnalysisParams::new("out");

        let err = tree_cover_loss(&mut ws, &source, &mut tables, &params).unwrap_err();
        assert!(matches!(err, ZonalError::Table(_)));
        assert!(
            tables.table_names().is_empty(),
            "aborted write must leave no temp tables"
        );
    }

    #[test]
    fn resume_skips_existing_output() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        tables.create_table("out", &TableSchema::default()).unwrap();
        let source = FeatureSet::new(vec![covering_feature(1)]);
        let mut params = AnalysisParams::new("out");
        params.resume = true;

        let summary = tree_cover_loss(&mut ws, &source, &mut tables, &params).unwrap();
        assert!(summary.resumed);
        assert_eq!(summary.rows_written, 0);
        // No transform was installed: the run never started.
        assert!(ws.transform(LOSSYEAR_MOSAIC).is_none());
    }

    #[test]
    fn rerun_without_resume_overwrites_output() {
        let mut ws = workspace();
        let mut tables = MemoryTableStore::new();
        let source = FeatureSet::new(vec![covering_feature(1)]);
        let params = AnalysisParams::new("out");

        tree_cover_loss(&mut ws, &source, &mut tables, &params).unwrap();
        let first = tables.read_rows("out").unwrap();
        let summary = tree_cover_loss(&mut ws, &source, &mut tables, &params).unwrap();
        assert!(!summary.resumed);
        assert_eq!(tables.read_rows("out").unwrap(), first);
    }
}
