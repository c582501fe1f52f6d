/// Forest-loss statistics tool: runs the tree-cover-loss and biomass-loss
/// analyses over a directory of raster layers and a polygon feature file,
/// writing the result table as JSON.
///
/// Workspace layout: one `<name>.json` GridLayer file per raster; the
/// analyses expect the standard names `lossyear`, `tcd`, `area` and
/// (for biomass) `biomass`.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;

use canopy_core::analysis::{biomass_loss, tree_cover_loss, AnalysisParams, RunSummary};
use canopy_core::features::FeatureSet;
use canopy_core::format::OutputUnit;
use canopy_core::grid::{GridLayer, GridWorkspace};
use canopy_core::tables::{Column, MemoryTableStore, Row, TableStore};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "forestloss",
    about = "Masked zonal statistics for tree-cover and biomass loss"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Annual tree-cover-loss area per feature, in hectares
    TreeCoverLoss(RunArgs),

    /// Annual biomass loss per feature, with a CO2-emissions estimate
    BiomassLoss {
        #[command(flatten)]
        args: RunArgs,

        /// Value unit of the pivoted table
        #[arg(long, value_enum, default_value = "biomass-mg")]
        unit: UnitArg,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input polygon features (FeatureSet JSON)
    #[arg(long)]
    features: PathBuf,

    /// Directory of raster layers (one <name>.json GridLayer file each)
    #[arg(long)]
    workspace: PathBuf,

    /// Output table path (JSON, overwritten unless --resume)
    #[arg(short, long)]
    output: PathBuf,

    /// Tree cover density threshold in percent, within [10, 100]
    #[arg(long, default_value = "30")]
    threshold: i64,

    /// One row per feature with a column per loss year
    #[arg(long)]
    pivot: bool,

    /// Buffered per-feature results per flush
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Skip the run when the output file already exists
    #[arg(long)]
    resume: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum UnitArg {
    BiomassMg,
    Co2Mt,
}

impl From<UnitArg> for OutputUnit {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::BiomassMg => OutputUnit::BiomassMg,
            UnitArg::Co2Mt => OutputUnit::Co2Mt,
        }
    }
}

// ── Output schema ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OutputFile {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

// ── Loading ──────────────────────────────────────────────────────────────────

fn load_features(path: &Path) -> Result<FeatureSet> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn layer_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

fn load_workspace(dir: &Path) -> Result<GridWorkspace> {
    let mut ws = GridWorkspace::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Cannot read directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = layer_name(&path) else {
            continue;
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let layer: GridLayer = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse layer {}", path.display()))?;
        info!("loaded layer `{name}` from {}", path.display());
        ws.insert(&name, layer);
    }
    Ok(ws)
}

// ── Run ──────────────────────────────────────────────────────────────────────

fn run(args: &RunArgs, unit: Option<OutputUnit>) -> Result<()> {
    if args.resume && args.output.exists() {
        eprintln!(
            "[forestloss] Output {} already exists — skipping (--resume)",
            args.output.display()
        );
        return Ok(());
    }

    let features = load_features(&args.features)?;
    if features.features.is_empty() {
        bail!("no features found in {}", args.features.display());
    }
    let mut workspace = load_workspace(&args.workspace)?;
    let mut tables = MemoryTableStore::new();

    let mut params = AnalysisParams::new("result");
    params.tcd_threshold = args.threshold;
    params.pivot = args.pivot;
    params.batch.batch_size = args.batch_size;

    let summary = match unit {
        None => tree_cover_loss(&mut workspace, &features, &mut tables, &params)?,
        Some(unit) => biomass_loss(&mut workspace, &features, &mut tables, &params, unit)?,
    };

    write_output(&args.output, &tables, &summary)?;
    eprintln!(
        "[forestloss] {} features ({} aggregated, {} without geometry, {} out of bounds), \
         {} rows → {}",
        summary.report.features,
        summary.report.aggregated,
        summary.report.no_geometry,
        summary.report.out_of_bounds,
        summary.rows_written,
        args.output.display()
    );
    Ok(())
}

fn write_output(path: &Path, tables: &MemoryTableStore, summary: &RunSummary) -> Result<()> {
    let out = OutputFile {
        columns: tables.schema(&summary.output_table)?.columns,
        rows: tables.read_rows(&summary.output_table)?,
    };
    let json = serde_json::to_string_pretty(&out)?;
    fs::write(path, json).with_context(|| format!("Write failed: {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Command::TreeCoverLoss(args) => run(args, None),
        Command::BiomassLoss { args, unit } => run(args, Some((*unit).into())),
    }
}
