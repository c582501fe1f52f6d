//! Result formatting: year labels, unit conversion and the optional pivot.
//!
//! Consumes the merged `(FID, code, sum)` rows and produces the final output
//! schema. Codes follow the fixed contract: `-1` excluded by the density
//! threshold, `0` baseline, `n >= 1` loss in year `2000 + n`. Output rows are
//! ordered by descending FID, codes ascending within a feature.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::batch::MergedRow;
use crate::raster::{EXCLUDED_CODE, M2_PER_HECTARE};
use crate::tables::{Column, ColumnKind, Row, TableSchema, Value};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Carbon fraction of dry biomass.
pub const CARBON_FRACTION: f64 = 0.5;
/// CO2-equivalence factor per unit carbon.
/// TODO: verify against an authoritative emissions methodology; kept as-is
/// for output compatibility with existing result tables.
pub const CO2_PER_CARBON: f64 = 3.67;

/// Mg biomass → Mt CO2 equivalent.
pub fn emissions_mt_co2(biomass_mg: f64) -> f64 {
    biomass_mg * CARBON_FRACTION * CO2_PER_CARBON / 1_000_000.0
}

// ── Labels ────────────────────────────────────────────────────────────────────

pub fn loss_label(code: i32) -> String {
    match code {
        c if c == EXCLUDED_CODE => "area outside threshold".to_string(),
        0 => "no loss".to_string(),
        n => format!("Year {}", 2000 + n),
    }
}

pub fn biomass_label(code: i32) -> String {
    match code {
        c if c == EXCLUDED_CODE => "biomass outside threshold".to_string(),
        0 => "no biomass loss".to_string(),
        n => format!("Year {}", 2000 + n),
    }
}

/// Output unit selected for the pivoted biomass table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputUnit {
    BiomassMg,
    Co2Mt,
}

// ── Output table ──────────────────────────────────────────────────────────────

/// A fully formatted output table, ready to be written to a table store.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTable {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

/// Label fields per FID, copied through from the input features.
pub type LabelFields = BTreeMap<i64, BTreeMap<String, String>>;

/// Sorted union of label keys across all features.
fn label_columns(labels: &LabelFields) -> Vec<String> {
    let mut keys = BTreeSet::new();
    for fields in labels.values() {
        keys.extend(fields.keys().cloned());
    }
    keys.into_iter().collect()
}

fn label_values(labels: &LabelFields, fid: i64, keys: &[String]) -> Vec<Value> {
    keys.iter()
        .map(|k| {
            let v = labels
                .get(&fid)
                .and_then(|fields| fields.get(k))
                .cloned()
                .unwrap_or_default();
            Value::Text(v)
        })
        .collect()
}

/// Merged rows sorted by descending FID, ascending code within a feature.
fn ordered(rows: &[MergedRow]) -> Vec<MergedRow> {
    let mut sorted = rows.to_vec();
    sorted.sort_by(|a, b| b.fid.cmp(&a.fid).then(a.code.cmp(&b.code)));
    sorted
}

// ── Flat tables ───────────────────────────────────────────────────────────────

/// Flat tree-cover-loss table: `(FID, YEAR, TCD, LOSS_HA, labels...)`,
/// with `LOSS_HA = sum_m2 / 10_000`.
pub fn format_loss(rows: &[MergedRow], tcd_threshold: i64, labels: &LabelFields) -> OutputTable {
    let keys = label_columns(labels);
    let mut columns = vec![
        Column::new("FID", ColumnKind::Integer),
        Column::new("YEAR", ColumnKind::Text),
        Column::new("TCD", ColumnKind::Integer),
        Column::new("LOSS_HA", ColumnKind::Double),
    ];
    columns.extend(keys.iter().map(|k| Column::new(k, ColumnKind::Text)));

    let out_rows = ordered(rows)
        .into_iter()
        .map(|r| {
            let mut row = vec![
                Value::Int(r.fid),
                Value::Text(loss_label(r.code)),
                Value::Int(tcd_threshold),
                Value::Float(r.sum / M2_PER_HECTARE),
            ];
            row.extend(label_values(labels, r.fid, &keys));
            row
        })
        .collect();

    OutputTable {
        schema: TableSchema::new(columns),
        rows: out_rows,
    }
}

/// Flat biomass-loss table:
/// `(FID, YEAR, TCD, BIOMASS_LOSS_MG, EMISSIONS_MT_CO2, labels...)`.
pub fn format_biomass(
    rows: &[MergedRow],
    tcd_threshold: i64,
    labels: &LabelFields,
) -> OutputTable {
    let keys = label_columns(labels);
    let mut columns = vec![
        Column::new("FID", ColumnKind::Integer),
        Column::new("YEAR", ColumnKind::Text),
        Column::new("TCD", ColumnKind::Integer),
        Column::new("BIOMASS_LOSS_MG", ColumnKind::Double),
        Column::new("EMISSIONS_MT_CO2", ColumnKind::Double),
    ];
    columns.extend(keys.iter().map(|k| Column::new(k, ColumnKind::Text)));

    let out_rows = ordered(rows)
        .into_iter()
        .map(|r| {
            let mut row = vec![
                Value::Int(r.fid),
                Value::Text(biomass_label(r.code)),
                Value::Int(tcd_threshold),
                Value::Float(r.sum),
                Value::Float(emissions_mt_co2(r.sum)),
            ];
            row.extend(label_values(labels, r.fid, &keys));
            row
        })
        .collect();

    OutputTable {
        schema: TableSchema::new(columns),
        rows: out_rows,
    }
}

// ── Pivot ─────────────────────────────────────────────────────────────────────

/// Pivot merged rows to one row per `(FID, TCD)` with one Double column per
/// distinct label, ordered by ascending code. Labels not produced by a
/// feature are zero-filled.
fn pivot_table(
    rows: &[MergedRow],
    tcd_threshold: i64,
    labels: &LabelFields,
    label_of: fn(i32) -> String,
    value_of: impl Fn(f64) -> f64,
) -> OutputTable {
    let codes: BTreeSet<i32> = rows.iter().map(|r| r.code).collect();
    let keys = label_columns(labels);

    let mut columns = vec![
        Column::new("FID", ColumnKind::Integer),
        Column::new("TCD", ColumnKind::Integer),
    ];
    columns.extend(codes.iter().map(|&c| Column::new(&label_of(c), ColumnKind::Double)));
    columns.extend(keys.iter().map(|k| Column::new(k, ColumnKind::Text)));

    // fid → code → value; BTreeMap in reverse later for descending FID.
    let mut per_fid: BTreeMap<i64, BTreeMap<i32, f64>> = BTreeMap::new();
    for r in rows {
        *per_fid
            .entry(r.fid)
            .or_default()
            .entry(r.code)
            .or_insert(0.0) += value_of(r.sum);
    }

    let out_rows = per_fid
        .iter()
        .rev()
        .map(|(&fid, values)| {
            let mut row = vec![Value::Int(fid), Value::Int(tcd_threshold)];
            row.extend(
                codes
                    .iter()
                    .map(|c| Value::Float(values.get(c).copied().unwrap_or(0.0))),
            );
            row.extend(label_values(labels, fid, &keys));
            row
        })
        .collect();

    OutputTable {
        schema: TableSchema::new(columns),
        rows: out_rows,
    }
}

/// Pivoted tree-cover-loss table: values are `LOSS_HA`.
pub fn pivot_loss(rows: &[MergedRow], tcd_threshold: i64, labels: &LabelFields) -> OutputTable {
    pivot_table(rows, tcd_threshold, labels, loss_label, |sum| {
        sum / M2_PER_HECTARE
    })
}

/// Pivoted biomass-loss table: values are the selected output unit.
pub fn pivot_biomass(
    rows: &[MergedRow],
    tcd_threshold: i64,
    unit: OutputUnit,
    labels: &LabelFields,
) -> OutputTable {
    match unit {
        OutputUnit::BiomassMg => pivot_table(rows, tcd_threshold, labels, biomass_label, |s| s),
        OutputUnit::Co2Mt => {
            pivot_table(rows, tcd_threshold, labels, biomass_label, emissions_mt_co2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn no_labels() -> LabelFields {
        LabelFields::new()
    }

    #[test]
    fn loss_labels_follow_code_contract() {
        assert_eq!(loss_label(-1), "area outside threshold");
        assert_eq!(loss_label(0), "no loss");
        assert_eq!(loss_label(5), "Year 2005");
        assert_eq!(loss_label(23), "Year 2023");
    }

    #[test]
    fn biomass_labels_follow_code_contract() {
        assert_eq!(biomass_label(-1), "biomass outside threshold");
        assert_eq!(biomass_label(0), "no biomass loss");
        assert_eq!(biomass_label(12), "Year 2012");
    }

    #[test]
    fn loss_table_threshold_30_example() {
        // Classification codes {-1, 0, 5} with sums {20, 15, 42} m².
        let rows = vec![
            MergedRow { fid: 1, code: -1, sum: 20.0 },
            MergedRow { fid: 1, code: 0, sum: 15.0 },
            MergedRow { fid: 1, code: 5, sum: 42.0 },
        ];
        let out = format_loss(&rows, 30, &no_labels());
        assert_eq!(
            out.schema.column_names(),
            vec!["FID", "YEAR", "TCD", "LOSS_HA"]
        );
        assert_eq!(out.rows.len(), 3);
        let expected = [
            ("area outside threshold", 20.0 / 10_000.0),
            ("no loss", 15.0 / 10_000.0),
            ("Year 2005", 42.0 / 10_000.0),
        ];
        for (row, (label, ha)) in out.rows.iter().zip(expected) {
            assert_eq!(row[1].as_str().unwrap(), label);
            assert_eq!(row[2].as_i64().unwrap(), 30);
            assert_relative_eq!(row[3].as_f64().unwrap(), ha);
        }
    }

    #[test]
    fn biomass_two_megatonnes_emits_3_67() {
        let rows = vec![MergedRow { fid: 4, code: 7, sum: 2_000_000.0 }];
        let out = format_biomass(&rows, 30, &no_labels());
        assert_relative_eq!(out.rows[0][3].as_f64().unwrap(), 2_000_000.0);
        assert_relative_eq!(out.rows[0][4].as_f64().unwrap(), 3.67);
    }

    #[test]
    fn flat_output_ordered_by_descending_fid() {
        let rows = vec![
            MergedRow { fid: 1, code: 0, sum: 1.0 },
            MergedRow { fid: 3, code: 2, sum: 1.0 },
            MergedRow { fid: 3, code: 0, sum: 1.0 },
            MergedRow { fid: 2, code: 0, sum: 1.0 },
        ];
        let out = format_loss(&rows, 30, &no_labels());
        let fids: Vec<i64> = out.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(fids, vec![3, 3, 2, 1]);
        // Within FID 3, codes ascend.
        assert_eq!(out.rows[0][1].as_str().unwrap(), "no loss");
        assert_eq!(out.rows[1][1].as_str().unwrap(), "Year 2002");
    }

    #[test]
    fn labels_copied_onto_rows() {
        let rows = vec![MergedRow { fid: 1, code: 0, sum: 1.0 }];
        let mut labels = LabelFields::new();
        labels.insert(1, [("name".to_string(), "Block A".to_string())].into());
        let out = format_loss(&rows, 30, &labels);
        assert_eq!(
            out.schema.column_names(),
            vec!["FID", "YEAR", "TCD", "LOSS_HA", "name"]
        );
        assert_eq!(out.rows[0][4].as_str().unwrap(), "Block A");
    }

    #[test]
    fn pivot_one_row_per_fid_zero_filled() {
        let rows = vec![
            MergedRow { fid: 1, code: 0, sum: 10_000.0 },
            MergedRow { fid: 1, code: 5, sum: 20_000.0 },
            MergedRow { fid: 2, code: 5, sum: 30_000.0 },
        ];
        let out = pivot_loss(&rows, 30, &no_labels());
        assert_eq!(
            out.schema.column_names(),
            vec!["FID", "TCD", "no loss", "Year 2005"]
        );
        assert_eq!(out.rows.len(), 2);
        // Descending FID: row 0 is FID 2, which produced no code 0.
        assert_eq!(out.rows[0][0].as_i64().unwrap(), 2);
        assert_relative_eq!(out.rows[0][2].as_f64().unwrap(), 0.0);
        assert_relative_eq!(out.rows[0][3].as_f64().unwrap(), 3.0);
        assert_relative_eq!(out.rows[1][2].as_f64().unwrap(), 1.0);
        assert_relative_eq!(out.rows[1][3].as_f64().unwrap(), 2.0);
    }

    #[test]
    fn pivot_round_trip_reproduces_flat_values() {
        let rows = vec![
            MergedRow { fid: 1, code: -1, sum: 111.0 },
            MergedRow { fid: 1, code: 3, sum: 222.0 },
            MergedRow { fid: 2, code: 0, sum: 333.0 },
            MergedRow { fid: 2, code: 3, sum: 444.0 },
        ];
        let flat = format_loss(&rows, 30, &no_labels());
        let piv = pivot_loss(&rows, 30, &no_labels());

        // Un-pivot: every non-zero (fid, label, value) cell must appear in
        // the flat table with the same value.
        let label_cols = &piv.schema.columns[2..];
        for row in &piv.rows {
            let fid = row[0].as_i64().unwrap();
            for (col, cell) in label_cols.iter().zip(&row[2..]) {
                let v = cell.as_f64().unwrap();
                if v == 0.0 {
                    continue;
                }
                let matched = flat.rows.iter().any(|f| {
                    f[0].as_i64() == Some(fid)
                        && f[1].as_str() == Some(col.name.as_str())
                        && (f[3].as_f64().unwrap() - v).abs() < 1e-12
                });
                assert!(matched, "pivot cell ({fid}, {}) = {v} missing from flat", col.name);
            }
        }
        // And the flat table has no extra non-zero rows.
        let nonzero_flat = flat
            .rows
            .iter()
            .filter(|f| f[3].as_f64().unwrap() != 0.0)
            .count();
        let nonzero_piv: usize = piv
            .rows
            .iter()
            .map(|r| r[2..].iter().filter(|c| c.as_f64().unwrap() != 0.0).count())
            .sum();
        assert_eq!(nonzero_flat, nonzero_piv);
    }

    #[test]
    fn pivot_biomass_unit_selects_value_column() {
        let rows = vec![MergedRow { fid: 1, code: 2, sum: 2_000_000.0 }];
        let mg = pivot_biomass(&rows, 30, OutputUnit::BiomassMg, &no_labels());
        let co2 = pivot_biomass(&rows, 30, OutputUnit::Co2Mt, &no_labels());
        assert_relative_eq!(mg.rows[0][2].as_f64().unwrap(), 2_000_000.0);
        assert_relative_eq!(co2.rows[0][2].as_f64().unwrap(), 3.67);
    }
}
