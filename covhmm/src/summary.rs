//! Confusion tables stratified by annotation/region and segment size.
//!
//! A summary table compares a reference labeling against a query labeling
//! over annotated segments. The scanner walks the track blocks, finds
//! maximal runs on which the annotation flag, reference label and contig
//! are all constant, and adds each run's per-query-label base counts (or
//! their 0/1 overlap collapse) into the table selected by the annotation
//! and the size bin of the run.

use crate::bins::SizeBins;
use crate::error::{Error, Result};
use crate::track::{ContigBlocks, CoverageInfo};
use itertools::Itertools;
use ndarray::Array2;
use rayon::prelude::*;
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Whether a table counts bases or whole segments.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricType {
    /// Every base of a run contributes to its query-label column.
    BaseLevel,
    /// Each run contributes 0 or 1 per column depending on the overlap
    /// ratio; a run with no hit lands in the unknown column.
    OverlapBased,
}

impl MetricType {
    /// Name used in the TSV prefix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BaseLevel => "base-level",
            Self::OverlapBased => "overlap-based",
        }
    }
}

/// What the first table category enumerates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CategoryType {
    /// One table set per annotation flag.
    Annotation,
    /// One table set per region index.
    Region,
}

impl CategoryType {
    /// Name used in the TSV prefix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Annotation => "annotation",
            Self::Region => "region",
        }
    }
}

/// Which labeling forms the rows (reference) and columns (query).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComparisonType {
    /// Rows are predictions, columns truth: precision orientation.
    PredictionVsTruth,
    /// Rows are truth, columns predictions: recall orientation.
    TruthVsPrediction,
    /// Truth against itself; a consistency check.
    TruthVsTruth,
    /// Predictions against themselves; a consistency check.
    PredictionVsPrediction,
}

impl ComparisonType {
    fn ref_label(self, info: &CoverageInfo) -> Option<u8> {
        match self {
            Self::TruthVsPrediction | Self::TruthVsTruth => info.truth_label,
            Self::PredictionVsTruth | Self::PredictionVsPrediction => info.prediction_label,
        }
    }

    fn query_label(self, info: &CoverageInfo) -> Option<u8> {
        match self {
            Self::TruthVsPrediction | Self::PredictionVsPrediction => info.prediction_label,
            Self::PredictionVsTruth | Self::TruthVsTruth => info.truth_label,
        }
    }
}

/// One confusion table with a percentage mirror and per-row totals.
#[derive(Clone, Debug)]
pub struct SummaryTable {
    table: Array2<f64>,
    percentage: Array2<f64>,
    total_per_row: Vec<f64>,
    total_sum: f64,
}

impl SummaryTable {
    /// Creates a zeroed `rows x columns` table.
    #[must_use]
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            table: Array2::zeros((rows, columns)),
            percentage: Array2::zeros((rows, columns)),
            total_per_row: vec![0.0; rows],
            total_sum: 0.0,
        }
    }

    /// Adds `value` to one cell and refreshes the derived views.
    pub fn increment(&mut self, row: usize, column: usize, value: f64) {
        if value < 0.0 {
            warn!(row, column, value, "summary table is taking a negative value");
        }
        self.table[[row, column]] += value;
        self.total_per_row[row] += value;
        self.total_sum += value;
        if self.total_per_row[row] > 0.0 {
            for c in 0..self.table.ncols() {
                self.percentage[[row, c]] =
                    self.table[[row, c]] / self.total_per_row[row] * 100.0;
            }
        }
    }

    /// Returns one cell's count.
    #[must_use]
    pub fn value(&self, row: usize, column: usize) -> f64 {
        self.table[[row, column]]
    }

    /// Returns one cell's row percentage.
    #[must_use]
    pub fn percentage(&self, row: usize, column: usize) -> f64 {
        self.percentage[[row, column]]
    }

    /// Returns the total of one row.
    #[must_use]
    pub fn total_per_row(&self, row: usize) -> f64 {
        self.total_per_row[row]
    }

    fn row_string(&self, values: &Array2<f64>, row: usize) -> String {
        (0..values.ncols())
            .map(|c| format!("{:.2}", values[[row, c]]))
            .join("\t")
    }
}

/// A grid of summary tables indexed by `(category-1, category-2)`.
///
/// Every table sits behind its own mutex: the category scanners run in
/// parallel and increment the shared grid directly, each taking only the
/// lock of the table it touches.
#[derive(Debug)]
pub struct SummaryTableList {
    tables: Vec<Mutex<SummaryTable>>,
    category_names_1: Vec<String>,
    category_names_2: Vec<String>,
    num_rows: usize,
    num_columns: usize,
    row_names: Option<Vec<String>>,
}

impl Clone for SummaryTableList {
    fn clone(&self) -> Self {
        Self {
            tables: self
                .tables
                .iter()
                .map(|table| {
                    Mutex::new(table.lock().unwrap_or_else(PoisonError::into_inner).clone())
                })
                .collect(),
            category_names_1: self.category_names_1.clone(),
            category_names_2: self.category_names_2.clone(),
            num_rows: self.num_rows,
            num_columns: self.num_columns,
            row_names: self.row_names.clone(),
        }
    }
}

impl SummaryTableList {
    /// Creates zeroed tables for every category pair.
    #[must_use]
    pub fn new(
        category_names_1: Vec<String>,
        category_names_2: Vec<String>,
        num_rows: usize,
        num_columns: usize,
        row_names: Option<Vec<String>>,
    ) -> Self {
        let total = category_names_1.len() * category_names_2.len();
        Self {
            tables: (0..total)
                .map(|_| Mutex::new(SummaryTable::new(num_rows, num_columns)))
                .collect(),
            category_names_1,
            category_names_2,
            num_rows,
            num_columns,
            row_names,
        }
    }

    fn table_index(&self, cat1: usize, cat2: usize) -> usize {
        cat1 * self.category_names_2.len() + cat2
    }

    fn lock_table(&self, cat1: usize, cat2: usize) -> MutexGuard<'_, SummaryTable> {
        self.tables[self.table_index(cat1, cat2)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `value` to one cell of one table under that table's lock.
    pub fn increment(&self, cat1: usize, cat2: usize, row: usize, column: usize, value: f64) {
        self.lock_table(cat1, cat2).increment(row, column, value);
    }

    /// Returns one cell's count.
    #[must_use]
    pub fn value(&self, cat1: usize, cat2: usize, row: usize, column: usize) -> f64 {
        self.lock_table(cat1, cat2).value(row, column)
    }

    /// Returns one cell's row percentage.
    #[must_use]
    pub fn value_percentage(&self, cat1: usize, cat2: usize, row: usize, column: usize) -> f64 {
        self.lock_table(cat1, cat2).percentage(row, column)
    }

    fn row_label(&self, row: usize) -> String {
        self.row_names
            .as_ref()
            .map_or_else(|| row.to_string(), |names| names[row].clone())
    }

    fn write_tables(
        &self,
        writer: &mut impl Write,
        line_prefix: &str,
        percentage: bool,
    ) -> Result<()> {
        for (c1, c1_name) in self.category_names_1.iter().enumerate() {
            for (c2, c2_name) in self.category_names_2.iter().enumerate() {
                let table = self.lock_table(c1, c2);
                let values = if percentage { &table.percentage } else { &table.table };
                for row in 0..self.num_rows {
                    writeln!(
                        writer,
                        "{line_prefix}\t{c1_name}\t{c2_name}\t{}\t{}",
                        self.row_label(row),
                        table.row_string(values, row)
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Writes every table's counts as TSV with the given prefix columns.
    pub fn write_into(&self, writer: &mut impl Write, line_prefix: &str) -> Result<()> {
        self.write_tables(writer, line_prefix, false)
    }

    /// Writes every table's row percentages as TSV.
    pub fn write_percentage_into(&self, writer: &mut impl Write, line_prefix: &str) -> Result<()> {
        self.write_tables(writer, line_prefix, true)
    }

    /// Rebuilds counts from rows previously written by
    /// [`Self::write_into`] with the same prefix; other lines are skipped.
    /// The list must have the shape the rows were written from.
    pub fn read_counts_from(
        &self,
        reader: impl std::io::BufRead,
        line_prefix: &str,
    ) -> Result<()> {
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let Some(rest) = line
                .strip_prefix(line_prefix)
                .and_then(|rest| rest.strip_prefix('\t'))
            else {
                continue;
            };
            let parse_err = |reason: String| Error::Parse {
                path: "<summary table>".to_string(),
                line: line_no + 1,
                reason,
            };
            let fields: Vec<&str> = rest.split('\t').collect();
            if fields.len() != 3 + self.num_columns {
                return Err(parse_err(format!(
                    "expected {} columns, found {}",
                    3 + self.num_columns,
                    fields.len()
                )));
            }
            let cat1 = self
                .category_names_1
                .iter()
                .position(|name| name == fields[0])
                .ok_or_else(|| parse_err(format!("unknown category `{}`", fields[0])))?;
            let cat2 = self
                .category_names_2
                .iter()
                .position(|name| name == fields[1])
                .ok_or_else(|| parse_err(format!("unknown size bin `{}`", fields[1])))?;
            let row = self.row_names.as_ref().map_or_else(
                || fields[2].parse().ok(),
                |names| names.iter().position(|name| name == fields[2]),
            );
            let Some(row) = row.filter(|&row| row < self.num_rows) else {
                return Err(parse_err(format!("unknown row `{}`", fields[2])));
            };
            for (column, field) in fields[3..].iter().enumerate() {
                let value: f64 = field
                    .parse()
                    .map_err(|_| parse_err(format!("bad count `{field}`")))?;
                if value != 0.0 {
                    self.increment(cat1, cat2, row, column, value);
                }
            }
        }
        Ok(())
    }

    /// Writes the per-row totals of every table, one `ALL`-prefixed line
    /// per table.
    pub fn write_total_per_row_into(
        &self,
        writer: &mut impl Write,
        line_prefix: &str,
    ) -> Result<()> {
        for (c1, c1_name) in self.category_names_1.iter().enumerate() {
            for (c2, c2_name) in self.category_names_2.iter().enumerate() {
                let table = self.lock_table(c1, c2);
                let totals = (0..self.num_rows)
                    .map(|row| format!("{:.2}", table.total_per_row(row)))
                    .join("\t");
                writeln!(writer, "{line_prefix}\t{c1_name}\t{c2_name}\tALL\t{totals}")?;
            }
        }
        Ok(())
    }
}

/// Collapses a base-count confusion row to 0/1 hits by the overlap ratio;
/// when no column reaches the threshold the unknown column takes the hit.
fn convert_base_level_to_overlap_based(row: &mut [f64], run_length: f64, threshold: f64) {
    let mut at_least_one_hit = false;
    for value in row.iter_mut() {
        let ratio = *value / run_length;
        let hit = ratio >= threshold;
        at_least_one_hit |= hit;
        *value = if hit { 1.0 } else { 0.0 };
    }
    if !at_least_one_hit {
        // the last column is reserved for undefined labels
        *row.last_mut().expect("confusion row is never empty") = 1.0;
    }
}

/// Options for building a set of summary tables.
#[derive(Clone, Debug)]
pub struct SummaryOptions {
    /// Category enumerated by the first table index.
    pub category_type: CategoryType,
    /// Names of the first category's values.
    pub category_names: Vec<String>,
    /// Size bins for the second table index.
    pub bins: SizeBins,
    /// Base-level or overlap-based counting.
    pub metric: MetricType,
    /// Overlap ratio at or above which a segment counts as a hit.
    pub overlap_threshold: f64,
    /// Number of labels including the reserved unknown label.
    pub num_labels_with_unknown: usize,
    /// Optional label names used as row names.
    pub label_names: Option<Vec<String>>,
    /// Which labeling forms rows and columns.
    pub comparison: ComparisonType,
}

fn scan_one_category(
    contigs: &[ContigBlocks],
    options: &SummaryOptions,
    category_index: usize,
    list: &SummaryTableList,
) {
    let rows = options.num_labels_with_unknown;
    let columns = options.num_labels_with_unknown;

    let in_category = |info: &CoverageInfo| match options.category_type {
        CategoryType::Annotation => info.overlaps_annotation(category_index),
        CategoryType::Region => info.overlaps_region(category_index),
    };

    let mut confusion_row = vec![0.0_f64; columns];
    let mut run_start: u64 = 0;
    let mut pre_ref_label: Option<usize> = None;
    let mut pre_block_end: u64 = 0;
    let mut pre_info: Option<CoverageInfo> = None;
    let mut pre_contig: Option<&str> = None;

    let flush = |confusion_row: &mut [f64], ref_label: usize, run_length: u64| {
        let Some(bin) = options.bins.bin_index(run_length) else {
            warn!(run_length, "no size bin covers this run, skipping it");
            return;
        };
        if options.metric == MetricType::OverlapBased {
            convert_base_level_to_overlap_based(
                confusion_row,
                run_length as f64,
                options.overlap_threshold,
            );
        }
        for (column, &value) in confusion_row.iter().enumerate() {
            list.increment(category_index, bin, ref_label, column, value);
        }
    };

    for contig in contigs {
        for block in &contig.blocks {
            let info = block.info;
            let ref_label = options
                .comparison
                .ref_label(&info)
                .map_or(rows - 1, usize::from);
            let query_label = options
                .comparison
                .query_label(&info)
                .map_or(columns - 1, usize::from);

            let contig_changed =
                pre_contig.is_some_and(|pre| pre != contig.contig.as_str());
            let ref_label_changed = pre_ref_label != Some(ref_label);
            let annotation_in_current = in_category(&info);
            let annotation_in_previous = pre_info.as_ref().is_some_and(&in_category);
            let annotation_continued = annotation_in_current && annotation_in_previous;
            let annotation_started = annotation_in_current && !annotation_in_previous;
            let annotation_ended = !annotation_in_current && annotation_in_previous;

            // a maximal (annotation, reference label, contig) run has ended
            if let Some(pre_label) = pre_ref_label {
                if (annotation_continued && ref_label_changed)
                    || (annotation_in_previous && contig_changed)
                    || annotation_ended
                {
                    let run_length = pre_block_end - run_start + 1;
                    flush(&mut confusion_row, pre_label, run_length);
                }
            }

            if (!annotation_in_current && contig_changed) || annotation_ended {
                confusion_row.fill(0.0);
            }
            if (annotation_continued && ref_label_changed)
                || (annotation_in_current && contig_changed)
                || annotation_started
            {
                run_start = block.start;
                confusion_row.fill(0.0);
            }

            if annotation_in_current {
                confusion_row[query_label] += block.len() as f64;
            }

            pre_info = Some(info);
            pre_ref_label = Some(ref_label);
            pre_contig = Some(contig.contig.as_str());
            pre_block_end = block.end;
        }
    }

    // flush the final run if it still overlaps the category
    let annotation_in_last = pre_info.as_ref().is_some_and(&in_category);
    if let (true, Some(pre_label)) = (annotation_in_last, pre_ref_label) {
        let run_length = pre_block_end - run_start + 1;
        flush(&mut confusion_row, pre_label, run_length);
    }
}

/// Builds the full `(category-1, size-bin)` table grid from track blocks.
/// The category scanners run in parallel and fill the shared grid directly,
/// serialized per table by its lock.
pub fn build_summary_tables(
    contigs: &[ContigBlocks],
    options: &SummaryOptions,
) -> Result<SummaryTableList> {
    if options.num_labels_with_unknown < 2 {
        return Err(Error::Config(
            "at least one real label plus the unknown label is required".to_string(),
        ));
    }
    let list = SummaryTableList::new(
        options.category_names.clone(),
        options.bins.names().to_vec(),
        options.num_labels_with_unknown,
        options.num_labels_with_unknown,
        options.label_names.clone(),
    );
    (0..options.category_names.len())
        .into_par_iter()
        .for_each(|category_index| scan_one_category(contigs, options, category_index, &list));
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackBlock;
    use float_cmp::assert_approx_eq;

    fn annotated_info(truth: u8, prediction: u8) -> CoverageInfo {
        CoverageInfo {
            coverage: 30,
            annotation_flags: 1,
            truth_label: Some(truth),
            prediction_label: Some(prediction),
            ..CoverageInfo::default()
        }
    }

    fn split_run_contigs() -> Vec<ContigBlocks> {
        // a 100-base run with truth 1 everywhere and prediction 1 for the
        // first 60 bases, 2 for the remaining 40
        vec![ContigBlocks {
            contig: "ctg1".to_string(),
            blocks: vec![
                TrackBlock {
                    start: 1,
                    end: 60,
                    info: annotated_info(1, 1),
                },
                TrackBlock {
                    start: 61,
                    end: 100,
                    info: annotated_info(1, 2),
                },
            ],
        }]
    }

    fn options(metric: MetricType) -> SummaryOptions {
        SummaryOptions {
            category_type: CategoryType::Annotation,
            category_names: vec!["annot_0".to_string()],
            bins: SizeBins::default(),
            metric,
            overlap_threshold: 0.4,
            num_labels_with_unknown: 4,
            label_names: None,
            comparison: ComparisonType::TruthVsPrediction,
        }
    }

    #[test]
    fn base_level_counts_split_by_query_label() {
        let tables =
            build_summary_tables(&split_run_contigs(), &options(MetricType::BaseLevel)).unwrap();
        assert_approx_eq!(f64, tables.value(0, 0, 1, 1), 60.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 1, 2), 40.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 1, 3), 0.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 2, 1), 0.0, ulps = 2);
        // percentages mirror the counts
        assert_approx_eq!(f64, tables.value_percentage(0, 0, 1, 1), 60.0, ulps = 2);
        assert_approx_eq!(f64, tables.value_percentage(0, 0, 1, 2), 40.0, ulps = 2);
    }

    #[test]
    fn overlap_based_collapses_to_hits() {
        let tables =
            build_summary_tables(&split_run_contigs(), &options(MetricType::OverlapBased)).unwrap();
        // 60/100 and 40/100 both reach the 0.4 threshold
        assert_approx_eq!(f64, tables.value(0, 0, 1, 1), 1.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 1, 2), 1.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 1, 3), 0.0, ulps = 2);
    }

    #[test]
    fn no_hit_goes_to_unknown_column() {
        // the query labeling is split 20 bases each way: no ratio reaches 0.4
        let blocks = vec![ContigBlocks {
            contig: "ctg1".to_string(),
            blocks: (0..5_u64)
                .map(|i| TrackBlock {
                    start: i * 20 + 1,
                    end: (i + 1) * 20,
                    info: CoverageInfo {
                        coverage: 30,
                        annotation_flags: 1,
                        truth_label: Some(1),
                        prediction_label: (i < 4).then_some(i as u8),
                        ..CoverageInfo::default()
                    },
                })
                .collect(),
        }];
        let mut options = options(MetricType::OverlapBased);
        options.num_labels_with_unknown = 5;
        let tables = build_summary_tables(&blocks, &options).unwrap();
        assert_approx_eq!(f64, tables.value(0, 0, 1, 4), 1.0, ulps = 2);
        for column in 0..4 {
            assert_approx_eq!(f64, tables.value(0, 0, 1, column), 0.0, ulps = 2);
        }
    }

    #[test]
    fn contig_change_flushes_the_run() {
        let mut contigs = split_run_contigs();
        contigs.push(ContigBlocks {
            contig: "ctg2".to_string(),
            blocks: vec![TrackBlock {
                start: 1,
                end: 50,
                info: annotated_info(2, 2),
            }],
        });
        let tables =
            build_summary_tables(&contigs, &options(MetricType::BaseLevel)).unwrap();
        assert_approx_eq!(f64, tables.value(0, 0, 1, 1), 60.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 1, 2), 40.0, ulps = 2);
        assert_approx_eq!(f64, tables.value(0, 0, 2, 2), 50.0, ulps = 2);
    }

    #[test]
    fn unlabeled_windows_land_in_unknown_row() {
        let blocks = vec![ContigBlocks {
            contig: "ctg1".to_string(),
            blocks: vec![TrackBlock {
                start: 1,
                end: 30,
                info: CoverageInfo {
                    coverage: 10,
                    annotation_flags: 1,
                    truth_label: None,
                    prediction_label: Some(0),
                    ..CoverageInfo::default()
                },
            }],
        }];
        let tables = build_summary_tables(&blocks, &options(MetricType::BaseLevel)).unwrap();
        assert_approx_eq!(f64, tables.value(0, 0, 3, 0), 30.0, ulps = 2);
    }

    #[test]
    fn written_tables_re_parse_to_identical_counts() {
        let tables =
            build_summary_tables(&split_run_contigs(), &options(MetricType::BaseLevel)).unwrap();
        let mut buffer = Vec::new();
        tables.write_into(&mut buffer, "precision\tbase-level\tannotation").unwrap();

        let reread = SummaryTableList::new(
            vec!["annot_0".to_string()],
            vec!["ALL".to_string()],
            4,
            4,
            None,
        );
        reread
            .read_counts_from(buffer.as_slice(), "precision\tbase-level\tannotation")
            .unwrap();
        for row in 0..4 {
            for column in 0..4 {
                assert_approx_eq!(
                    f64,
                    reread.value(0, 0, row, column),
                    tables.value(0, 0, row, column),
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn tsv_writers_emit_prefixed_rows() {
        let tables =
            build_summary_tables(&split_run_contigs(), &options(MetricType::BaseLevel)).unwrap();
        let mut buffer = Vec::new();
        tables
            .write_into(&mut buffer, "precision\tbase-level\tannotation")
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("precision\tbase-level\tannotation\tannot_0\tALL\t1\t"));
        assert!(lines[1].ends_with("0.00\t60.00\t40.00\t0.00"));

        let mut totals = Vec::new();
        tables
            .write_total_per_row_into(&mut totals, "precision\tbase-level\tannotation")
            .unwrap();
        let text = String::from_utf8(totals).unwrap();
        assert!(text.contains("\tALL\t0.00\t100.00\t0.00\t0.00"));
    }
}
