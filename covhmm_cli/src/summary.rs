use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueHint};
use covhmm::bins::SizeBins;
use covhmm::summary::{
    build_summary_tables, CategoryType, ComparisonType, MetricType, SummaryOptions,
};
use covhmm::track::{ContigBlocks, CoverageHeader};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

/// Build annotation- and size-stratified confusion tables from a labeled
/// track.
#[derive(Parser)]
pub struct Opts {
    /// Path to the input coverage track (`.cov` or `.cov.gz`).
    #[arg(long, short, value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Output TSV path.
    #[arg(long, short, value_hint = ValueHint::FilePath)]
    output: PathBuf,
    /// Tab-delimited size bins `start<TAB>end<TAB>name`, half-open; the
    /// default is one `[0, 1e9)` bin named `ALL`.
    #[arg(long, value_hint = ValueHint::FilePath)]
    bin_array_file: Option<PathBuf>,
    /// Minimum overlap ratio for a segment to count as a hit in
    /// overlap-based tables.
    #[arg(default_value_t = 0.4, long)]
    overlap_ratio_threshold: f64,
}

struct TablePlan {
    metric: MetricType,
    category_type: CategoryType,
    comparison: ComparisonType,
    prefix_metric: &'static str,
}

fn write_plan(
    writer: &mut impl std::io::Write,
    contigs: &[ContigBlocks],
    header: &CoverageHeader,
    bins: &SizeBins,
    threshold: f64,
    plan: &TablePlan,
) -> Result<()> {
    let category_names = match plan.category_type {
        CategoryType::Annotation => header.annotation_names.clone(),
        CategoryType::Region => (0..header.num_regions())
            .map(|region| format!("region_{region}"))
            .collect(),
    };
    let options = SummaryOptions {
        category_type: plan.category_type,
        category_names,
        bins: bins.clone(),
        metric: plan.metric,
        overlap_threshold: threshold,
        num_labels_with_unknown: header.num_labels,
        label_names: None,
        comparison: plan.comparison,
    };
    let tables = build_summary_tables(contigs, &options)?;
    let prefix = format!(
        "{}\t{}\t{}",
        plan.prefix_metric,
        plan.metric.name(),
        plan.category_type.name()
    );
    tables.write_into(writer, &prefix)?;
    tables.write_percentage_into(writer, &format!("{prefix}_percentage"))?;
    tables.write_total_per_row_into(writer, &format!("{prefix}_total"))?;
    Ok(())
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        helpers::check_tsv_output(&self.output)?;
        let (header, contigs) = helpers::read_track(&self.input)?;
        if !(header.is_truth_available && header.is_prediction_available) {
            bail!("summary tables need both truth and prediction labels in the track");
        }
        if header.num_labels < 2 {
            bail!("the track header declares fewer than two labels");
        }
        let bins = match &self.bin_array_file {
            Some(path) => SizeBins::from_file(path)?,
            None => SizeBins::default(),
        };

        let mut writer = BufWriter::new(File::create(&self.output).with_context(|| {
            format!("unable to create '{}'", self.output.display())
        })?);

        let plans = [
            TablePlan {
                metric: MetricType::BaseLevel,
                category_type: CategoryType::Annotation,
                comparison: ComparisonType::PredictionVsTruth,
                prefix_metric: "precision",
            },
            TablePlan {
                metric: MetricType::OverlapBased,
                category_type: CategoryType::Annotation,
                comparison: ComparisonType::PredictionVsTruth,
                prefix_metric: "precision",
            },
            TablePlan {
                metric: MetricType::BaseLevel,
                category_type: CategoryType::Annotation,
                comparison: ComparisonType::TruthVsPrediction,
                prefix_metric: "recall",
            },
            TablePlan {
                metric: MetricType::OverlapBased,
                category_type: CategoryType::Annotation,
                comparison: ComparisonType::TruthVsPrediction,
                prefix_metric: "recall",
            },
            TablePlan {
                metric: MetricType::BaseLevel,
                category_type: CategoryType::Region,
                comparison: ComparisonType::PredictionVsTruth,
                prefix_metric: "precision",
            },
            TablePlan {
                metric: MetricType::BaseLevel,
                category_type: CategoryType::Region,
                comparison: ComparisonType::TruthVsPrediction,
                prefix_metric: "recall",
            },
        ];
        for plan in &plans {
            write_plan(
                &mut writer,
                &contigs,
                &header,
                &bins,
                self.overlap_ratio_threshold,
                plan,
            )?;
        }
        info!(output = %self.output.display(), "summary tables written");
        Ok(ExitCode::SUCCESS)
    }
}
