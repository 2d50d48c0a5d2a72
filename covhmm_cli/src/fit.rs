use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueHint};
use covhmm::accelerator::fit_accelerated;
use covhmm::config::{ModelConfig, ModelType};
use covhmm::em::{fit, run_forward_backward_all, EmChunk};
use covhmm::hmm::Hmm;
use covhmm::state::StateSpace;
use covhmm::track::{
    chunks_from_blocks, open_writer, write_track, ContigBlocks, TrackBlock,
};
use covhmm::transition::TransitionRequirements;
use ndarray::Array2;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

/// Fit a coverage-state model to a track and write posteriors and
/// parameters.
#[derive(Parser)]
pub struct Opts {
    /// Path to the input coverage track (`.cov` or `.cov.gz`).
    #[arg(long, short, value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Directory receiving the output files.
    #[arg(long, short, value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,
    /// Emission model family: `gaussian`, `negative_binomial` or
    /// `trunc_exp_gaussian`.
    #[arg(default_value = "gaussian", long)]
    model_type: String,
    /// Number of mixture components of the collapsed state.
    #[arg(default_value_t = 4, long, value_name = "K")]
    collapsed_comps: usize,
    /// Leave out the misjoin state.
    #[arg(long)]
    exclude_misjoin: bool,
    /// Maximum number of EM iterations (accelerated cycles count as four).
    #[arg(default_value_t = 100, long)]
    max_iterations: usize,
    /// Accelerate EM with SQUAREM extrapolation.
    #[arg(long)]
    accelerate: bool,
    /// Probability of staying in the same state in the initial transition
    /// matrix.
    #[arg(default_value_t = 0.99, long)]
    diagonal_prob: f64,
    /// Diagonal auto-regressive coupling between adjacent observations.
    #[arg(default_value_t = 0.0, long)]
    alpha: f64,
    /// Maximum high-MAPQ coverage ratio allowed for the duplicated state.
    #[arg(default_value_t = 0.25, long)]
    max_high_mapq_ratio: f64,
    /// Minimum high-MAPQ coverage ratio required for the collapsed state.
    #[arg(default_value_t = 0.75, long)]
    min_high_mapq_ratio: f64,
    /// Minimum highly-clipped coverage ratio required for the misjoin
    /// state.
    #[arg(default_value_t = 0.3, long)]
    min_highly_clipped_ratio: f64,
    /// Tab-delimited pseudo-count matrix added to the transition counts.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pseudo_counts: Option<PathBuf>,
    /// Mean read length in bases, used for the contig-end coverage
    /// adjustment.
    #[arg(default_value_t = 0, long)]
    mean_read_length: u32,
    /// Read fraction controlling the contig-end ramp; `0` disables the
    /// adjustment.
    #[arg(default_value_t = 0.0, long)]
    min_read_fraction_at_ends: f64,
    /// Window length in bases for re-windowing coverage runs.
    #[arg(default_value_t = 1000, long)]
    window_len: u32,
    /// Maximum number of windows per chunk.
    #[arg(default_value_t = 20_000, long)]
    chunk_len: usize,
    /// JSON file overriding the model constants.
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

impl Opts {
    fn state_means(&self, state_space: StateSpace) -> Vec<Vec<f64>> {
        // unit-coverage shape, scaled per region by its reference coverage
        let mut means = vec![
            vec![0.1],
            vec![0.5],
            vec![1.0],
            (0..self.collapsed_comps).map(|k| 2.0 + k as f64).collect(),
        ];
        if !state_space.excludes_misjoin() {
            means.push(vec![1.0]);
        }
        means
    }
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let model_type: ModelType = self.model_type.parse()?;
        let config = match &self.config {
            Some(path) => ModelConfig::from_json_file(path)?,
            None => ModelConfig::default(),
        };
        let (header, contigs) = helpers::read_track(&self.input)?;
        if header.num_regions() == 0 {
            bail!("the track header declares no regions");
        }

        let state_space = StateSpace::new(self.exclude_misjoin);
        let num_states = state_space.len();
        let mean_scale_per_region: Vec<f64> = header
            .region_coverages
            .iter()
            .map(|&coverage| f64::from(coverage.max(1)))
            .collect();
        let requirements = TransitionRequirements {
            min_highly_clipped_ratio: self.min_highly_clipped_ratio,
            max_high_mapq_ratio: self.max_high_mapq_ratio,
            min_high_mapq_ratio: self.min_high_mapq_ratio,
        };
        let mut alpha = Array2::zeros((num_states + 1, num_states + 1));
        for state in 0..num_states {
            alpha[[state, state]] = self.alpha;
        }

        let mut model = Hmm::new(
            model_type,
            &self.state_means(state_space),
            &mean_scale_per_region,
            requirements,
            Some(self.diagonal_prob),
            alpha,
            state_space,
            config,
        )?;
        if let Some(path) = &self.pseudo_counts {
            model.parse_pseudo_counts_from_file(path)?;
        }

        let mut chunks: Vec<EmChunk> =
            chunks_from_blocks(&contigs, self.window_len, self.chunk_len)
                .into_iter()
                .map(|chunk| {
                    let mut em = EmChunk::new(chunk, &model, self.mean_read_length);
                    em.set_min_read_fraction_at_ends(self.min_read_fraction_at_ends);
                    em
                })
                .collect();
        if chunks.is_empty() {
            bail!("the track '{}' contains no observations", self.input.display());
        }
        info!(
            chunks = chunks.len(),
            regions = header.num_regions(),
            states = num_states,
            "starting EM"
        );

        let converged = if self.accelerate {
            fit_accelerated(&mut model, &mut chunks, self.max_iterations.div_ceil(4))?
        } else {
            fit(&mut model, &mut chunks, self.max_iterations)?
        };
        info!(
            converged,
            log_likelihood = model.log_likelihood(),
            "EM finished"
        );
        if !model.is_feasible() {
            bail!("the fitted model has infeasible parameters");
        }

        // refresh posteriors under the final parameters
        run_forward_backward_all(&mut model, &mut chunks)?;

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("unable to create directory '{}'", self.output_dir.display())
        })?;
        let mut emission_out = open_writer(&self.output_dir.join("emission_parameters.tsv"))?;
        model.write_emission_tsv(&mut emission_out)?;
        let mut transition_out = open_writer(&self.output_dir.join("transition_matrices.tsv"))?;
        model.write_transition_tsv(&mut transition_out)?;
        let mut posterior_out = open_writer(&self.output_dir.join("posteriors.tsv"))?;
        for em in &chunks {
            em.write_posterior_tsv(&mut posterior_out)?;
        }

        // a copy of the track with the most probable state as prediction
        let mut predicted_header = header;
        predicted_header.is_prediction_available = true;
        predicted_header.num_labels = num_states + 1;
        let mut predicted: Vec<ContigBlocks> = Vec::new();
        for em in &chunks {
            let blocks: Vec<TrackBlock> = (0..em.chunk().len())
                .map(|column| {
                    let (start, end) = em.chunk().window_span(column);
                    let mut info = em.chunk().infos()[column];
                    info.prediction_label = Some(em.most_probable_state(column) as u8);
                    TrackBlock { start, end, info }
                })
                .collect();
            match predicted.last_mut() {
                Some(last) if last.contig == em.chunk().contig() => {
                    last.blocks.extend(blocks);
                }
                _ => predicted.push(ContigBlocks {
                    contig: em.chunk().contig().to_string(),
                    blocks,
                }),
            }
        }
        let mut prediction_out = open_writer(&self.output_dir.join("predictions.cov"))?;
        write_track(&mut prediction_out, &predicted_header, &predicted)?;

        Ok(ExitCode::SUCCESS)
    }
}
