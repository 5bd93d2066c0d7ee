//! Code for preparing the empiric background score distribution.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{init_thread_pool, read_json, trace_rss_now, write_json, VERSION};
use crate::pheno::case::{load_cases, Case};
use crate::pheno::compare::CaseScorer;
use crate::pheno::conf::{ScoringArgs, ScoringConfig};
use crate::pheno::embed::{EmbeddingNetwork, EmbeddingTable};
use crate::pheno::ontology::OntologyGraph;
use crate::pheno::significance::{Background, Resampler, ResamplerBuilder};

/// Command line arguments for `pheno prepare` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Prepare background scores for `pheno compare`", long_about = None)]
pub struct Args {
    /// Path to the ontology JSON file.
    #[arg(long, required = true)]
    pub path_ontology: String,
    /// Path to the JSON file with the cohort cases.
    #[arg(long, required = true)]
    pub path_cases: String,
    /// Path to JSON file with precomputed face embeddings by image ID.
    #[arg(long)]
    pub path_embeddings: Option<String>,
    /// Path to the output JSON file (`.gz` for compression).
    #[arg(long, required = true)]
    pub path_output: String,

    /// Number of random case pairs to score (default is the cohort size).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_draws: Option<u64>,
    /// Seed for the random number generator.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Number of threads to use for scoring (default is 1 thread per core).
    #[arg(long)]
    pub num_threads: Option<usize>,

    #[command(flatten)]
    pub scoring: ScoringArgs,
}

/// Background file as written by `pheno prepare` and read by `pheno compare`.
///
/// Exactly one of `scores` and `cases` must be given.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BackgroundFile {
    /// Version of the ontology the scores were computed with.
    #[serde(default = "Option::default")]
    pub ontology_version: Option<String>,
    /// Version of the `phenoscore-worker` package.
    #[serde(default = "Option::default")]
    pub app_version: Option<String>,
    /// Master seed of the draws.
    #[serde(default = "Option::default")]
    pub seed: Option<u64>,
    /// Configuration the scores were computed with.
    #[serde(default = "Option::default")]
    pub config: Option<ScoringConfig>,
    /// Precomputed composite scores.
    #[serde(default = "Option::default")]
    pub scores: Option<Vec<f64>>,
    /// Raw background cases.
    #[serde(default = "Option::default")]
    pub cases: Option<Vec<Case>>,
}

impl BackgroundFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        read_json(path)
    }

    pub fn into_background(self) -> Result<Background, anyhow::Error> {
        match (self.scores, self.cases) {
            (Some(scores), None) => Ok(Background::Scores(scores)),
            (None, Some(cases)) => Ok(Background::Cases(cases)),
            _ => anyhow::bail!("background file must contain exactly one of `scores` or `cases`"),
        }
    }
}

/// Load the embedding table if given, otherwise use an empty one.
pub fn load_network(path: Option<&str>) -> Result<Arc<dyn EmbeddingNetwork>, anyhow::Error> {
    if let Some(path) = path {
        info!("Loading embeddings...");
        let before_loading = Instant::now();
        let table = EmbeddingTable::load(path)?;
        info!(
            "...done loading {} embeddings in {:?}",
            table.len(),
            before_loading.elapsed()
        );
        Ok(Arc::new(table))
    } else {
        info!("No embeddings given, only precomputed face vectors are used");
        Ok(Arc::new(EmbeddingTable::default()))
    }
}

/// Score random pairs of the cohort.
pub fn run_prepare(
    scorer: &CaseScorer,
    cohort: &[Case],
    resampler: &Resampler,
) -> Result<BackgroundFile, anyhow::Error> {
    let null = resampler.pairs(cohort, |a, b| {
        scorer.score(a, b).map(|composite| composite.score)
    })?;
    if null.excluded() > 0 {
        info!(
            "  {} of {} pairs could not be scored",
            null.excluded(),
            null.requested()
        );
    }

    Ok(BackgroundFile {
        ontology_version: scorer.ontology().version().map(str::to_string),
        app_version: Some(VERSION.to_string()),
        seed: Some(resampler.seed()),
        config: Some(scorer.config().clone()),
        scores: Some(null.scores().to_vec()),
        cases: None,
    })
}

/// Main entry point for `pheno prepare` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    info!("args_common = {:?}", &args_common);
    info!("args = {:?}", &args);

    let config = ScoringConfig::try_from(&args.scoring)?;
    init_thread_pool(args.num_threads)?;

    info!("Loading ontology...");
    let before_loading = Instant::now();
    let ontology = OntologyGraph::load(&args.path_ontology)?;
    info!(
        "...done loading {} terms in {:?}",
        ontology.len(),
        before_loading.elapsed()
    );

    info!("Loading cases...");
    let before_cases = Instant::now();
    let cohort = load_cases(&args.path_cases)?;
    info!(
        "...done loading {} cases in {:?}",
        cohort.len(),
        before_cases.elapsed()
    );
    let network = load_network(args.path_embeddings.as_deref())?;

    trace_rss_now();

    let seed = args.seed.unwrap_or_else(|| fastrand::u64(..));
    info!("Running simulations with seed {}...", seed);
    let before_simulations = Instant::now();
    let mut builder = ResamplerBuilder::default();
    builder.seed(seed);
    if let Some(num_draws) = args.num_draws {
        builder.num_draws(num_draws as usize);
    }
    let resampler = builder.build()?;
    let scorer = CaseScorer::new(&ontology, network, config)?;
    let background = run_prepare(&scorer, &cohort, &resampler)?;
    info!(
        "... done with {} simulations in {:?}",
        background.scores.as_ref().map(Vec::len).unwrap_or_default(),
        before_simulations.elapsed()
    );

    trace_rss_now();

    info!("Writing background scores...");
    write_json(&args.path_output, &background)?;

    info!("All done. Have a nice day!");
    Ok(())
}
