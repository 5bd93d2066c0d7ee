//! Code for comparing two cases on the command line.

use std::time::Instant;

use clap::Parser;
use tracing::info;

use crate::common::{init_thread_pool, trace_rss_now, write_json, VERSION};
use crate::pheno::case::{find_case, load_cases, Case};
use crate::pheno::compare::{compare_cases, CaseScorer};
use crate::pheno::conf::{ScoringArgs, ScoringConfig};
use crate::pheno::ontology::{OntologyGraph, TermId};
use crate::pheno::prepare::{load_network, BackgroundFile};
use crate::pheno::significance::{Background, Resampler, ResamplerBuilder, Sampling};

/// Command line arguments for `pheno compare` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Compare two cases by phenotype and face", long_about = None)]
pub struct Args {
    /// Path to the ontology JSON file.
    #[arg(long, required = true)]
    pub path_ontology: String,
    /// Path to the JSON file with the cohort cases.
    #[arg(long, required = true)]
    pub path_cases: String,
    /// ID of the first case.
    #[arg(long, required = true)]
    pub case_a: String,
    /// ID of the second case.
    #[arg(long, required = true)]
    pub case_b: String,

    /// Path to background file from `pheno prepare` or with raw cases;
    /// default is to use the other cohort cases.
    #[arg(long)]
    pub path_background: Option<String>,
    /// Path to JSON file with precomputed face embeddings by image ID.
    #[arg(long)]
    pub path_embeddings: Option<String>,
    /// Path to output JSON file; printed to stdout if not given.
    #[arg(long)]
    pub path_output: Option<String>,

    /// Seed for the random number generator.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Number of background draws (default is all background cases).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_draws: Option<u64>,
    /// How to draw background cases.
    #[arg(long, value_enum, default_value_t = Sampling::default())]
    pub sampling: Sampling,
    /// Number of threads to use for resampling (default is 1 thread per core).
    #[arg(long)]
    pub num_threads: Option<usize>,

    #[command(flatten)]
    pub scoring: ScoringArgs,
}

/// Query result records.
pub mod query_result {
    use serde::{Deserialize, Serialize};

    use crate::pheno::conf::ScoringConfig;
    use crate::pheno::fusion::CompositeScore;
    use crate::pheno::ontology::TermId;
    use crate::pheno::significance::{Sampling, SignificanceResult};

    /// Result container data structure.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Container {
        /// Version of the ontology.
        pub ontology_version: Option<String>,
        /// Version of the `phenoscore-worker` package.
        pub app_version: String,
        /// The scoring configuration used.
        pub config: ScoringConfig,
        /// Master seed of the resampling.
        pub seed: u64,
        /// Sampling scheme of the resampling.
        pub sampling: Sampling,
        /// ID of the first case.
        pub case_a: String,
        /// ID of the second case.
        pub case_b: String,
        /// The composite score with its components.
        pub composite: CompositeScore,
        /// Significance of the composite score.
        pub significance: SignificanceResult,
        /// Best matching terms of the first case for the second case's terms.
        pub terms: Vec<TermDetails>,
    }

    /// Ontology term with label.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Term {
        /// The term ID.
        pub term_id: TermId,
        /// The term name (optional).
        #[serde(default = "Option::default")]
        pub term_name: Option<String>,
    }

    /// Detailed term scores.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct TermDetails {
        /// The term of the first case, if any is similar.
        pub term_a: Option<Term>,
        /// The term of the second case.
        pub term_b: Term,
        /// The similarity score.
        pub score: f64,
    }
}

fn term(ontology: &OntologyGraph, term_id: &TermId) -> query_result::Term {
    query_result::Term {
        term_id: term_id.clone(),
        term_name: ontology
            .term(term_id)
            .ok()
            .and_then(|t| t.name())
            .map(str::to_string),
    }
}

/// Run the actual comparison of the two cases.
pub fn run_query(
    scorer: &CaseScorer,
    a: &Case,
    b: &Case,
    background: &Background,
    resampler: &Resampler,
    sampling: Sampling,
) -> Result<query_result::Container, anyhow::Error> {
    let significance = compare_cases(scorer, a, b, background, resampler)?;
    let composite = significance
        .composite
        .ok_or_else(|| anyhow::anyhow!("no composite score in result"))?;

    let ontology = scorer.ontology();
    let terms = scorer
        .term_matches(a, b)?
        .into_iter()
        .map(|m| query_result::TermDetails {
            term_a: m.best_match.as_ref().map(|t| term(ontology, t)),
            term_b: term(ontology, &m.term),
            score: m.score,
        })
        .collect();

    Ok(query_result::Container {
        ontology_version: ontology.version().map(str::to_string),
        app_version: VERSION.to_string(),
        config: scorer.config().clone(),
        seed: resampler.seed(),
        sampling,
        case_a: a.case_id.clone(),
        case_b: b.case_id.clone(),
        composite,
        significance,
        terms,
    })
}

/// Load the background population.
///
/// Without a background file, the cohort cases other than the compared ones
/// are used.
fn load_background(
    args: &Args,
    cohort: &[Case],
    ontology: &OntologyGraph,
) -> Result<Background, anyhow::Error> {
    if let Some(path) = args.path_background.as_ref() {
        let file = BackgroundFile::load(path)?;
        if file.ontology_version.is_some()
            && file.ontology_version.as_deref() != ontology.version()
        {
            tracing::warn!(
                "background was computed with ontology {:?} but {:?} is used",
                file.ontology_version,
                ontology.version()
            );
        }
        file.into_background()
    } else {
        Ok(Background::Cases(
            cohort
                .iter()
                .filter(|c| c.case_id != args.case_a && c.case_id != args.case_b)
                .cloned()
                .collect(),
        ))
    }
}

/// Main entry point for `pheno compare` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    info!("args_common = {:?}", &args_common);
    info!("args = {:?}", &args);

    let config = ScoringConfig::try_from(&args.scoring)?;
    init_thread_pool(args.num_threads)?;

    info!("Loading ontology...");
    let before_loading = Instant::now();
    let ontology = OntologyGraph::load(&args.path_ontology)?;
    info!("...done loading ontology in {:?}", before_loading.elapsed());

    info!("Loading cases...");
    let before_cases = Instant::now();
    let cohort = load_cases(&args.path_cases)?;
    let a = find_case(&cohort, &args.case_a)?;
    let b = find_case(&cohort, &args.case_b)?;
    let background = load_background(args, &cohort, &ontology)?;
    info!("...done loading cases in {:?}", before_cases.elapsed());
    let network = load_network(args.path_embeddings.as_deref())?;

    trace_rss_now();

    let seed = args.seed.unwrap_or_else(|| fastrand::u64(..));
    info!("Comparing cases with seed {}...", seed);
    let before_query = Instant::now();
    let mut builder = ResamplerBuilder::default();
    builder.seed(seed).sampling(args.sampling);
    if let Some(num_draws) = args.num_draws {
        builder.num_draws(num_draws as usize);
    }
    let resampler = builder.build()?;
    let scorer = CaseScorer::new(&ontology, network, config)?;
    let result = run_query(&scorer, a, b, &background, &resampler, args.sampling)?;
    info!("... done comparing cases in {:?}", before_query.elapsed());

    trace_rss_now();

    if let Some(path_output) = args.path_output.as_ref() {
        write_json(path_output, &result)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    info!(
        "{: <10} | {: >10} | {: >10} | {: >10} | {: >10} | {: >8}",
        "case", "phenotype", "face", "composite", "P-value", "score"
    );
    info!(
        "{: <10} | {: >10.4} | {: >10} | {: >10.4} | {: >10.5} | {: >8.2}",
        format!("{}:{}", result.case_a, result.case_b),
        result.composite.phenotype,
        result
            .composite
            .face
            .map(|f| format!("{:.4}", f))
            .unwrap_or_else(|| "-".into()),
        result.composite.score,
        result.significance.p_value,
        result.significance.score,
    );
    info!(
        "background: {} of {} usable",
        result.significance.population_size, result.significance.requested_size
    );

    info!("All done. Have a nice day!");
    Ok(())
}
