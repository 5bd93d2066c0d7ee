//! Pairwise similarity matrix of a cohort.
//!
//! The matrix and the per-case mean similarity to affected and unaffected
//! cases serve as features for downstream classifiers.

use std::time::Instant;

use clap::Parser;
use tracing::info;

use crate::common::{init_thread_pool, trace_rss_now, write_json, VERSION};
use crate::pheno::case::load_cases;
use crate::pheno::compare::CaseScorer;
use crate::pheno::conf::{ScoringArgs, ScoringConfig};
use crate::pheno::ontology::OntologyGraph;
use crate::pheno::prepare::load_network;

/// Command line arguments for `pheno matrix` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Compute the similarity matrix of a cohort", long_about = None)]
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
    /// Path to output JSON file; printed to stdout if not given.
    #[arg(long)]
    pub path_output: Option<String>,

    /// Number of threads to use for scoring (default is 1 thread per core).
    #[arg(long)]
    pub num_threads: Option<usize>,

    #[command(flatten)]
    pub scoring: ScoringArgs,
}

/// Matrix result records.
pub mod matrix_result {
    use serde::{Deserialize, Serialize};

    use crate::pheno::compare::SimilarityMatrix;
    use crate::pheno::conf::ScoringConfig;

    /// Result container data structure.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Container {
        /// Version of the ontology.
        pub ontology_version: Option<String>,
        /// Version of the `phenoscore-worker` package.
        pub app_version: String,
        /// The scoring configuration used.
        pub config: ScoringConfig,
        /// Composite scores of all case pairs.
        pub matrix: SimilarityMatrix,
        /// Mean similarities per case, in matrix order.
        pub averages: Vec<CaseAverages>,
    }

    /// Mean similarity of one case to the labeled cases.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct CaseAverages {
        /// ID of the case.
        pub case_id: String,
        /// Label of the case, if any.
        #[serde(default = "Option::default")]
        pub affected: Option<bool>,
        /// Mean score against the other affected cases.
        #[serde(default = "Option::default")]
        pub mean_affected: Option<f64>,
        /// Mean score against the unaffected cases.
        #[serde(default = "Option::default")]
        pub mean_unaffected: Option<f64>,
    }
}

/// Main entry point for `pheno matrix` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    info!("args_common = {:?}", &args_common);
    info!("args = {:?}", &args);

    let config = ScoringConfig::try_from(&args.scoring)?;
    init_thread_pool(args.num_threads)?;

    info!("Loading ontology...");
    let before_loading = Instant::now();
    let ontology = OntologyGraph::load(&args.path_ontology)?;
    info!("...done loading ontology in {:?}", before_loading.elapsed());

    let cohort = load_cases(&args.path_cases)?;
    let network = load_network(args.path_embeddings.as_deref())?;

    trace_rss_now();

    info!("Scoring {} cases against each other...", cohort.len());
    let before_scoring = Instant::now();
    let scorer = CaseScorer::new(&ontology, network, config)?;
    let matrix = scorer.similarity_matrix(&cohort)?;
    let labels = cohort.iter().map(|c| c.affected).collect::<Vec<_>>();
    let averages = cohort
        .iter()
        .zip(matrix.group_averages(&labels))
        .map(|(case, avg)| matrix_result::CaseAverages {
            case_id: case.case_id.clone(),
            affected: case.affected,
            mean_affected: avg.affected,
            mean_unaffected: avg.unaffected,
        })
        .collect();
    info!("... done scoring in {:?}", before_scoring.elapsed());

    trace_rss_now();

    let result = matrix_result::Container {
        ontology_version: ontology.version().map(str::to_string),
        app_version: VERSION.to_string(),
        config: scorer.config().clone(),
        matrix,
        averages,
    };
    if let Some(path_output) = args.path_output.as_ref() {
        write_json(path_output, &result)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    info!("All done. Have a nice day!");
    Ok(())
}
