//! Pruning of case term sets to their most specific terms.
//!
//! Annotating a case with both a term and one of its ancestors adds no
//! information but biases the set similarity towards the ancestor.

use std::time::Instant;

use clap::Parser;
use itertools::Itertools;

use crate::err::Error;
use crate::pheno::case::{load_cases, Case};
use crate::pheno::ontology::OntologyGraph;

/// Command line arguments for `pheno prune` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Prune case terms to the most specific ones", long_about = None)]
pub struct Args {
    /// Path to the ontology JSON file.
    #[arg(long, required = true)]
    pub path_ontology: String,
    /// Path to the JSON file with the cases.
    #[arg(long, required = true)]
    pub path_cases: String,

    /// Path to the output cases JSON file.
    #[arg(long, required = true)]
    pub path_output: String,
}

/// Normalize the terms of each case and remove terms that are ancestors of
/// other terms of the same case.
fn prune_cases(ontology: &OntologyGraph, cases: Vec<Case>) -> Result<Vec<Case>, Error> {
    cases
        .into_iter()
        .map(|case| -> Result<Case, Error> {
            let terms = case.terms.normalized(ontology)?.without_parents(ontology)?;
            if terms.len() != case.terms.len() {
                tracing::debug!(
                    "case {}: pruned {} terms to {}",
                    case.case_id,
                    case.terms.len(),
                    terms.iter().join(", ")
                );
            }
            Ok(Case { terms, ..case })
        })
        .collect()
}

/// Main entry point for `pheno prune` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    tracing::info!("Loading ontology...");
    let before_loading = Instant::now();
    let ontology = OntologyGraph::load(&args.path_ontology)?;
    tracing::info!("...done loading ontology in {:?}", before_loading.elapsed());

    tracing::info!("Pruning cases...");
    let before_pruning = Instant::now();
    let cases = prune_cases(&ontology, load_cases(&args.path_cases)?)?;
    tracing::info!(
        "...done pruning {} cases in {:?}",
        cases.len(),
        before_pruning.elapsed()
    );

    tracing::info!("Writing pruned cases...");
    crate::common::write_json(&args.path_output, &cases)?;

    tracing::info!("All done. Have a nice day!");
    Ok(())
}
