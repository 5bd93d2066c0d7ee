//! Configuration of the scoring strategies.

use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::pheno::algos::phenomizer::Combiner;
use crate::pheno::algos::similarity::SimilarityMethod;
use crate::pheno::embed::DistanceMetric;
use crate::pheno::fusion::{FusionMethod, Weights};
use crate::pheno::ontology::TermId;

/// Terms excluded with their descendants unless configured otherwise.
///
/// Behavior, face, digit, ear and eye morphology are largely covered by the
/// face component and would otherwise be counted twice.
pub const DEFAULT_EXCLUDED_TERMS: &[&str] = &[
    "HP:0000708",
    "HP:0000271",
    "HP:0011297",
    "HP:0031703",
    "HP:0012372",
];

fn default_excluded_terms() -> Vec<TermId> {
    DEFAULT_EXCLUDED_TERMS
        .iter()
        .map(|&t| TermId::from(t))
        .collect()
}

fn default_exclude_term_args() -> Vec<String> {
    DEFAULT_EXCLUDED_TERMS.iter().map(|&t| t.to_string()).collect()
}

/// Strategies and parameters for comparing two cases.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Term similarity measure.
    pub similarity: SimilarityMethod,
    /// Aggregation of best-match scores.
    pub combiner: Combiner,
    /// Metric for face embeddings.
    pub metric: DistanceMetric,
    /// Combination of phenotype and face similarity.
    pub fusion: FusionMethod,
    /// Weights of phenotype and face similarity.
    pub weights: Weights,
    /// Terms that are removed, together with their descendants, from the
    /// phenotype sets before comparison.  Terms missing from the ontology
    /// are skipped with a warning.
    #[serde(default = "default_excluded_terms")]
    pub excluded_terms: Vec<TermId>,
    /// Whether to keep only the most specific terms of each set.
    #[serde(default)]
    pub remove_parents: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity: SimilarityMethod::default(),
            combiner: Combiner::default(),
            metric: DistanceMetric::default(),
            fusion: FusionMethod::default(),
            weights: Weights::default(),
            excluded_terms: default_excluded_terms(),
            remove_parents: false,
        }
    }
}

/// Command line arguments for the scoring configuration.
#[derive(clap::Args, Debug, Clone)]
pub struct ScoringArgs {
    /// Term similarity measure.
    #[arg(long, value_enum, default_value_t = SimilarityMethod::default())]
    pub similarity: SimilarityMethod,
    /// Aggregation of the best-match scores of both term sets.
    #[arg(long, value_enum, default_value_t = Combiner::default())]
    pub combiner: Combiner,
    /// Metric for comparing face embeddings.
    #[arg(long, value_enum, default_value_t = DistanceMetric::default())]
    pub metric: DistanceMetric,
    /// Combination of phenotype and face similarity.
    #[arg(long, value_enum, default_value_t = FusionMethod::default())]
    pub fusion: FusionMethod,
    /// Weight of the phenotype similarity.
    #[arg(long, default_value_t = 1.0)]
    pub weight_phenotype: f64,
    /// Weight of the face similarity.
    #[arg(long, default_value_t = 1.0)]
    pub weight_face: f64,
    /// Exclude this term and all descendants from the term sets; may be
    /// given multiple times and replaces the default list.
    #[arg(long, default_values_t = default_exclude_term_args())]
    pub exclude_term: Vec<String>,
    /// Do not exclude any terms.
    #[arg(long, default_value_t = false, conflicts_with = "exclude_term")]
    pub keep_all_terms: bool,
    /// Keep only the most specific terms of each term set.
    #[arg(long, default_value_t = false)]
    pub remove_parents: bool,
}

impl TryFrom<&ScoringArgs> for ScoringConfig {
    type Error = Error;

    fn try_from(args: &ScoringArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            similarity: args.similarity,
            combiner: args.combiner,
            metric: args.metric,
            fusion: args.fusion,
            weights: Weights::new(args.weight_phenotype, args.weight_face)?,
            excluded_terms: if args.keep_all_terms {
                Vec::new()
            } else {
                args.exclude_term
                    .iter()
                    .map(|t| TermId::from(t.as_str()))
                    .collect()
            },
            remove_parents: args.remove_parents,
        })
    }
}
