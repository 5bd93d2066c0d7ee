//! Empirical significance of composite scores.
//!
//! The null distribution is either given as precomputed scores or built by
//! resampling comparisons against a background population of cases.  Every
//! draw derives its own seed from the master seed and the draw index, so the
//! draws can be run in parallel and the result does not depend on scheduling.

use derive_builder::Builder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::pheno::case::Case;
use crate::pheno::fusion::CompositeScore;

/// Background population to compare an observed score against.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Background {
    /// Precomputed composite scores.
    Scores(Vec<f64>),
    /// Raw cases; the null distribution is obtained by resampling.
    Cases(Vec<Case>),
}

/// Sorted null distribution with bookkeeping on excluded draws.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct NullDistribution {
    /// Scores in ascending order.
    scores: Vec<f64>,
    /// Number of draws (or scores) that were requested.
    requested: usize,
    /// Number of draws (or scores) that had to be excluded.
    excluded: usize,
}

impl NullDistribution {
    /// Build from precomputed scores; non-finite scores are excluded.
    pub fn from_scores(scores: Vec<f64>) -> Self {
        let requested = scores.len();
        let mut scores = scores
            .into_iter()
            .filter(|s| s.is_finite())
            .collect::<Vec<_>>();
        scores.sort_by(|a, b| a.total_cmp(b));
        Self {
            excluded: requested - scores.len(),
            scores,
            requested,
        }
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// Number of null scores greater than or equal to `observed`.
    pub fn count_at_least(&self, observed: f64) -> usize {
        let lower_bound = self.scores.partition_point(|x| *x < observed);
        self.scores.len() - lower_bound
    }
}

/// Result of the significance estimation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignificanceResult {
    /// The observed composite score.
    pub observed: f64,
    /// Breakdown of the observed score, if known.
    #[serde(default = "Option::default")]
    pub composite: Option<CompositeScore>,
    /// Empirical P-value `(#{null >= observed} + 1) / (n + 1)`.
    pub p_value: f64,
    /// The score `-10 * log10(p_value)`.
    pub score: f64,
    /// Number of null scores the P-value is computed over, after exclusions.
    pub population_size: usize,
    /// Number of draws made (or scores given) before exclusions; capped at
    /// the background size for sampling without replacement.
    pub requested_size: usize,
    /// Number of excluded draws (e.g., failed embeddings).
    pub excluded: usize,
}

/// Rank `observed` against the null distribution.
///
/// The P-value uses the add-one correction `(k + 1) / (n + 1)` where `k` is
/// the number of null scores `>= observed` and `n` the effective population
/// size.  It is never zero; the smallest reportable value is `1 / (n + 1)`,
/// and with an empty null distribution the P-value is `1`.
pub fn estimate_significance(observed: f64, null: &NullDistribution) -> SignificanceResult {
    let n = null.len();
    let k = null.count_at_least(observed);
    let p_value = (k + 1) as f64 / (n + 1) as f64;
    SignificanceResult {
        observed,
        composite: None,
        p_value,
        score: -10.0 * p_value.log10(),
        population_size: n,
        requested_size: null.requested(),
        excluded: null.excluded(),
    }
}

/// How background cases are drawn.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Sampling {
    /// Without replacement; all cases unless fewer draws are requested.
    #[default]
    Permutation,
    /// With replacement.
    Bootstrap,
}

/// Derive the seed of draw `idx` from the master seed (splitmix64).
pub fn draw_seed(seed: u64, idx: usize) -> u64 {
    let mut z = seed.wrapping_add((idx as u64).wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Seeded resampling of comparisons to build null distributions.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Resampler {
    /// Master seed.
    seed: u64,
    /// Number of draws; defaults to the population size.
    #[builder(default, setter(strip_option))]
    num_draws: Option<usize>,
    /// Sampling scheme for anchored resampling.
    #[builder(default)]
    sampling: Sampling,
}

impl ResamplerBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.num_draws {
            Some(Some(0)) => Err("number of draws must be positive".into()),
            _ => Ok(()),
        }
    }
}

impl Resampler {
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Indices of the background cases to compare against.
    ///
    /// Without replacement, at most `population` draws are made; asking for
    /// more is logged as a warning and the whole population is used.
    pub fn indices(&self, population: usize) -> Vec<usize> {
        if population == 0 {
            return Vec::new();
        }
        let num_draws = self.num_draws.unwrap_or(population);
        match self.sampling {
            Sampling::Permutation => {
                let mut indices = (0..population).collect::<Vec<_>>();
                if num_draws > population {
                    tracing::warn!(
                        "requested {} draws without replacement from only {} background \
                         cases; drawing all {} (use bootstrap sampling for more)",
                        num_draws,
                        population,
                        population
                    );
                } else if num_draws < population {
                    fastrand::Rng::with_seed(self.seed).shuffle(&mut indices);
                    indices.truncate(num_draws);
                }
                indices
            }
            Sampling::Bootstrap => (0..num_draws)
                .map(|i| fastrand::Rng::with_seed(draw_seed(self.seed, i)).usize(0..population))
                .collect(),
        }
    }

    /// Null distribution of `score(anchor, x)` for background cases `x`.
    pub fn anchored<F>(
        &self,
        anchor: &Case,
        background: &[Case],
        score: F,
    ) -> Result<NullDistribution, Error>
    where
        F: Fn(&Case, &Case) -> Result<f64, Error> + Sync,
    {
        let indices = self.indices(background.len());
        tracing::debug!(
            "drawing {} of {} background cases ({})",
            indices.len(),
            background.len(),
            self.sampling
        );
        let results = indices
            .par_iter()
            .map(|&idx| score(anchor, &background[idx]))
            .collect::<Vec<_>>();
        collect_draws(results)
    }

    /// Null distribution of `score(x, y)` for random pairs of distinct
    /// cohort members.
    pub fn pairs<F>(&self, cohort: &[Case], score: F) -> Result<NullDistribution, Error>
    where
        F: Fn(&Case, &Case) -> Result<f64, Error> + Sync,
    {
        let n = cohort.len();
        if n < 2 {
            tracing::warn!("need at least two cases to draw pairs, got {}", n);
            return Ok(NullDistribution::default());
        }
        let num_draws = self.num_draws.unwrap_or(n);
        let results = (0..num_draws)
            .into_par_iter()
            .map(|i| {
                let mut rng = fastrand::Rng::with_seed(draw_seed(self.seed, i));
                let lhs = rng.usize(0..n);
                let mut rhs = rng.usize(0..n - 1);
                if rhs >= lhs {
                    rhs += 1;
                }
                score(&cohort[lhs], &cohort[rhs])
            })
            .collect::<Vec<_>>();
        collect_draws(results)
    }
}

/// Collect per-draw results in draw order.
///
/// Draws failing with an isolated error are excluded and counted; any other
/// error aborts.
fn collect_draws(results: Vec<Result<f64, Error>>) -> Result<NullDistribution, Error> {
    let requested = results.len();
    let mut scores = Vec::with_capacity(requested);
    let mut excluded = 0;
    for (idx, result) in results.into_iter().enumerate() {
        match result {
            Ok(score) if score.is_finite() => scores.push(score),
            Ok(score) => {
                tracing::debug!("excluding draw {}: non-finite score {}", idx, score);
                excluded += 1;
            }
            Err(e) if e.is_isolated() => {
                tracing::debug!("excluding draw {}: {}", idx, e);
                excluded += 1;
            }
            Err(e) => return Err(e),
        }
    }
    if excluded > 0 {
        tracing::warn!(
            "excluded {} of {} draws from the null distribution",
            excluded,
            requested
        );
    }
    scores.sort_by(|a, b| a.total_cmp(b));
    Ok(NullDistribution {
        scores,
        requested,
        excluded,
    })
}
