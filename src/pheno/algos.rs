//! Phenotype-related algorithms.

/// Information content based similarity of two ontology terms.
pub mod similarity {
    use serde::{Deserialize, Serialize};

    use crate::err::Error;
    use crate::pheno::ontology::{OntologyGraph, OntologyTerm, TermId};

    /// Term similarity measure, all normalized to `[0, 1]`.
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
    pub enum SimilarityMethod {
        /// `2 * IC(MICA) / (IC(a) + IC(b))`
        #[default]
        Lin,
        /// Jiang & Conrath, `1 / (IC(a) + IC(b) - 2 * IC(MICA) + 1)`
        Jc,
        /// Sum of IC of common ancestors over sum of IC of all ancestors.
        GraphIc,
        /// Hybrid relative specificity similarity (Wu et al., 2013); the
        /// relative specificity of the MICA scaled by `1 / (1 + path length)`.
        Hrss,
    }

    /// Information content of the most informative common ancestor.
    ///
    /// Zero if the terms do not share an ancestor.
    pub fn resnik(o: &OntologyGraph, a: &OntologyTerm, b: &OntologyTerm) -> f64 {
        o.mica(a, b)
            .map(|term| term.information_content())
            .unwrap_or_default()
    }

    /// HRSS of two connected terms with the given MICA.
    ///
    /// The specificity of a term is the IC gap to its most informative leaf
    /// descendant.  The path length counts the edges from both terms up to
    /// the MICA.
    fn hrss(o: &OntologyGraph, a: &OntologyTerm, b: &OntologyTerm, mica: &OntologyTerm) -> f64 {
        let alpha = mica.information_content();
        if alpha == 0.0 {
            return 0.0;
        }
        let specificity =
            |t: &OntologyTerm| (t.leaf_information_content() - t.information_content()).max(0.0);
        let beta = (specificity(a) + specificity(b)) / 2.0;
        let gamma = match (
            o.distance_to_ancestor(a, mica),
            o.distance_to_ancestor(b, mica),
        ) {
            (Some(dist_a), Some(dist_b)) => (dist_a + dist_b) as f64,
            _ => return 0.0,
        };
        alpha / (alpha + beta) / (1.0 + gamma)
    }

    impl SimilarityMethod {
        /// Similarity of two terms given by their ID.
        pub fn score(&self, o: &OntologyGraph, a: &TermId, b: &TermId) -> Result<f64, Error> {
            let a = o.resolve(a.as_str())?;
            let b = o.resolve(b.as_str())?;
            Ok(self.calculate(o, a, b))
        }

        /// Similarity of two resolved terms.
        pub fn calculate(&self, o: &OntologyGraph, a: &OntologyTerm, b: &OntologyTerm) -> f64 {
            let ic_a = a.information_content();
            let ic_b = b.information_content();
            if a.idx() == b.idx() && ic_a > 0.0 {
                return 1.0;
            }
            let mica_term = match o.mica(a, b) {
                Some(mica) => mica,
                None => return 0.0,
            };
            let mica = mica_term.information_content();

            let score = match self {
                SimilarityMethod::Lin => {
                    let ic_combined = ic_a + ic_b;
                    if ic_combined == 0.0 {
                        0.0
                    } else {
                        2.0 * mica / ic_combined
                    }
                }
                SimilarityMethod::Jc => {
                    let distance = (ic_a + ic_b - 2.0 * mica).max(0.0);
                    1.0 / (distance + 1.0)
                }
                SimilarityMethod::GraphIc => {
                    let ic_union: f64 = o
                        .union_ancestors(a, b)
                        .map(|t| t.information_content())
                        .sum();
                    if ic_union == 0.0 {
                        0.0
                    } else {
                        let ic_common: f64 = o
                            .common_ancestors(a, b)
                            .map(|t| t.information_content())
                            .sum();
                        ic_common / ic_union
                    }
                }
                SimilarityMethod::Hrss => hrss(o, a, b, mica_term),
            };
            score.clamp(0.0, 1.0)
        }
    }
}

/// Best-match aggregation of term similarities into a set similarity.
pub mod phenomizer {
    use itertools::Itertools;
    use serde::{Deserialize, Serialize};

    use super::similarity::SimilarityMethod;
    use crate::err::Error;
    use crate::pheno::case::PhenotypeSet;
    use crate::pheno::ontology::{OntologyGraph, OntologyTerm, TermId};

    /// How to combine the best-match scores of both directions.
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
    pub enum Combiner {
        /// Average over the best matches of all terms of both sets.
        #[default]
        Bma,
        /// Mean of the two directed averages.
        FunSimAvg,
        /// Maximum of the two directed averages.
        FunSimMax,
    }

    /// Result of comparing two phenotype sets.
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
    pub struct SetSimilarity {
        /// The similarity score in `[0, 1]`.
        pub score: f64,
        /// Set if one of the sets was empty; `score` is `0.0` then but does
        /// not mean "no phenotypic overlap".
        pub degenerate: bool,
    }

    impl SetSimilarity {
        pub fn degenerate() -> Self {
            Self {
                score: 0.0,
                degenerate: true,
            }
        }
    }

    /// Best match for one term of the compared set.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct TermMatch {
        /// The term being matched.
        pub term: TermId,
        /// The best matching term of the other set, if any is similar at all.
        pub best_match: Option<TermId>,
        /// The similarity score.
        pub score: f64,
    }

    /// Resolve the terms of a set, keeping the first occurrence of terms
    /// that were given by more than one ID.
    fn resolve<'a>(
        set: &PhenotypeSet,
        o: &'a OntologyGraph,
    ) -> Result<Vec<&'a OntologyTerm>, Error> {
        Ok(set
            .iter()
            .map(|t| o.resolve(t.as_str()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unique_by(|t| t.idx())
            .collect())
    }

    /// Best match of `q` among `ds`, with the winning term.
    fn best_match<'a>(
        q: &OntologyTerm,
        ds: &[&'a OntologyTerm],
        o: &OntologyGraph,
        s: SimilarityMethod,
    ) -> (Option<&'a OntologyTerm>, f64) {
        ds.iter()
            .map(|d| (*d, s.calculate(o, q, d)))
            .fold((None, 0.0), |(best_term, best_score), (d, score)| {
                if score > best_score {
                    (Some(d), score)
                } else {
                    (best_term, best_score)
                }
            })
    }

    /// Sum of the best-match scores for each `q in qs` against `ds`.
    fn score_dir(
        qs: &[&OntologyTerm],
        ds: &[&OntologyTerm],
        o: &OntologyGraph,
        s: SimilarityMethod,
    ) -> f64 {
        qs.iter().map(|q| best_match(q, ds, o, s).1).sum()
    }

    /// Compute symmetric similarity score of two phenotype sets.
    ///
    /// Unknown terms are reported as [`Error::UnknownTerm`].  If either set
    /// is empty, a [`SetSimilarity`] flagged as degenerate is returned.
    pub fn score(
        a: &PhenotypeSet,
        b: &PhenotypeSet,
        o: &OntologyGraph,
        s: SimilarityMethod,
        combiner: Combiner,
    ) -> Result<SetSimilarity, Error> {
        let qs = resolve(a, o)?;
        let ds = resolve(b, o)?;
        if qs.is_empty() || ds.is_empty() {
            return Ok(SetSimilarity::degenerate());
        }

        let sum_q = score_dir(&qs, &ds, o, s);
        let sum_d = score_dir(&ds, &qs, o, s);
        let (len_q, len_d) = (qs.len() as f64, ds.len() as f64);
        let score = match combiner {
            Combiner::Bma => (sum_q + sum_d) / (len_q + len_d),
            Combiner::FunSimAvg => (sum_q / len_q + sum_d / len_d) / 2.0,
            Combiner::FunSimMax => (sum_q / len_q).max(sum_d / len_d),
        };

        Ok(SetSimilarity {
            score,
            degenerate: false,
        })
    }

    /// For each term in `b`, provide the term of `a` with the highest
    /// similarity, sorted by decreasing score.
    pub fn best_matches(
        a: &PhenotypeSet,
        b: &PhenotypeSet,
        o: &OntologyGraph,
        s: SimilarityMethod,
    ) -> Result<Vec<TermMatch>, Error> {
        let qs = resolve(a, o)?;
        let mut result = resolve(b, o)?
            .into_iter()
            .map(|d| {
                let (best_term, score) = best_match(d, &qs, o, s);
                TermMatch {
                    term: d.id().clone(),
                    best_match: best_term.map(|t| t.id().clone()),
                    score,
                }
            })
            .collect::<Vec<_>>();
        result.sort_by(|lhs, rhs| rhs.score.total_cmp(&lhs.score));
        Ok(result)
    }
}
