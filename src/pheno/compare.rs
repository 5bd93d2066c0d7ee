//! Comparison of two cases and the contextualization of the result.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::pheno::algos::phenomizer::{self, SetSimilarity, TermMatch};
use crate::pheno::case::{excluded_positions, Case, PhenotypeSet};
use crate::pheno::conf::ScoringConfig;
use crate::pheno::embed::{EmbeddingAdapter, EmbeddingNetwork};
use crate::pheno::fusion::CompositeScore;
use crate::pheno::ontology::{OntologyGraph, TermId};
use crate::pheno::significance::{
    estimate_significance, Background, NullDistribution, Resampler, SignificanceResult,
};

/// Scores pairs of cases with a fixed ontology and configuration.
///
/// The scorer is shared read-only between resampling workers; only the
/// embedding cache inside the adapter is written to.
#[derive(Debug)]
pub struct CaseScorer<'a> {
    ontology: &'a OntologyGraph,
    adapter: EmbeddingAdapter,
    config: ScoringConfig,
    /// Positions of the excluded sub-DAGs.
    excluded: HashSet<usize>,
}

impl<'a> CaseScorer<'a> {
    pub fn new(
        ontology: &'a OntologyGraph,
        network: Arc<dyn EmbeddingNetwork>,
        config: ScoringConfig,
    ) -> Result<Self, Error> {
        let known = config
            .excluded_terms
            .iter()
            .filter_map(|term_id| match ontology.resolve(term_id.as_str()) {
                Ok(term) => Some(term.id().clone()),
                Err(_) => {
                    tracing::warn!("excluded term {} is not in the ontology, skipping", term_id);
                    None
                }
            })
            .collect::<Vec<TermId>>();
        let excluded = excluded_positions(ontology, &known)?;
        Ok(Self {
            ontology,
            adapter: EmbeddingAdapter::new(network, config.metric),
            config,
            excluded,
        })
    }

    pub fn ontology(&self) -> &OntologyGraph {
        self.ontology
    }

    pub fn adapter(&self) -> &EmbeddingAdapter {
        &self.adapter
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Normalize a term set and apply the configured filters.
    pub fn prepare_terms(&self, terms: &PhenotypeSet) -> Result<PhenotypeSet, Error> {
        let terms = terms.normalized(self.ontology)?;
        let terms = if self.excluded.is_empty() {
            terms
        } else {
            terms.without(self.ontology, &self.excluded)?
        };
        if self.config.remove_parents {
            terms.without_parents(self.ontology)
        } else {
            Ok(terms)
        }
    }

    pub fn phenotype_similarity(&self, a: &Case, b: &Case) -> Result<SetSimilarity, Error> {
        phenomizer::score(
            &self.prepare_terms(&a.terms)?,
            &self.prepare_terms(&b.terms)?,
            self.ontology,
            self.config.similarity,
            self.config.combiner,
        )
    }

    /// Composite similarity of two cases.
    pub fn score(&self, a: &Case, b: &Case) -> Result<CompositeScore, Error> {
        let phenotype = self.phenotype_similarity(a, b)?;
        let face = self
            .adapter
            .face_similarity(a.face.as_ref(), b.face.as_ref())?;
        Ok(self
            .config
            .fusion
            .fuse(&phenotype, face, &self.config.weights))
    }

    /// Best match in `a` for every term of `b`.
    pub fn term_matches(&self, a: &Case, b: &Case) -> Result<Vec<TermMatch>, Error> {
        phenomizer::best_matches(
            &self.prepare_terms(&a.terms)?,
            &self.prepare_terms(&b.terms)?,
            self.ontology,
            self.config.similarity,
        )
    }

    /// Composite similarities of all pairs of `cases`.
    ///
    /// Only the upper triangle is computed; the lower one is mirrored so the
    /// matrix is exactly symmetric.  Comparisons failing with an isolated
    /// error (e.g., an image that cannot be embedded) are left empty, other
    /// errors abort.
    pub fn similarity_matrix(&self, cases: &[Case]) -> Result<SimilarityMatrix, Error> {
        let n = cases.len();
        let pairs = (0..n)
            .flat_map(|i| (i..n).map(move |j| (i, j)))
            .collect::<Vec<_>>();
        let results = pairs
            .par_iter()
            .map(|&(i, j)| self.score(&cases[i], &cases[j]))
            .collect::<Vec<_>>();

        let mut scores = vec![vec![None; n]; n];
        let mut failed = 0;
        for (&(i, j), result) in pairs.iter().zip(results) {
            let value = match result {
                Ok(composite) => Some(composite.score),
                Err(e) if e.is_isolated() => {
                    tracing::debug!(
                        "no score for {} vs {}: {}",
                        cases[i].case_id,
                        cases[j].case_id,
                        e
                    );
                    failed += 1;
                    None
                }
                Err(e) => return Err(e),
            };
            scores[i][j] = value;
            scores[j][i] = value;
        }
        if failed > 0 {
            tracing::warn!("{} of {} comparisons failed", failed, pairs.len());
        }

        Ok(SimilarityMatrix {
            case_ids: cases.iter().map(|c| c.case_id.clone()).collect(),
            scores,
        })
    }

    /// Null distribution for comparisons of `anchor` with the background.
    pub fn null_distribution(
        &self,
        anchor: &Case,
        background: &Background,
        resampler: &Resampler,
    ) -> Result<NullDistribution, Error> {
        match background {
            Background::Scores(scores) => Ok(NullDistribution::from_scores(scores.clone())),
            Background::Cases(cases) => resampler.anchored(anchor, cases, |a, b| {
                self.score(a, b).map(|composite| composite.score)
            }),
        }
    }
}

/// Symmetric matrix of composite scores over a cohort.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SimilarityMatrix {
    /// Case IDs in row (and column) order.
    case_ids: Vec<String>,
    /// Composite scores; `None` for failed comparisons.
    scores: Vec<Vec<Option<f64>>>,
}

/// Mean similarity of one case to the labeled cases of a cohort.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct GroupAverages {
    /// Mean score against the other affected cases.
    pub affected: Option<f64>,
    /// Mean score against the unaffected cases.
    pub unaffected: Option<f64>,
}

impl SimilarityMatrix {
    pub fn case_ids(&self) -> &[String] {
        &self.case_ids
    }

    pub fn len(&self) -> usize {
        self.case_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.case_ids.is_empty()
    }

    /// Score of the cases at positions `i` and `j`.
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.scores.get(i).and_then(|row| row.get(j)).copied().flatten()
    }

    /// Per case, the mean score against the affected and the unaffected
    /// cases of the cohort, leaving out the case itself, unlabeled cases
    /// and failed comparisons.
    ///
    /// `labels` is indexed like the matrix rows; missing labels count as
    /// unlabeled.
    pub fn group_averages(&self, labels: &[Option<bool>]) -> Vec<GroupAverages> {
        let mean = |values: Vec<f64>| {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        (0..self.len())
            .map(|i| {
                let with_label = |label: bool| {
                    (0..self.len())
                        .filter(|&j| j != i && labels.get(j).copied().flatten() == Some(label))
                        .filter_map(|j| self.get(i, j))
                        .collect::<Vec<_>>()
                };
                GroupAverages {
                    affected: mean(with_label(true)),
                    unaffected: mean(with_label(false)),
                }
            })
            .collect()
    }
}

/// Compare two cases and rank the composite score against the background.
///
/// Weights and strategies come from the scorer's configuration; the seed
/// from the resampler.  For a background of raw cases, the null
/// distribution consists of the scores of `a` against the background cases.
/// Failures of the foreground comparison are returned as errors, while
/// failed embeddings of background draws only exclude those draws.
pub fn compare_cases(
    scorer: &CaseScorer,
    a: &Case,
    b: &Case,
    background: &Background,
    resampler: &Resampler,
) -> Result<SignificanceResult, Error> {
    let composite = scorer.score(a, b)?;
    tracing::debug!(
        "composite score of {} vs {}: {:?}",
        a.case_id,
        b.case_id,
        composite
    );
    let null = scorer.null_distribution(a, background, resampler)?;
    Ok(SignificanceResult {
        composite: Some(composite),
        ..estimate_significance(composite.score, &null)
    })
}

#[cfg(test)]
mod test {
    use float_cmp::approx_eq;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::pheno::algos::similarity::SimilarityMethod;
    use crate::pheno::case::Face;
    use crate::pheno::embed::fixtures::{image, StubNetwork};
    use crate::pheno::embed::EmbeddingTable;
    use crate::pheno::fusion::Weights;
    use crate::pheno::ontology::fixtures::toy_ontology;
    use crate::pheno::significance::{ResamplerBuilder, Sampling};

    fn case(id: &str, terms: &[&str], face: Option<Face>) -> Case {
        Case::new(id, terms.iter().copied().collect(), face)
    }

    fn stub() -> Arc<StubNetwork> {
        Arc::new(StubNetwork::with(&[
            ("img-a", vec![1.0, 0.0, 0.0]),
            ("img-b", vec![1.0, 0.0, 0.0]),
            ("img-c", vec![0.0, 1.0, 0.0]),
            ("img-nan", vec![f32::NAN, 1.0, 0.0]),
        ]))
    }

    /// 100 background cases, the images of three of them cannot be embedded.
    fn background_cases() -> Vec<Case> {
        (0..100)
            .map(|i| {
                let terms: &[&str] = match i % 3 {
                    0 => &["C"],
                    1 => &["D", "Lonely"],
                    _ => &["Other"],
                };
                let face = if [7, 42, 77].contains(&i) {
                    image(&format!("broken-{}", i))
                } else {
                    image(["img-a", "img-c"][i % 2])
                };
                case(&format!("bg-{}", i), terms, Some(face))
            })
            .collect()
    }

    #[rstest::rstest]
    fn score_fuses_components(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let a = case("a", &["E"], Some(image("img-a")));
        let b = case("b", &["E"], Some(image("img-b")));

        let res = scorer.score(&a, &b)?;

        assert_eq!(res.phenotype, 1.0);
        assert_eq!(res.face, Some(1.0));
        assert_eq!(res.score, 1.0);
        assert_eq!(scorer.adapter().cached(), 2);
        Ok(())
    }

    #[rstest::rstest]
    fn score_is_symmetric(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let a = case("a", &["C", "Lonely"], Some(image("img-a")));
        let b = case("b", &["D", "E", "A"], Some(image("img-c")));

        let ab = scorer.score(&a, &b)?;
        let ba = scorer.score(&b, &a)?;

        assert_eq!(ab.score.to_bits(), ba.score.to_bits());
        assert!(ab.score > 0.0 && ab.score < 1.0);
        Ok(())
    }

    #[rstest::rstest]
    fn empty_terms_fall_back_to_face(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let a = case("a", &[], Some(image("img-a")));
        let b = case("b", &["C"], Some(image("img-c")));

        let res = scorer.score(&a, &b)?;

        assert!(res.phenotype_degenerate);
        assert!(approx_eq!(f64, res.score, 0.5, ulps = 4));
        Ok(())
    }

    #[rstest::rstest]
    fn excluded_terms_and_parents(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let config = ScoringConfig {
            excluded_terms: vec!["Other".into()],
            remove_parents: true,
            ..Default::default()
        };
        let scorer = CaseScorer::new(&toy_ontology, stub(), config)?;

        assert_eq!(
            scorer.prepare_terms(&["Root", "A", "C", "Lonely", "E-OLD"].into_iter().collect())?,
            ["E"].into_iter().collect::<PhenotypeSet>()
        );
        Ok(())
    }

    #[traced_test]
    #[test]
    fn unknown_excluded_term_is_skipped() -> Result<(), Error> {
        let toy_ontology = toy_ontology(crate::pheno::ontology::fixtures::toy_source());
        let config = ScoringConfig {
            excluded_terms: vec!["Nope".into(), "Other".into()],
            ..Default::default()
        };
        let scorer = CaseScorer::new(&toy_ontology, stub(), config)?;

        assert_eq!(
            scorer.prepare_terms(&["C", "Lonely"].into_iter().collect())?,
            ["C"].into_iter().collect::<PhenotypeSet>()
        );
        assert!(logs_contain("excluded term Nope is not in the ontology"));
        Ok(())
    }

    #[rstest::rstest]
    fn default_exclusions_apply(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let mut source = crate::pheno::ontology::fixtures::toy_source();
        source.terms[1].term_id = "HP:0000271".into();
        source.terms[3].parents = vec!["HP:0000271".into()];
        let ontology = OntologyGraph::from_source(source)?;
        let scorer = CaseScorer::new(&ontology, stub(), ScoringConfig::default())?;

        // C and E sit below the excluded face sub-DAG
        assert_eq!(
            scorer.prepare_terms(&["C", "D", "E"].into_iter().collect())?,
            ["D"].into_iter().collect::<PhenotypeSet>()
        );
        // no default exclusion is part of the toy ontology
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        assert_eq!(scorer.prepare_terms(&["C", "E"].into_iter().collect())?.len(), 2);
        Ok(())
    }

    #[rstest::rstest]
    fn compare_with_precomputed_scores(toy_ontology: OntologyGraph) -> Result<(), anyhow::Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let resampler = ResamplerBuilder::default().seed(1).build()?;
        let a = case("a", &["E"], None);
        let b = case("b", &["E"], None);
        let background = Background::Scores(vec![0.1, 0.2, 0.3, 0.4, 0.5]);

        let res = compare_cases(&scorer, &a, &b, &background, &resampler)?;

        assert_eq!(res.observed, 1.0);
        assert!(approx_eq!(f64, res.p_value, 1.0 / 6.0, ulps = 2));
        assert_eq!(res.population_size, 5);
        assert_eq!(res.composite.map(|c| c.score), Some(1.0));
        Ok(())
    }

    #[rstest::rstest]
    fn compare_isolates_failed_background_draws(
        toy_ontology: OntologyGraph,
    ) -> Result<(), anyhow::Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let resampler = ResamplerBuilder::default().seed(1).build()?;
        let a = case("a", &["E"], Some(image("img-a")));
        let b = case("b", &["C"], Some(image("img-b")));
        let background = Background::Cases(background_cases());

        let res = compare_cases(&scorer, &a, &b, &background, &resampler)?;

        assert_eq!(res.requested_size, 100);
        assert_eq!(res.population_size, 97);
        assert_eq!(res.excluded, 3);
        assert!(res.p_value > 0.0 && res.p_value <= 1.0);
        Ok(())
    }

    #[rstest::rstest]
    fn compare_is_reproducible(
        toy_ontology: OntologyGraph,
        #[values(Sampling::Permutation, Sampling::Bootstrap)] sampling: Sampling,
    ) -> Result<(), anyhow::Error> {
        let a = case("a", &["E"], Some(image("img-a")));
        let b = case("b", &["C", "D"], Some(image("img-c")));
        let background = Background::Cases(background_cases());
        let run = || -> Result<SignificanceResult, anyhow::Error> {
            // fresh scorer to start with an empty embedding cache
            let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
            let resampler = ResamplerBuilder::default()
                .seed(42)
                .num_draws(50)
                .sampling(sampling)
                .build()?;
            Ok(compare_cases(&scorer, &a, &b, &background, &resampler)?)
        };

        assert_eq!(run()?, run()?);
        Ok(())
    }

    #[rstest::rstest]
    fn foreground_failure_is_surfaced(toy_ontology: OntologyGraph) -> Result<(), anyhow::Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let resampler = ResamplerBuilder::default().seed(1).build()?;
        let a = case("a", &["E"], Some(image("img-missing")));
        let b = case("b", &["C"], Some(image("img-b")));

        let err = compare_cases(&scorer, &a, &b, &Background::Scores(vec![]), &resampler)
            .unwrap_err();

        assert!(matches!(err, Error::EmbeddingUnavailable { key, .. } if key == "img-missing"));
        Ok(())
    }

    #[rstest::rstest]
    fn non_finite_foreground_embedding_is_surfaced(
        toy_ontology: OntologyGraph,
    ) -> Result<(), anyhow::Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let resampler = ResamplerBuilder::default().seed(1).build()?;
        let a = case("a", &["E"], Some(image("img-nan")));
        let b = case("b", &["C"], Some(image("img-b")));

        let err = compare_cases(&scorer, &a, &b, &Background::Scores(vec![0.5]), &resampler)
            .unwrap_err();
        assert_eq!(err, Error::InvalidEmbedding("img-nan".into()));

        let nan_vector = Face::Embedding(vec![f32::NAN, 0.0, 0.0].into());
        let precomputed = case("c", &["C"], Some(nan_vector));
        assert!(matches!(
            scorer.score(&precomputed, &b),
            Err(Error::InvalidEmbedding(_))
        ));
        Ok(())
    }

    #[rstest::rstest]
    fn non_finite_background_embedding_is_excluded(
        toy_ontology: OntologyGraph,
    ) -> Result<(), anyhow::Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let resampler = ResamplerBuilder::default().seed(1).build()?;
        let a = case("a", &["E"], Some(image("img-a")));
        let b = case("b", &["C"], Some(image("img-b")));
        let background = Background::Cases(
            (0..10)
                .map(|i| {
                    let face = image(if i < 2 { "img-nan" } else { "img-c" });
                    case(&format!("bg-{}", i), &["D"], Some(face))
                })
                .collect(),
        );

        let res = compare_cases(&scorer, &a, &b, &background, &resampler)?;

        assert_eq!(res.requested_size, 10);
        assert_eq!(res.population_size, 8);
        assert_eq!(res.excluded, 2);
        assert!(res.observed.is_finite());
        Ok(())
    }

    #[rstest::rstest]
    fn similarity_matrix(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let mut cases = vec![
            case("a", &["E"], Some(image("img-a"))),
            case("b", &["C", "Lonely"], Some(image("img-c"))),
            case("c", &[], None),
            case("d", &["D"], Some(image("img-broken"))),
        ];

        let matrix = scorer.similarity_matrix(&cases)?;

        assert_eq!(matrix.len(), 4);
        assert_eq!(matrix.case_ids(), ["a", "b", "c", "d"]);
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(
                    matrix.get(i, j).map(f64::to_bits),
                    matrix.get(j, i).map(f64::to_bits)
                );
            }
        }
        assert_eq!(matrix.get(0, 0), Some(1.0));
        assert_eq!(
            matrix.get(0, 1),
            Some(scorer.score(&cases[0], &cases[1])?.score)
        );
        // nothing to compare for an empty term set without a face
        assert_eq!(matrix.get(2, 2), Some(0.0));
        // the broken image only fails comparisons that use the face
        assert_eq!(matrix.get(3, 0), None);
        assert_eq!(matrix.get(3, 3), None);
        assert_eq!(matrix.get(3, 2), Some(0.0));

        cases[0].affected = Some(true);
        cases[1].affected = Some(true);
        cases[2].affected = Some(false);
        let labels = cases.iter().map(|c| c.affected).collect::<Vec<_>>();
        let averages = matrix.group_averages(&labels);
        assert_eq!(averages.len(), 4);
        assert_eq!(averages[0].affected, matrix.get(0, 1));
        assert_eq!(averages[0].unaffected, Some(0.0));
        assert_eq!(averages[2].unaffected, None);
        assert_eq!(averages[3].affected, matrix.get(3, 1));
        Ok(())
    }

    #[rstest::rstest]
    fn similarity_matrix_aborts_on_unknown_term(toy_ontology: OntologyGraph) {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())
            .expect("valid config");
        let cases = vec![case("a", &["E"], None), case("b", &["HP:404"], None)];

        assert_eq!(
            scorer.similarity_matrix(&cases).unwrap_err(),
            Error::UnknownTerm("HP:404".into())
        );
    }

    #[rstest::rstest]
    fn unknown_term_is_surfaced(toy_ontology: OntologyGraph) -> Result<(), anyhow::Error> {
        let scorer = CaseScorer::new(&toy_ontology, stub(), ScoringConfig::default())?;
        let a = case("a", &["E", "HP:404"], None);
        let b = case("b", &["C"], None);

        assert_eq!(
            scorer.score(&a, &b).unwrap_err(),
            Error::UnknownTerm("HP:404".into())
        );
        Ok(())
    }

    #[rstest::rstest]
    fn term_matches_for_report(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let config = ScoringConfig {
            similarity: SimilarityMethod::Lin,
            weights: Weights::new(1.0, 0.0)?,
            ..Default::default()
        };
        let scorer = CaseScorer::new(&toy_ontology, Arc::new(EmbeddingTable::default()), config)?;
        let a = case("a", &["C", "Lonely"], None);
        let b = case("b", &["C", "D"], None);

        let matches = scorer.term_matches(&a, &b)?;

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].term, "C".into());
        assert_eq!(matches[0].best_match, Some("C".into()));
        assert_eq!(matches[0].score, 1.0);
        Ok(())
    }
}
